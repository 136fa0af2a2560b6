use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use tether_link::{Client, ClientConfig};

const TO: Duration = Duration::from_millis(600);

/// Reads lines off a scripted peer socket while feeding the client's read
/// deadline with keepalives, so a withheld ACK does not look like an outage.
struct FedScript {
    stream: TcpStream,
    buf: Vec<u8>,
    last_fed: Instant,
}

impl FedScript {
    fn new(stream: TcpStream) -> Self {
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .expect("failed to set read timeout");
        Self { stream, buf: Vec::new(), last_fed: Instant::now() }
    }

    fn feed(&mut self) {
        if self.last_fed.elapsed() >= Duration::from_millis(200) {
            self.last_fed = Instant::now();
            self.stream.write_all(b"\n").expect("keepalive feed failed");
        }
    }

    /// Next non-keepalive line, feeding keepalives while waiting.
    fn next_frame(&mut self, patience: Duration) -> Vec<u8> {
        let deadline = Instant::now() + patience;
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(nl) = self.buf.iter().position(|b| *b == b'\n') {
                let rest = self.buf.split_off(nl + 1);
                let line = std::mem::replace(&mut self.buf, rest);
                if line != b"\n" {
                    return line;
                }
                continue;
            }
            assert!(Instant::now() < deadline, "no frame within {patience:?}");
            self.feed();
            match self.stream.read(&mut chunk) {
                Ok(0) => panic!("client closed unexpectedly"),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(_) => {}
            }
        }
    }

    fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("script write failed");
    }
}

fn read_id_line(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    while !buf.contains(&b'\n') {
        let n = stream.read(&mut chunk).expect("id read failed");
        assert_ne!(n, 0, "client closed before sending id");
        buf.extend_from_slice(&chunk[..n]);
    }
    buf
}

/// A swallowed ACK triggers a retransmit of the identical frame about a
/// second later; the late ACK then releases the blocked write.
#[test]
fn retransmits_until_acked() {
    let listener = TcpListener::bind("127.0.0.1:24751").expect("failed to bind script listener");

    let client = thread::spawn(move || {
        let cfg = ClientConfig::new("devA", "127.0.0.1").with_port(24751).with_timeout(TO);
        let mut client = Client::new(cfg).expect("failed to build client");
        client.await_connected().expect("connect failed");
        let start = Instant::now();
        client.write(b"payload", true, true).expect("qos write failed");
        // One full ACK-wait cycle must have passed before the repeat.
        assert!(start.elapsed() >= Duration::from_millis(900));
        client.close();
    });

    let (mut stream, _) = listener.accept().expect("accept failed");
    assert_eq!(read_id_line(&mut stream), b"devA\n");
    let mut hub = FedScript::new(stream);
    hub.send(b"\n");

    assert_eq!(hub.next_frame(Duration::from_secs(3)), b"00payload\n");
    // Withhold the ACK: the client must repeat the same bytes, same id.
    assert_eq!(hub.next_frame(Duration::from_secs(3)), b"00payload\n");
    hub.send(b"00\n");

    client.join().expect("client thread panicked");
}

/// Severing the TCP connection while a QoS write is in flight: the client
/// reconnects transparently and the frame is delivered on the new socket.
#[test]
fn qos_write_survives_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:24752").expect("failed to bind script listener");

    let client = thread::spawn(move || {
        let cfg = ClientConfig::new("devA", "127.0.0.1").with_port(24752).with_timeout(TO);
        let mut client = Client::new(cfg).expect("failed to build client");
        client.await_connected().expect("connect failed");
        client.write(b"one", true, true).expect("first write failed");
        // The peer dies while this one is outstanding.
        client.write(b"two", true, true).expect("in-flight write failed");
        assert!(client.status());
        assert_eq!(client.connects(), 2);
        client.close();
    });

    let (mut stream, _) = listener.accept().expect("accept failed");
    assert_eq!(read_id_line(&mut stream), b"devA\n");
    let mut hub = FedScript::new(stream);
    hub.send(b"\n");
    assert_eq!(hub.next_frame(Duration::from_secs(3)), b"00one\n");
    hub.send(b"00\n");
    assert_eq!(hub.next_frame(Duration::from_secs(3)), b"01two\n");
    // Kill the connection instead of ACKing.
    drop(hub);

    // The client holds off two timeouts before coming back.
    let (mut stream, _) = listener.accept().expect("re-accept failed");
    assert_eq!(read_id_line(&mut stream), b"devA\n");
    let mut hub = FedScript::new(stream);
    hub.send(b"\n");
    assert_eq!(hub.next_frame(Duration::from_secs(5)), b"01two\n");
    hub.send(b"01\n");

    client.join().expect("client thread panicked");
}
