use std::{
    io::{Read, Write},
    net::TcpStream,
    thread,
    time::{Duration, Instant},
};

use tether_link::{Connection, Hub, HubConfig};

const TO: Duration = Duration::from_millis(600);

/// Minimal scripted client: blocking socket, keepalive feeding, line split.
struct ScriptClient {
    stream: TcpStream,
    buf: Vec<u8>,
    last_fed: Instant,
}

impl ScriptClient {
    fn connect(port: u16, id: &str) -> Self {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("script connect failed");
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .expect("failed to set read timeout");
        stream.write_all(id.as_bytes()).expect("id send failed");
        stream.write_all(b"\n").expect("id send failed");
        Self { stream, buf: Vec::new(), last_fed: Instant::now() }
    }

    fn feed(&mut self) {
        if self.last_fed.elapsed() >= Duration::from_millis(200) {
            self.last_fed = Instant::now();
            let _ = self.stream.write_all(b"\n");
        }
    }

    fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("script send failed");
    }

    /// Collects lines for `window`, feeding keepalives throughout.
    fn collect_for(&mut self, window: Duration) -> Vec<Vec<u8>> {
        let end = Instant::now() + window;
        let mut lines = Vec::new();
        let mut chunk = [0u8; 1024];
        while Instant::now() < end {
            self.feed();
            match self.stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(_) => {}
            }
            while let Some(nl) = self.buf.iter().position(|b| *b == b'\n') {
                let rest = self.buf.split_off(nl + 1);
                lines.push(std::mem::replace(&mut self.buf, rest));
            }
        }
        lines
    }

    /// Next non-keepalive line, feeding while waiting.
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
                Ok(0) => panic!("hub closed the connection"),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(_) => {}
            }
        }
    }
}

/// Expected clients are admitted, unknown ones still get a connection, and
/// a second claimant of a live identifier is cut off without disturbing the
/// first.
#[test]
fn admits_unknown_and_rejects_duplicate() {
    let mut hub = Hub::new(HubConfig::new(["devA"]).with_port(24761).with_timeout(TO))
        .expect("failed to bind hub");

    let first = thread::spawn(move || {
        let mut client = ScriptClient::connect(24761, "devA");
        client.send(b"05ping\n");
        client.collect_for(Duration::from_millis(2000))
    });

    hub.wait_for("devA");

    let duplicate = thread::spawn(move || {
        let mut client = ScriptClient::connect(24761, "devA");
        // The hub must close this socket; reads end in EOF, not traffic.
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut chunk = [0u8; 256];
        loop {
            assert!(Instant::now() < deadline, "duplicate socket was never closed");
            match client.stream.read(&mut chunk) {
                Ok(0) => return,
                Ok(_) => panic!("duplicate client received traffic"),
                Err(_) => {}
            }
        }
    });

    let ghost = thread::spawn(move || {
        let mut client = ScriptClient::connect(24761, "ghost");
        client.send(b"00hi\n");
        let frame = client.next_frame(Duration::from_secs(3));
        assert_eq!(frame, b"00\n", "expected an ACK for the data frame");
    });

    let end = Instant::now() + Duration::from_millis(2500);
    while Instant::now() < end {
        hub.poll_once(Duration::from_millis(50));
    }

    let first_lines = first.join().expect("first client panicked");
    duplicate.join().expect("duplicate client panicked");
    ghost.join().expect("ghost client panicked");

    // The legitimate client got its data ACKed and saw hub keepalives.
    assert!(first_lines.iter().any(|l| l == b"05\n"), "data frame was not ACKed");
    assert!(first_lines.iter().any(|l| l == b"\n"), "no hub keepalive observed");
    assert_eq!(hub.try_readline("devA"), Some(b"ping\n".to_vec()));

    // The unknown id still ended up with a working connection.
    assert!(hub.connection("ghost").is_some());
    assert_eq!(hub.try_readline("ghost"), Some(b"hi\n".to_vec()));

    hub.close_all();
}

/// A hub write whose timeout window ends during an outage is repeated,
/// bytes and id identical, once the client is back.
#[test]
fn write_repeats_after_outage() {
    let mut hub = Hub::new(HubConfig::new(["devB"]).with_port(24762).with_timeout(TO))
        .expect("failed to bind hub");

    let script = thread::spawn(move || {
        let mut frames = Vec::new();
        let mut client = ScriptClient::connect(24762, "devB");
        frames.push(client.next_frame(Duration::from_secs(3)));
        // Die without ACKing, past the hub's QoS checkpoint.
        drop(client);
        thread::sleep(Duration::from_millis(800));
        let mut client = ScriptClient::connect(24762, "devB");
        frames.push(client.next_frame(Duration::from_secs(3)));
        frames
    });

    hub.wait_for("devB");
    hub.write("devB", b"alert", false);

    let end = Instant::now() + Duration::from_secs(3);
    while Instant::now() < end {
        hub.poll_once(Duration::from_millis(50));
    }

    let frames = script.join().expect("script client panicked");
    assert_eq!(frames, vec![b"00alert\n".to_vec(), b"00alert\n".to_vec()]);
    assert_eq!(hub.connection("devB").map(Connection::connects), Some(2));

    hub.close_all();
}
