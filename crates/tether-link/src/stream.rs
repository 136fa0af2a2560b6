use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::SocketAddr,
    time::{Duration, Instant},
};

use mio::{Interest, Registry, Token, net::TcpStream};
use tracing::{debug, warn};

/// Quiet period after each completed frame write before the next frame may
/// start. Empirical constant carried from the reference deployment; do not
/// tune.
pub(crate) const POST_WRITE_QUIET: Duration = Duration::from_millis(200);

const RX_CHUNK: usize = 4096;

/// Response type for all stream calls.
///
/// `Alive` means the connection is still usable. `Down` means the peer is
/// gone and the owner must tear the connection down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LinkState {
    Alive,
    Down,
}

/// Single mio-backed TCP connection carrying newline-terminated frames.
///
/// Inbound:
///   - `drain_rx` reads until `WouldBlock`, appending to an accumulation
///     buffer; partial reads are joined.
///   - `next_line` pops one complete line (terminator included). Keepalives
///     surface like any other line; the owner needs them for deadline reset.
///
/// Outbound:
///   - `send_line` queues one whole frame and attempts to flush.
///   - `flush` drains the backlog: a partially written frame is continued
///     immediately so its bytes stay contiguous on the wire; a new frame is
///     only started once the post-write quiet period from the previous one
///     has elapsed. WRITABLE interest is armed only while a backlog exists.
///   - A backlog that makes no progress within the write timeout is a dead
///     peer.
pub(crate) struct LineStream {
    stream: TcpStream,
    token: Token,

    rx_buf: Vec<u8>,

    /// Whole frames waiting for the socket; the head may be partially
    /// written.
    send_backlog: VecDeque<Vec<u8>>,
    /// True while the head of the backlog has been partially written.
    mid_frame: bool,
    /// True if WRITABLE interest is currently registered.
    /// Invariant after `flush`: `writable_armed == !send_backlog.is_empty()`.
    writable_armed: bool,
    /// Head frame must complete by this instant.
    send_deadline: Option<Instant>,
    write_timeout: Duration,

    last_write: Instant,
    quiet_until: Instant,
}

impl LineStream {
    /// Opens an outbound non-blocking connection and registers it readable.
    pub(crate) fn connect(
        addr: SocketAddr,
        token: Token,
        registry: &Registry,
        write_timeout: Duration,
    ) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Self::from_stream(stream, token, registry, write_timeout)
    }

    /// Wraps an accepted inbound connection.
    pub(crate) fn from_stream(
        mut stream: TcpStream,
        token: Token,
        registry: &Registry,
        write_timeout: Duration,
    ) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        registry.register(&mut stream, token, Interest::READABLE)?;
        let now = Instant::now();
        Ok(Self {
            stream,
            token,
            rx_buf: Vec::with_capacity(RX_CHUNK),
            send_backlog: VecDeque::with_capacity(8),
            mid_frame: false,
            writable_armed: false,
            send_deadline: None,
            write_timeout,
            last_write: now,
            quiet_until: now,
        })
    }

    /// Prepends bytes that arrived before this stream took ownership of the
    /// socket (hub handshake residue).
    pub(crate) fn seed_rx(&mut self, residual: &[u8]) {
        self.rx_buf.extend_from_slice(residual);
    }

    /// Reads until the kernel would block. `Down` on peer FIN or a hard
    /// error.
    pub(crate) fn drain_rx(&mut self) -> LinkState {
        let mut chunk = [0u8; RX_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    debug!("link: peer closed");
                    return LinkState::Down;
                }
                Ok(n) => self.rx_buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return LinkState::Alive,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, "link: read fail");
                    return LinkState::Down;
                }
            }
        }
    }

    /// Pops one complete line, terminator included.
    pub(crate) fn next_line(&mut self) -> Option<Vec<u8>> {
        let nl = self.rx_buf.iter().position(|b| *b == b'\n')?;
        let rest = self.rx_buf.split_off(nl + 1);
        Some(std::mem::replace(&mut self.rx_buf, rest))
    }

    /// Queues one whole frame and flushes as far as the socket allows.
    pub(crate) fn send_line(&mut self, frame: &[u8], registry: &Registry) -> LinkState {
        self.send_backlog.push_back(frame.to_vec());
        self.flush(registry)
    }

    pub(crate) fn flush(&mut self, registry: &Registry) -> LinkState {
        while let Some(front) = self.send_backlog.front_mut() {
            if !self.mid_frame && Instant::now() < self.quiet_until {
                break;
            }
            match self.stream.write(front) {
                Ok(0) => {
                    warn!("link: zero-length write, closing");
                    return LinkState::Down;
                }
                Ok(n) if n == front.len() => {
                    self.send_backlog.pop_front();
                    self.mid_frame = false;
                    self.last_write = Instant::now();
                    self.quiet_until = self.last_write + POST_WRITE_QUIET;
                    self.send_deadline = if self.send_backlog.is_empty() {
                        None
                    } else {
                        Some(Instant::now() + self.write_timeout)
                    };
                }
                Ok(n) => {
                    front.drain(..n);
                    self.mid_frame = true;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, "link: write fail");
                    return LinkState::Down;
                }
            }
        }

        if self.send_backlog.is_empty() {
            self.send_deadline = None;
            // Drop WRITABLE interest only when fully drained.
            if self.writable_armed {
                if let Err(err) =
                    registry.reregister(&mut self.stream, self.token, Interest::READABLE)
                {
                    debug!(?err, "link: reregister drop writable");
                    return LinkState::Down;
                }
                self.writable_armed = false;
            }
            return LinkState::Alive;
        }

        let deadline = *self
            .send_deadline
            .get_or_insert_with(|| Instant::now() + self.write_timeout);
        if Instant::now() >= deadline {
            warn!("link: write timed out, closing");
            return LinkState::Down;
        }
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(?err, "link: arm writable");
                return LinkState::Down;
            }
            self.writable_armed = true;
        }
        LinkState::Alive
    }

    /// Time since the last completed frame write, for keepalive pacing.
    pub(crate) fn idle_for(&self) -> Duration {
        self.last_write.elapsed()
    }

    pub(crate) fn backlog_empty(&self) -> bool {
        self.send_backlog.is_empty()
    }

    pub(crate) fn close(&mut self, registry: &Registry) {
        debug!("link: closing connection");
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Shrink the kernel accept backlog on an already-listening socket.
/// `listen(2)` may be called again on a listening socket to adjust it.
pub(crate) fn set_listen_backlog(listener: &mio::net::TcpListener, backlog: usize) {
    use std::os::fd::AsRawFd;
    let fd = listener.as_raw_fd();
    unsafe {
        libc::listen(fd, backlog as libc::c_int);
    }
}
