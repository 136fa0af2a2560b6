use std::{
    collections::{BTreeSet, VecDeque},
    io::{self, Read},
    net::{Shutdown, SocketAddr},
    time::{Duration, Instant},
};

use mio::{Events, Interest, Poll, Token, net::TcpListener};
use serde::{Deserialize, Serialize};
use tether_proto::{DedupWindow, Frame, MidGen, RESTART_ID, encode_ack, encode_data, parse};
use tracing::{debug, info, trace, warn};

use crate::{
    error::LinkError,
    stream::{LineStream, LinkState, POST_WRITE_QUIET, set_listen_backlog},
    timing::{Deadline, Repeater},
};

const LISTENER: Token = Token(0);

/// Pacing for busy-wait loops in the blocking calls.
const IDLE_SLICE: Duration = Duration::from_millis(50);

fn default_port() -> u16 {
    8123
}

fn default_timeout() -> Duration {
    Duration::from_millis(1500)
}

/// Hub endpoint configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubConfig {
    /// Client identifiers this deployment expects to see.
    pub expected: Vec<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// The single link tunable; every interval in the engine derives from it.
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
    /// Raises per-frame events from trace to debug level.
    #[serde(default)]
    pub verbose: bool,
}

impl HubConfig {
    pub fn new<I, S>(expected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            expected: expected.into_iter().map(Into::into).collect(),
            port: default_port(),
            timeout: default_timeout(),
            verbose: false,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// An accepted socket whose identifier line has not arrived yet.
struct Pending {
    token: Token,
    stream: mio::net::TcpStream,
    buf: Vec<u8>,
    deadline: Deadline,
}

struct QosCheck {
    due: Instant,
    frame: Vec<u8>,
}

/// Server-side state for one client identifier.
///
/// Created on the first appearance of the id and never discarded: when the
/// client drops, the socket is cleared and a later reconnect grafts a fresh
/// one in, so server application handles survive outages. At most one
/// `Connection` exists per identifier.
pub struct Connection {
    client_id: String,
    token: Token,
    stream: Option<LineStream>,

    mids: MidGen,
    dedup: DedupWindow,
    /// Hub just started: deliver the first application line even if its id
    /// is not strictly new (the client may have kept its allocator across a
    /// hub restart).
    init: bool,
    /// Delay after a (re)connect before the first non-ACK write, giving the
    /// client time to start its read task.
    wr_pause_until: Option<Instant>,

    lines: VecDeque<Vec<u8>>,
    read_deadline: Deadline,
    keepalive: Repeater,
    qos_checks: Vec<QosCheck>,
    resend: VecDeque<Vec<u8>>,
    tx_queue: VecDeque<Vec<u8>>,
    ack_queue: VecDeque<u8>,
    connects: u32,
}

impl Connection {
    fn new(client_id: String, timeout: Duration) -> Self {
        Self {
            client_id,
            token: Token(usize::MAX),
            stream: None,
            mids: MidGen::new(),
            dedup: DedupWindow::new(),
            init: true,
            wr_pause_until: None,
            lines: VecDeque::new(),
            read_deadline: Deadline::after(timeout * 2),
            keepalive: Repeater::every(timeout * 2 / 3),
            qos_checks: Vec::new(),
            resend: VecDeque::new(),
            tx_queue: VecDeque::new(),
            ack_queue: VecDeque::new(),
            connects: 0,
        }
    }

    fn attach(&mut self, mut stream: LineStream, token: Token, residual: &[u8], timeout: Duration) {
        stream.seed_rx(residual);
        self.token = token;
        self.stream = Some(stream);
        self.connects += 1;
        self.wr_pause_until = Some(Instant::now() + POST_WRITE_QUIET);
        self.read_deadline.reset(timeout * 2);
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// True while a socket is grafted in.
    pub fn status(&self) -> bool {
        self.stream.is_some()
    }

    /// Successful (re)connects for this identifier, for diagnostics.
    pub fn connects(&self) -> u32 {
        self.connects
    }
}

/// Hub endpoint of the link: accepts many clients, keeps one persistent
/// [`Connection`] per identifier and hides reconnection from server-side
/// application code.
///
/// Single-threaded like the client engine; the blocking calls pump
/// [`poll_once`](Self::poll_once) internally, so every connection keeps its
/// keepalives, ACKs and QoS checks running while an application waits on one
/// of them.
pub struct Hub {
    cfg: HubConfig,
    poll: Poll,
    events: Events,
    listener: TcpListener,
    expected: BTreeSet<String>,
    pending: Vec<Pending>,
    conns: Vec<Connection>,
    next_token: usize,
    closed: bool,
}

impl Hub {
    /// Binds the listening socket and starts accepting.
    pub fn new(cfg: HubConfig) -> Result<Self, LinkError> {
        let poll = Poll::new()?;
        let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
        let mut listener = TcpListener::bind(addr)?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        // Two spare slots so duplicate or unexpected clients still get
        // accepted and diagnosed.
        set_listen_backlog(&listener, cfg.expected.len() + 2);
        info!(port = cfg.port, "hub: listening");
        let expected = cfg.expected.iter().cloned().collect();
        Ok(Self {
            cfg,
            poll,
            events: Events::with_capacity(128),
            listener,
            expected,
            pending: Vec::new(),
            conns: Vec::new(),
            next_token: 1,
            closed: false,
        })
    }

    // **** API ****

    /// One engine tick across the listener and every connection. Sleeps at
    /// most `max_wait` waiting for IO.
    pub fn poll_once(&mut self, max_wait: Duration) {
        if self.closed {
            return;
        }
        if let Err(err) = self.poll.poll(&mut self.events, Some(max_wait)) {
            if err.kind() != io::ErrorKind::Interrupted {
                warn!(?err, "hub: poll fail");
            }
            return;
        }
        let mut accept = false;
        let mut ready = Vec::new();
        for ev in self.events.iter() {
            if ev.token() == LISTENER {
                accept = true;
            } else if ev.is_readable() {
                ready.push(ev.token());
            }
        }
        if accept {
            self.accept_new();
        }
        for token in ready {
            self.on_token_readable(token);
        }
        self.tick_pending();
        for idx in 0..self.conns.len() {
            self.tick_conn(idx);
        }
    }

    /// Borrow the persistent state for one client, if it has ever appeared.
    pub fn connection(&self, client_id: &str) -> Option<&Connection> {
        self.conns.iter().find(|c| c.client_id == client_id)
    }

    /// Blocks until `client_id` has a live connection.
    pub fn wait_for(&mut self, client_id: &str) {
        while !self.connection(client_id).is_some_and(Connection::status) {
            self.poll_once(IDLE_SLICE);
        }
    }

    /// Blocks until every expected client has appeared (`None`), or until
    /// every named peer has (`Some`).
    pub fn wait_all(&mut self, peers: Option<&[&str]>) {
        match peers {
            None => {
                while !self.expected.is_empty() {
                    self.poll_once(IDLE_SLICE);
                }
            }
            Some(list) => {
                while !list.iter().all(|id| self.conns.iter().any(|c| c.client_id == *id)) {
                    self.poll_once(IDLE_SLICE);
                }
            }
        }
    }

    /// Takes the next buffered application line for `client_id`, if any.
    pub fn try_readline(&mut self, client_id: &str) -> Option<Vec<u8>> {
        let idx = self.index_of(client_id)?;
        self.conns[idx].lines.pop_front()
    }

    /// Blocks until the next application line from `client_id` arrives.
    /// Blocks across outages rather than failing.
    pub fn readline(&mut self, client_id: &str) -> Vec<u8> {
        loop {
            if let Some(line) = self.try_readline(client_id) {
                return line;
            }
            self.poll_once(IDLE_SLICE);
        }
    }

    /// Sends one application line to `client_id`, blocking until the bytes
    /// have reached the socket (across outages if need be). A QoS check
    /// fires one timeout later and repeats the identical frame if the
    /// connection was down at that point. With `pause`, the call sleeps out
    /// the remainder of one timeout window: at most one message per window.
    pub fn write(&mut self, client_id: &str, line: &[u8], pause: bool) {
        let start = Instant::now();
        let timeout = self.cfg.timeout;
        self.wait_for(client_id);
        let Some(idx) = self.index_of(client_id) else { return };
        let frame = {
            let conn = &mut self.conns[idx];
            let mid = conn.mids.next();
            let mut frame = Vec::with_capacity(line.len() + 3);
            encode_data(mid, line, &mut frame);
            conn.tx_queue.push_back(frame.clone());
            conn.qos_checks.push(QosCheck { due: start + timeout, frame: frame.clone() });
            frame
        };
        loop {
            let Some(idx) = self.index_of(client_id) else { return };
            let conn = &self.conns[idx];
            let queued = conn.tx_queue.iter().chain(conn.resend.iter()).any(|f| *f == frame);
            if !queued {
                break;
            }
            self.poll_once(IDLE_SLICE);
        }
        if pause {
            while start.elapsed() < timeout {
                self.poll_once(IDLE_SLICE);
            }
        }
    }

    /// Closes every connection and stops listening.
    pub fn close_all(&mut self) {
        if self.closed {
            return;
        }
        for idx in 0..self.conns.len() {
            self.close_conn(idx, "hub shutdown");
        }
        while !self.pending.is_empty() {
            self.drop_pending(0);
        }
        let _ = self.poll.registry().deregister(&mut self.listener);
        self.closed = true;
        info!("hub: closed");
    }

    // **** Accept / handshake ****

    fn accept_new(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(err) =
                        self.poll.registry().register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(?err, "hub: register accepted socket fail");
                        let _ = stream.shutdown(Shutdown::Both);
                        continue;
                    }
                    debug!(?addr, "hub: connection accepted, awaiting id");
                    self.pending.push(Pending {
                        token,
                        stream,
                        buf: Vec::new(),
                        deadline: Deadline::after(self.cfg.timeout),
                    });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(?err, "hub: accept fail");
                    return;
                }
            }
        }
    }

    fn on_token_readable(&mut self, token: Token) {
        if let Some(idx) = self.pending.iter().position(|p| p.token == token) {
            self.read_pending(idx);
        } else if let Some(idx) =
            self.conns.iter().position(|c| c.token == token && c.stream.is_some())
        {
            self.read_conn(idx);
        }
    }

    fn read_pending(&mut self, idx: usize) {
        let mut chunk = [0u8; 1024];
        loop {
            match self.pending[idx].stream.read(&mut chunk) {
                Ok(0) => {
                    debug!("hub: peer closed before sending an id");
                    self.drop_pending(idx);
                    return;
                }
                Ok(n) => {
                    self.pending[idx].buf.extend_from_slice(&chunk[..n]);
                    if let Some(nl) = self.pending[idx].buf.iter().position(|b| *b == b'\n') {
                        let mut p = self.pending.swap_remove(idx);
                        let _ = self.poll.registry().deregister(&mut p.stream);
                        match String::from_utf8(p.buf[..nl].to_vec()) {
                            Ok(id) if !id.is_empty() => {
                                let residual = p.buf[nl + 1..].to_vec();
                                self.admit(id, &residual, p.stream, p.token);
                            }
                            _ => {
                                warn!("hub: unusable id line, closing");
                                let _ = p.stream.shutdown(Shutdown::Both);
                            }
                        }
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, "hub: id read fail");
                    self.drop_pending(idx);
                    return;
                }
            }
        }
    }

    fn drop_pending(&mut self, idx: usize) {
        let mut p = self.pending.swap_remove(idx);
        let _ = self.poll.registry().deregister(&mut p.stream);
        let _ = p.stream.shutdown(Shutdown::Both);
    }

    /// Routes a completed handshake. The socket arrives deregistered.
    fn admit(
        &mut self,
        client_id: String,
        residual: &[u8],
        stream: mio::net::TcpStream,
        token: Token,
    ) {
        if let Some(idx) = self.conns.iter().position(|c| c.client_id == client_id) {
            if self.conns[idx].stream.is_some() {
                // First claimant keeps the slot.
                warn!(client_id = %client_id, "hub: duplicate client ignored");
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
            match LineStream::from_stream(stream, token, self.poll.registry(), self.cfg.timeout) {
                Ok(ls) => {
                    info!(client_id = %client_id, "hub: client reconnected");
                    self.conns[idx].attach(ls, token, residual, self.cfg.timeout);
                    self.process_conn_lines(idx);
                }
                Err(err) => warn!(?err, client_id = %client_id, "hub: reconnect attach fail"),
            }
            return;
        }

        if self.expected.remove(&client_id) {
            info!(client_id = %client_id, "hub: client connected");
        } else {
            warn!(client_id = %client_id, expected = ?self.expected, "hub: unknown client connected");
        }
        let mut conn = Connection::new(client_id, self.cfg.timeout);
        match LineStream::from_stream(stream, token, self.poll.registry(), self.cfg.timeout) {
            Ok(ls) => conn.attach(ls, token, residual, self.cfg.timeout),
            Err(err) => warn!(?err, client_id = %conn.client_id, "hub: attach fail"),
        }
        self.conns.push(conn);
        self.process_conn_lines(self.conns.len() - 1);
    }

    // **** Per-connection reader ****

    fn read_conn(&mut self, idx: usize) {
        let down = match self.conns[idx].stream.as_mut() {
            Some(stream) => stream.drain_rx() == LinkState::Down,
            None => return,
        };
        self.process_conn_lines(idx);
        if down {
            self.close_conn(idx, "reader fail");
        }
    }

    fn process_conn_lines(&mut self, idx: usize) {
        loop {
            let Some(line) = self.conns[idx].stream.as_mut().and_then(|s| s.next_line()) else {
                break;
            };
            if !self.on_conn_line(idx, &line) {
                self.close_conn(idx, "malformed frame");
                break;
            }
        }
    }

    fn on_conn_line(&mut self, idx: usize, line: &[u8]) -> bool {
        let timeout = self.cfg.timeout;
        let verbose = self.cfg.verbose;
        let conn = &mut self.conns[idx];
        conn.read_deadline.reset(timeout);
        match parse(line) {
            Ok(Frame::Keepalive) => {
                trace!(client_id = %conn.client_id, "hub: keepalive");
            }
            Ok(Frame::Ack { mid }) => {
                // Hub QoS is time-based; inbound ACKs carry no state here.
                trace!(client_id = %conn.client_id, mid, "hub: ack");
            }
            Ok(Frame::Data { mid, payload }) => {
                conn.ack_queue.push_back(mid);
                if mid == RESTART_ID {
                    // Client power-cycled: its allocator starts over.
                    conn.dedup.reset();
                }
                let fresh = conn.dedup.is_new(mid);
                if conn.init || mid == RESTART_ID || fresh {
                    conn.init = false;
                    if verbose {
                        debug!(client_id = %conn.client_id, mid, len = payload.len(), "hub: rx");
                    }
                    conn.lines.push_back(payload.to_vec());
                }
            }
            Err(err) => {
                debug!(?err, bytes = ?line, client_id = %conn.client_id, "hub: malformed frame");
                return false;
            }
        }
        true
    }

    // **** Per-connection writer / keepalive / QoS ****

    fn tick_pending(&mut self) {
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].deadline.expired() {
                debug!("hub: no id line before deadline, closing");
                self.drop_pending(i);
            } else {
                i += 1;
            }
        }
    }

    fn tick_conn(&mut self, idx: usize) {
        if self.conns[idx].stream.is_some() && self.conns[idx].read_deadline.expired() {
            self.close_conn(idx, "read timeout");
            return;
        }
        {
            let conn = &mut self.conns[idx];
            let live = conn.stream.is_some();
            let now = Instant::now();
            let mut j = 0;
            while j < conn.qos_checks.len() {
                if now >= conn.qos_checks[j].due {
                    let check = conn.qos_checks.swap_remove(j);
                    if !live {
                        // The outage may have swallowed the original; repeat
                        // it once the client is back.
                        debug!(client_id = %conn.client_id, "hub: queueing repeat");
                        conn.resend.push_back(check.frame);
                    }
                } else {
                    j += 1;
                }
            }
        }
        if let Some(cause) = self.service_conn_writes(idx) {
            self.close_conn(idx, cause);
        }
    }

    fn service_conn_writes(&mut self, idx: usize) -> Option<&'static str> {
        let verbose = self.cfg.verbose;
        let registry = self.poll.registry();
        let conn = &mut self.conns[idx];
        let stream = conn.stream.as_mut()?;

        // ACKs go out regardless of the write pause.
        while let Some(&mid) = conn.ack_queue.front() {
            let mut buf = Vec::with_capacity(3);
            encode_ack(mid, &mut buf);
            if stream.send_line(&buf, registry) == LinkState::Down {
                return Some("sendack fail");
            }
            conn.ack_queue.pop_front();
        }

        // Everything else waits out the post-(re)connect pause.
        if let Some(until) = conn.wr_pause_until {
            if Instant::now() < until {
                return None;
            }
            conn.wr_pause_until = None;
        }

        if stream.backlog_empty() {
            if let Some(frame) = conn.resend.pop_front().or_else(|| conn.tx_queue.pop_front()) {
                if verbose {
                    debug!(client_id = %conn.client_id, len = frame.len(), "hub: tx");
                }
                if stream.send_line(&frame, registry) == LinkState::Down {
                    return Some("writer fail");
                }
            }
        }

        if stream.backlog_empty() && conn.keepalive.fired() {
            trace!(client_id = %conn.client_id, "hub: keepalive out");
            if stream.send_line(b"\n", registry) == LinkState::Down {
                return Some("keepalive fail");
            }
        }

        if stream.flush(registry) == LinkState::Down {
            return Some("writer fail");
        }
        None
    }

    fn close_conn(&mut self, idx: usize, cause: &str) {
        let registry = self.poll.registry();
        let conn = &mut self.conns[idx];
        if let Some(stream) = conn.stream.as_mut() {
            warn!(client_id = %conn.client_id, cause, "hub: connection lost");
            stream.close(registry);
        }
        conn.stream = None;
        // Unsent ACKs die with the socket; the client re-sends the data.
        conn.ack_queue.clear();
    }

    fn index_of(&self, client_id: &str) -> Option<usize> {
        self.conns.iter().position(|c| c.client_id == client_id)
    }
}
