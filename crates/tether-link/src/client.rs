use std::{
    collections::VecDeque,
    io,
    net::ToSocketAddrs,
    time::{Duration, Instant},
};

use mio::{Events, Poll, Token};
use serde::{Deserialize, Serialize};
use tether_proto::{AckSet, DedupWindow, Frame, MidGen, RESTART_ID, encode_ack, encode_data, parse};
use tracing::{debug, info, trace, warn};

use crate::{
    error::LinkError,
    netif::{AlwaysUp, FatalOnFirstAttempt, NetworkInterface, Recovery},
    stream::{LineStream, LinkState},
    timing::{Deadline, Repeater},
};

const STREAM: Token = Token(0);

/// Settle time after construction before touching the network, giving the
/// platform a chance to restore a prior link on its own.
const BOOT_SETTLE: Duration = Duration::from_secs(1);
/// How long one network acquisition pass may take before it counts as failed.
const NET_ACQUIRE_WINDOW: Duration = Duration::from_secs(10);
/// Pause between connecting and sending the identifier line. The hub reads
/// the id immediately, but needs a moment to start its read task.
const ID_SEND_DELAY: Duration = Duration::from_millis(50);
/// Wait per attempt for an ACK before re-sending a QoS frame.
const QOS_RETRY: Duration = Duration::from_secs(1);

fn default_port() -> u16 {
    8123
}

fn default_timeout() -> Duration {
    Duration::from_millis(1500)
}

/// Client endpoint configuration.
///
/// Plain data; hooks (network interface, recovery strategy, callbacks) are
/// installed on [`Client`] with the `with_*` builders.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Stable identifier sent as the handshake line.
    pub my_id: String,
    /// Hub host name or address.
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// The single link tunable; every interval in the engine derives from it.
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
    /// Raises per-frame events from trace to debug level.
    #[serde(default)]
    pub verbose: bool,
}

impl ClientConfig {
    pub fn new(my_id: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            my_id: my_id.into(),
            server: server.into(),
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

/// Supervisor state. One connection attempt cycle per lap:
/// boot settle → network acquisition → connect/handshake → up → outage hold.
#[derive(Clone, Copy, Debug)]
enum Phase {
    Boot { until: Instant },
    Network { pass_started: bool, stable_since: Option<Instant>, acquire: Deadline },
    Connect { id_due: Instant, id_sent: bool },
    Up,
    Outage { hold: Deadline, dropped: bool, wait_drop: bool },
}

struct QosEntry {
    mid: u8,
    frame: Vec<u8>,
    retry: Repeater,
}

/// Client endpoint of the link.
///
/// A single-threaded engine: every task of the protocol (reader, writer,
/// keepalive, supervisor, QoS retransmit) is state advanced by
/// [`poll_once`](Self::poll_once). The blocking calls pump the engine
/// internally, so keepalives, ACKs and reconnection keep running while an
/// application waits inside [`read`](Self::read) or [`write`](Self::write).
///
/// Created once per device and lives forever; the TCP connection inside is
/// rebuilt on every outage. After the first successful connect no error is
/// ever surfaced again.
pub struct Client {
    cfg: ClientConfig,
    id_line: Vec<u8>,

    netif: Box<dyn NetworkInterface>,
    recovery: Box<dyn Recovery>,
    connect_cb: Option<Box<dyn FnMut(bool)>>,
    indicator: Option<Box<dyn FnMut()>>,
    watchdog_feed: Option<Box<dyn FnMut()>>,

    poll: Poll,
    events: Events,

    phase: Phase,
    first_attempt: bool,
    up_announced: bool,
    fail_cause: Option<&'static str>,
    closed: bool,

    stream: Option<LineStream>,
    read_deadline: Deadline,
    ok: bool,
    connects: u32,
    counted_this_connect: bool,

    mids: MidGen,
    dedup: DedupWindow,
    acks_pend: AckSet,
    rx_held: Option<Vec<u8>>,
    ack_queue: VecDeque<u8>,
    tx_queue: VecDeque<Vec<u8>>,
    qos: Vec<QosEntry>,
}

impl Client {
    pub fn new(cfg: ClientConfig) -> Result<Self, LinkError> {
        let poll = Poll::new()?;
        let mut id_line = cfg.my_id.clone().into_bytes();
        if id_line.last() != Some(&b'\n') {
            id_line.push(b'\n');
        }
        Ok(Self {
            id_line,
            netif: Box::new(AlwaysUp),
            recovery: Box::new(FatalOnFirstAttempt),
            connect_cb: None,
            indicator: None,
            watchdog_feed: None,
            poll,
            events: Events::with_capacity(64),
            phase: Phase::Boot { until: Instant::now() + BOOT_SETTLE },
            first_attempt: true,
            up_announced: false,
            fail_cause: None,
            closed: false,
            stream: None,
            read_deadline: Deadline::after(cfg.timeout * 2),
            ok: false,
            connects: 0,
            counted_this_connect: false,
            mids: MidGen::new(),
            dedup: DedupWindow::new(),
            acks_pend: AckSet::new(),
            rx_held: None,
            ack_queue: VecDeque::new(),
            tx_queue: VecDeque::new(),
            qos: Vec::new(),
            cfg,
        })
    }

    pub fn with_netif(mut self, netif: impl NetworkInterface + 'static) -> Self {
        self.netif = Box::new(netif);
        self
    }

    pub fn with_recovery(mut self, recovery: impl Recovery + 'static) -> Self {
        self.recovery = Box::new(recovery);
        self
    }

    /// Invoked with `true`/`false` on every up/outage transition.
    pub fn with_connect_callback(mut self, cb: impl FnMut(bool) + 'static) -> Self {
        self.connect_cb = Some(Box::new(cb));
        self
    }

    /// Toggled on every keepalive received; drives a status LED or similar.
    pub fn with_indicator(mut self, toggle: impl FnMut() + 'static) -> Self {
        self.indicator = Some(Box::new(toggle));
        self
    }

    /// Invoked once per engine tick so an external watchdog stays fed while
    /// the engine makes progress.
    pub fn with_watchdog_feed(mut self, feed: impl FnMut() + 'static) -> Self {
        self.watchdog_feed = Some(Box::new(feed));
        self
    }

    // **** API ****

    /// True once at least one complete frame has arrived since the most
    /// recent connect.
    pub fn status(&self) -> bool {
        self.ok
    }

    /// Successful connects since construction, for diagnostics.
    pub fn connects(&self) -> u32 {
        self.connects
    }

    /// Blocks until the link is up.
    pub fn await_connected(&mut self) -> Result<(), LinkError> {
        while !self.ok {
            self.poll_once(self.short_delay())?;
        }
        Ok(())
    }

    /// Takes the pending inbound payload, if any.
    pub fn try_read(&mut self) -> Option<Vec<u8>> {
        self.rx_held.take()
    }

    /// Blocks until the next application payload arrives. At most one
    /// undelivered payload is held; while the consumer lags, newer data
    /// frames are dropped and recovered by the peer's QoS retransmit.
    pub fn read(&mut self) -> Result<Vec<u8>, LinkError> {
        loop {
            if let Some(payload) = self.rx_held.take() {
                return Ok(payload);
            }
            self.poll_once(self.short_delay())?;
        }
    }

    /// Queues one payload without blocking and returns its message ID.
    pub fn submit(&mut self, buf: &[u8], qos: bool) -> u8 {
        self.submit_frame(buf, qos).0
    }

    /// Submits one payload. With `qos && wait` the call first blocks until
    /// no earlier QoS write is outstanding; with `qos` it blocks until the
    /// frame is ACKed, re-sending every second while the link is up. Blocks
    /// across outages rather than failing.
    pub fn write(&mut self, buf: &[u8], qos: bool, wait: bool) -> Result<(), LinkError> {
        if qos && wait {
            while !self.acks_pend.is_empty() {
                self.poll_once(self.short_delay())?;
            }
        }
        let (mid, frame) = self.submit_frame(buf, qos);
        if qos {
            while self.acks_pend.contains(mid) {
                self.poll_once(self.short_delay())?;
            }
        } else {
            // Fire-and-forget still waits for the frame to reach the socket.
            while self.tx_queue.iter().any(|f| *f == frame) {
                self.poll_once(self.short_delay())?;
            }
        }
        Ok(())
    }

    /// Tears the connection down for good and stops all internal activity.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let registry = self.poll.registry();
        if let Some(stream) = self.stream.as_mut() {
            stream.close(registry);
        }
        self.stream = None;
        info!("link: closed");
    }

    /// One engine tick: advances the supervisor, performs socket IO, runs
    /// keepalive and QoS bookkeeping. Sleeps at most `max_wait` waiting for
    /// IO. `Err` is only possible before the first successful connect.
    pub fn poll_once(&mut self, max_wait: Duration) -> Result<(), LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }
        if let Some(feed) = &mut self.watchdog_feed {
            feed();
        }
        self.step()?;

        if let Err(err) = self.poll.poll(&mut self.events, Some(max_wait)) {
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
        let mut readable = false;
        for ev in self.events.iter() {
            if ev.token() == STREAM {
                readable |= ev.is_readable();
            }
        }
        if readable {
            self.on_readable();
        }
        self.tick_qos();
        if let Some(cause) = self.service_writes() {
            self.fail(cause);
        }
        self.check_deadlines();
        Ok(())
    }

    // **** Supervisor ****

    fn step(&mut self) -> Result<(), LinkError> {
        match self.phase {
            Phase::Boot { until } => {
                if Instant::now() >= until {
                    self.phase = Phase::Network {
                        pass_started: false,
                        stable_since: None,
                        acquire: Deadline::after(NET_ACQUIRE_WINDOW),
                    };
                }
                Ok(())
            }
            Phase::Network { .. } => self.step_network(),
            Phase::Connect { .. } => self.step_connect(),
            Phase::Up => {
                if let Some(cause) = self.fail_cause.take() {
                    self.enter_outage(cause);
                }
                Ok(())
            }
            Phase::Outage { .. } => {
                self.step_outage();
                Ok(())
            }
        }
    }

    fn step_network(&mut self) -> Result<(), LinkError> {
        let Phase::Network { pass_started, stable_since, mut acquire } = self.phase else {
            return Ok(());
        };
        if self.netif.is_connected() {
            if !pass_started {
                // The link survived the outage (or was up all along).
                return self.start_connect();
            }
            // Reacquired: require it to hold before trusting it.
            let since = stable_since.unwrap_or_else(Instant::now);
            if since.elapsed() >= self.cfg.timeout * 2 {
                debug!("link: network stable");
                return self.start_connect();
            }
            self.phase = Phase::Network { pass_started, stable_since: Some(since), acquire };
            return Ok(());
        }

        if !pass_started {
            debug!("link: acquiring network");
            self.netif.bring_up();
            acquire.reset(NET_ACQUIRE_WINDOW);
            self.phase = Phase::Network { pass_started: true, stable_since: None, acquire };
            return Ok(());
        }
        if acquire.expired() {
            if self.first_attempt {
                self.recovery.bad_network()?;
            }
            self.phase = Phase::Network { pass_started: false, stable_since: None, acquire };
            return Ok(());
        }
        self.phase = Phase::Network { pass_started, stable_since: None, acquire };
        Ok(())
    }

    fn start_connect(&mut self) -> Result<(), LinkError> {
        match self.try_open() {
            Ok(()) => {
                self.read_deadline.reset(self.cfg.timeout * 2);
                self.counted_this_connect = false;
                self.phase =
                    Phase::Connect { id_due: Instant::now() + ID_SEND_DELAY, id_sent: false };
                Ok(())
            }
            Err(err) => {
                debug!(?err, "link: connect fail");
                self.server_attempt_failed("connect fail")
            }
        }
    }

    fn try_open(&mut self) -> io::Result<()> {
        let addr = (self.cfg.server.as_str(), self.cfg.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "server does not resolve"))?;
        let stream = LineStream::connect(addr, STREAM, self.poll.registry(), self.cfg.timeout)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn step_connect(&mut self) -> Result<(), LinkError> {
        if let Some(cause) = self.fail_cause.take() {
            return self.server_attempt_failed(cause);
        }
        let Phase::Connect { id_due, id_sent } = self.phase else { return Ok(()) };
        if !id_sent {
            if Instant::now() < id_due {
                return Ok(());
            }
            // The identifier goes out blind: nothing has been received yet
            // and the hub cannot talk back before it knows who we are.
            let down = {
                let registry = self.poll.registry();
                match self.stream.as_mut() {
                    Some(stream) => stream.send_line(&self.id_line, registry) == LinkState::Down,
                    None => true,
                }
            };
            if down {
                return self.server_attempt_failed("handshake fail");
            }
            self.phase = Phase::Connect { id_due, id_sent: true };
            return Ok(());
        }
        // A still-connecting socket parks the identifier in the backlog;
        // hold here until the bytes have actually cleared, so a refused
        // connect still counts against this attempt.
        if !self.stream.as_ref().is_some_and(|s| s.backlog_empty()) {
            return Ok(());
        }
        self.first_attempt = false;
        self.up_announced = true;
        self.phase = Phase::Up;
        info!(my_id = %self.cfg.my_id, "link: up");
        if let Some(cb) = &mut self.connect_cb {
            cb(true);
        }
        Ok(())
    }

    fn server_attempt_failed(&mut self, cause: &'static str) -> Result<(), LinkError> {
        let first = self.first_attempt;
        self.first_attempt = false;
        if first {
            self.recovery.bad_server()?;
        }
        self.enter_outage(cause);
        Ok(())
    }

    fn enter_outage(&mut self, cause: &str) {
        warn!(cause, "link: outage");
        self.ok = false;
        self.fail_cause = None;
        let registry = self.poll.registry();
        if let Some(stream) = self.stream.as_mut() {
            stream.close(registry);
        }
        self.stream = None;
        // Unsent ACKs die with the connection; the peer re-sends the data.
        self.ack_queue.clear();
        if self.up_announced {
            self.up_announced = false;
            if let Some(cb) = &mut self.connect_cb {
                cb(false);
            }
        }
        // Hold long enough for the peer to notice the outage too.
        self.phase = Phase::Outage {
            hold: Deadline::after(self.cfg.timeout * 2),
            dropped: false,
            wait_drop: false,
        };
    }

    fn step_outage(&mut self) {
        let Phase::Outage { hold, dropped, wait_drop } = self.phase else { return };
        if !hold.expired() {
            return;
        }
        let wait_drop = if dropped { wait_drop } else { self.netif.drop_link() };
        if wait_drop && self.netif.is_connected() {
            self.phase = Phase::Outage { hold, dropped: true, wait_drop };
            return;
        }
        self.phase = Phase::Network {
            pass_started: false,
            stable_since: None,
            acquire: Deadline::after(NET_ACQUIRE_WINDOW),
        };
    }

    // **** Reader ****

    fn on_readable(&mut self) {
        let down = match self.stream.as_mut() {
            Some(stream) => stream.drain_rx() == LinkState::Down,
            None => return,
        };
        // Complete lines that arrived before a FIN are still good.
        loop {
            let Some(line) = self.stream.as_mut().and_then(|s| s.next_line()) else { break };
            self.on_line(&line);
        }
        if down {
            self.fail("reader fail");
        }
    }

    fn on_line(&mut self, line: &[u8]) {
        self.ok = true;
        self.read_deadline.reset(self.cfg.timeout);
        let frame = match parse(line) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(?err, bytes = ?line, "link: malformed frame");
                self.fail("reader fail");
                return;
            }
        };
        match frame {
            Frame::Keepalive => {
                trace!("link: keepalive");
                if let Some(toggle) = &mut self.indicator {
                    toggle();
                }
            }
            Frame::Ack { mid } => {
                self.count_session();
                if self.cfg.verbose {
                    debug!(mid, "link: ack");
                }
                // Unknown IDs (and qos0 ACKs nobody waits on) fall out here.
                self.acks_pend.discard(mid);
            }
            Frame::Data { mid, payload } => {
                self.count_session();
                if self.rx_held.is_some() {
                    // Consumer is slow; drop without ACK, the peer re-sends.
                    trace!(mid, "link: rx dropped, payload still pending");
                    return;
                }
                self.ack_queue.push_back(mid);
                if mid == RESTART_ID {
                    // Peer power-cycled: its allocator starts over.
                    self.dedup.reset();
                }
                if self.dedup.is_new(mid) {
                    if self.cfg.verbose {
                        debug!(mid, len = payload.len(), "link: rx");
                    }
                    self.rx_held = Some(payload.to_vec());
                }
            }
        }
    }

    fn count_session(&mut self) {
        if !self.counted_this_connect {
            self.counted_this_connect = true;
            self.connects += 1;
        }
    }

    // **** Writer / keepalive / QoS ****

    /// Re-queues QoS frames whose ACK wait ran out. Runs every tick, socket
    /// or not: retransmitters outlive individual connections.
    fn tick_qos(&mut self) {
        let mut i = 0;
        while i < self.qos.len() {
            if !self.acks_pend.contains(self.qos[i].mid) {
                self.qos.swap_remove(i);
                continue;
            }
            if !self.ok {
                // Hold the retry clock through the outage; the full ACK wait
                // restarts after recovery.
                self.qos[i].retry.reset();
            } else if self.qos[i].retry.fired() {
                debug!(mid = self.qos[i].mid, "link: retransmit");
                self.tx_queue.push_back(self.qos[i].frame.clone());
            }
            i += 1;
        }
    }

    fn service_writes(&mut self) -> Option<&'static str> {
        let registry = self.poll.registry();
        let stream = self.stream.as_mut()?;

        // ACKs bypass the ok gate.
        while let Some(&mid) = self.ack_queue.front() {
            let mut buf = Vec::with_capacity(3);
            encode_ack(mid, &mut buf);
            if stream.send_line(&buf, registry) == LinkState::Down {
                return Some("sendack fail");
            }
            self.ack_queue.pop_front();
        }

        // Data waits for the first inbound frame of this connect. At most
        // one frame sits in the socket backlog.
        if self.ok && stream.backlog_empty() {
            if let Some(frame) = self.tx_queue.pop_front() {
                if self.cfg.verbose {
                    debug!(len = frame.len(), "link: tx");
                }
                if stream.send_line(&frame, registry) == LinkState::Down {
                    return Some("writer fail");
                }
            }
        }

        if matches!(self.phase, Phase::Up)
            && stream.backlog_empty()
            && stream.idle_for() >= self.cfg.timeout / 2
        {
            trace!("link: keepalive out");
            if stream.send_line(b"\n", registry) == LinkState::Down {
                return Some("keepalive fail");
            }
        }
        None
    }

    fn check_deadlines(&mut self) {
        let flush_down = {
            let registry = self.poll.registry();
            match self.stream.as_mut() {
                Some(stream) => stream.flush(registry) == LinkState::Down,
                None => false,
            }
        };
        if flush_down {
            self.fail("writer fail");
        }
        if self.stream.is_some() && self.read_deadline.expired() {
            self.fail("reader fail");
        }
    }

    fn fail(&mut self, cause: &'static str) {
        if self.fail_cause.is_none() {
            debug!(cause, "link: fail event");
            self.fail_cause = Some(cause);
        }
    }

    fn submit_frame(&mut self, buf: &[u8], qos: bool) -> (u8, Vec<u8>) {
        let mid = self.mids.next();
        self.acks_pend.add(mid);
        let mut frame = Vec::with_capacity(buf.len() + 3);
        encode_data(mid, buf, &mut frame);
        self.tx_queue.push_back(frame.clone());
        if qos {
            let mut retry = Repeater::every(QOS_RETRY);
            retry.reset();
            self.qos.push(QosEntry { mid, frame: frame.clone(), retry });
        }
        (mid, frame)
    }

    fn short_delay(&self) -> Duration {
        self.cfg.timeout / 10
    }
}
