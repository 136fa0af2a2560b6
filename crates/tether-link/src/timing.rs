use std::time::{Duration, Instant};

/// Periodic gate. `fired` answers "has the interval elapsed since the last
/// firing?" and re-arms itself when it has.
#[derive(Clone, Copy, Debug)]
pub struct Repeater {
    interval: Duration,
    /// `None` means the next `fired` call reports true immediately.
    last: Option<Instant>,
}

impl Repeater {
    #[inline]
    pub fn every(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    #[inline]
    pub fn fired(&mut self) -> bool {
        let due = self.last.is_none_or(|t| t.elapsed() >= self.interval);
        if due {
            self.last = Some(Instant::now());
        }
        due
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn reset(&mut self) {
        self.last = Some(Instant::now());
    }

    pub fn force_fire(&mut self) {
        self.last = None;
    }
}

/// One-shot expiry gate for read/write deadlines and hold-off windows.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    start: Instant,
    window: Duration,
}

impl Deadline {
    #[inline]
    pub fn after(window: Duration) -> Self {
        Self { start: Instant::now(), window }
    }

    #[inline]
    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.window
    }

    /// Restart the clock with a fresh window.
    #[inline]
    pub fn reset(&mut self, window: Duration) {
        self.start = Instant::now();
        self.window = window;
    }
}
