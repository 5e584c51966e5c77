use std::time::{Duration, Instant};

/// What the master loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Nothing due yet; sleep at most this long.
    Wait(Duration),
    /// Run a cycle now. `start_delay` is how late the trigger is.
    Run { start_delay: Duration },
}

/// Periodic cycle trigger. Triggers missed by more than the catch-up window are dropped, not
/// queued.
#[derive(Debug, Clone)]
pub struct CycleDriver {
    period: Duration,
    catch_up_window: Duration,
    next: Instant,
    skipped: u64,
}

impl CycleDriver {
    pub fn new(period: Duration, catch_up_window: Duration, start: Instant) -> Self {
        Self {
            period,
            catch_up_window,
            next: start,
            skipped: 0,
        }
    }

    /// Total number of dropped triggers.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn poll(&mut self, now: Instant) -> Trigger {
        let mut skipped = 0;
        while now.saturating_duration_since(self.next) > self.catch_up_window {
            self.next += self.period;
            skipped += 1;
        }
        if skipped > 0 {
            self.skipped += skipped;
            log::warn!("Skipped {} late cycle trigger(s)", skipped);
        }

        if now < self.next {
            return Trigger::Wait(self.next - now);
        }
        let start_delay = now - self.next;
        self.next += self.period;
        Trigger::Run { start_delay }
    }
}
