use std::time::{Duration, Instant};

/// Fires once per interval when polled.
#[derive(Clone, Copy, Debug)]
pub struct Repeater {
    interval: Duration,
    last_acted: Instant,
    pending: bool,
}

impl Repeater {
    #[inline]
    pub fn every(interval: Duration) -> Self {
        Self { interval, last_acted: Instant::now(), pending: false }
    }

    #[inline]
    pub fn fired(&mut self) -> bool {
        if self.pending || self.last_acted.elapsed() >= self.interval {
            self.pending = false;
            self.last_acted = Instant::now();
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[inline]
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn reset(&mut self) {
        self.pending = false;
        self.last_acted = Instant::now();
    }

    pub fn force_fire(&mut self) {
        self.pending = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_after_interval() {
        let mut r = Repeater::every(Duration::ZERO);
        assert!(r.fired());
        let mut slow = Repeater::every(Duration::from_secs(3600));
        assert!(!slow.fired());
        slow.force_fire();
        assert!(slow.fired());
        assert!(!slow.fired());
    }
}
