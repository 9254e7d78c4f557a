//! Clocks and transmit pacing
//!
//! Test tags carry wall-clock send times so that two ports on different
//! hosts can compute one-way delay. Pacing uses the monotonic clock.

use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};
use nettest_core::TimingProfile;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Wall-clock time since the UNIX epoch
#[inline]
pub fn unix_now() -> Duration {
    since_epoch(SystemTime::now())
}

/// `at` as an offset from the UNIX epoch, zero if it lies before it
#[inline]
pub fn since_epoch(at: SystemTime) -> Duration {
    at.duration_since(UNIX_EPOCH).unwrap_or_default()
}

/// Outcome of waiting for the next packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// Deadline reached, send
    Go,
    /// Stop requested while waiting
    Stop,
}

/// Schedules packet deadlines for a transmit worker
///
/// Deadlines accumulate from the schedule's per-entry delays so sleep
/// overshoot does not drift the long-run rate. A packet whose deadline is
/// within the profile's timer granularity goes out without sleeping, up to
/// `burst_size` packets in a row; anything else sleeps until its deadline.
#[derive(Debug)]
pub struct Pacer {
    profile: TimingProfile,
    deadline: Instant,
    burst: usize,
}

impl Pacer {
    /// Pacer starting now
    pub fn new(profile: TimingProfile) -> Self {
        Pacer {
            profile,
            deadline: Instant::now(),
            burst: 0,
        }
    }

    /// Timing profile in use
    pub fn profile(&self) -> TimingProfile {
        self.profile
    }

    /// Restart the deadline chain at the current time
    pub fn reset(&mut self) {
        self.deadline = Instant::now();
        self.burst = 0;
    }

    /// Wait `delay` after the previous deadline, returning early on stop
    pub fn wait(&mut self, delay: Duration, stop: &Receiver<()>) -> Pace {
        self.deadline += delay;
        let now = Instant::now();

        if self.deadline <= now + self.profile.timer_granularity
            && self.burst < self.profile.burst_size
        {
            self.burst += 1;
            return match stop.try_recv() {
                Err(TryRecvError::Empty) => Pace::Go,
                _ => Pace::Stop,
            };
        }

        self.burst = 1;
        match stop.recv_timeout(self.deadline.saturating_duration_since(now)) {
            Err(RecvTimeoutError::Timeout) => Pace::Go,
            _ => Pace::Stop,
        }
    }
}

/// Fixed-interval ticker for periodic polling
#[derive(Debug)]
pub struct Ticker {
    interval: Duration,
    last: Instant,
}

impl Ticker {
    /// Ticker whose first tick is one interval from now
    pub fn new(interval: Duration) -> Self {
        Ticker {
            interval,
            last: Instant::now(),
        }
    }

    /// Time left before the next tick
    pub fn remaining(&self) -> Duration {
        self.interval.saturating_sub(self.last.elapsed())
    }

    /// Consume a tick if one is due
    pub fn try_tick(&mut self) -> bool {
        if self.last.elapsed() >= self.interval {
            self.last = Instant::now();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;
    use nettest_core::RateAccuracy;
    use std::thread;

    #[test]
    fn test_unix_now_is_recent() {
        // 2020-01-01
        assert!(unix_now() > Duration::from_secs(1_577_836_800));
        assert_eq!(since_epoch(UNIX_EPOCH), Duration::ZERO);
    }

    #[test]
    fn test_pacer_keeps_rate() {
        let (_stop_tx, stop_rx) = channel::bounded::<()>(1);
        let mut pacer = Pacer::new(RateAccuracy::High.profile());

        let start = Instant::now();
        for _ in 0..20 {
            assert_eq!(pacer.wait(Duration::from_millis(1), &stop_rx), Pace::Go);
        }
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_millis(200));
    }

    #[test]
    fn test_pacer_bursts_short_gaps() {
        let (_stop_tx, stop_rx) = channel::bounded::<()>(1);
        let mut pacer = Pacer::new(RateAccuracy::Low.profile());

        // 64 packets 1µs apart fit inside one 1ms granule
        let start = Instant::now();
        for _ in 0..64 {
            assert_eq!(pacer.wait(Duration::from_micros(1), &stop_rx), Pace::Go);
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_pacer_stops_promptly() {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let mut pacer = Pacer::new(RateAccuracy::High.profile());

        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let _ = stop_tx.send(());
        });

        let start = Instant::now();
        assert_eq!(pacer.wait(Duration::from_secs(10), &stop_rx), Pace::Stop);
        assert!(start.elapsed() < Duration::from_secs(2));
        waker.join().unwrap();
    }

    #[test]
    fn test_pacer_stops_when_sender_dropped() {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        drop(stop_tx);
        let mut pacer = Pacer::new(RateAccuracy::Medium.profile());
        assert_eq!(pacer.wait(Duration::ZERO, &stop_rx), Pace::Stop);
    }

    #[test]
    fn test_ticker() {
        let mut ticker = Ticker::new(Duration::from_millis(10));
        assert!(!ticker.try_tick());
        assert!(ticker.remaining() > Duration::ZERO);

        thread::sleep(Duration::from_millis(11));
        assert!(ticker.try_tick());
        assert!(!ticker.try_tick());
    }
}
