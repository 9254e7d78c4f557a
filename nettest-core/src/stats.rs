//! Port statistics
//!
//! A [`StatsBlock`] carries two generations of [`PortStats`]: the live
//! counters since the last reset and an `epoch` copy taken at the previous
//! rate refresh. Packet and bit rates are the delta between the two over the
//! elapsed time. The caller decides when to refresh.

use crate::window::{Observation, StatisticsWindow, TestSample, WindowConfig};
use serde::Serialize;
use std::time::Instant;

/// Snapshot of everything a port measures
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PortStats {
    pub rx_pkts: u64,
    pub rx_bytes: u64,
    pub rx_pps: u64,
    pub rx_bps: u64,

    pub rx_drops: u64,
    pub rx_errors: u64,
    pub rx_fifo_errors: u64,
    pub rx_frame_errors: u64,

    pub tx_pkts: u64,
    pub tx_bytes: u64,
    pub tx_pps: u64,
    pub tx_bps: u64,

    /// Test-flow packets received
    pub nt_pkts: u64,
    /// Test-flow bytes received
    pub nt_bytes: u64,
    /// Test-flow duplicates inside the window
    pub nt_duplicates: u64,
    /// Test-flow packets that filled a gap late
    pub nt_reordered: u64,
    /// Samples with a negative computed delay
    pub nt_clock_anomalies: u64,

    pub nt_avg_delay_us: u32,
    pub nt_mmo_delay_us: u32,
    pub nt_max_delay_us: u32,
    pub nt_min_delay_us: u32,
    pub nt_prev_delay_us: u32,

    pub nt_avg_jitter_us: u32,
    pub nt_mmo_jitter_us: u32,
    pub nt_max_jitter_us: u32,
    pub nt_min_jitter_us: u32,

    /// Packets declared lost
    pub nt_loss_count: u64,
    /// Packets outside the receive window, lost ones included
    pub nt_out_of_wnd_count: u64,
    /// Loss since the start of the test (%)
    pub nt_loss_percent: f64,
    /// Out-of-window since the start of the test (%)
    pub nt_out_of_wnd_percent: f64,
    pub nt_mmo_loss_percent: f64,
    pub nt_mmo_out_of_wnd_percent: f64,
}

/// Absolute receive error counters as reported by a backend
///
/// Hardware counters wrap at a backend-specific maximum; see
/// [`StatsBlock::absorb_link_counters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkCounters {
    pub rx_drops: u64,
    pub rx_errors: u64,
    pub rx_fifo_errors: u64,
    pub rx_frame_errors: u64,
}

/// Receive error reported frame by frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RxErrorKind {
    /// Frame dropped for lack of resources
    Drop,
    /// Generic receive error
    Error,
    /// Receive FIFO overrun
    Fifo,
    /// Framing or checksum error
    Frame,
}

/// Live counters, epoch copy and the test-flow window
#[derive(Debug, Clone)]
pub struct StatsBlock {
    stats: PortStats,
    epoch: PortStats,
    epoch_at: Instant,
    window: StatisticsWindow,
    link_baseline: Option<LinkCounters>,
}

impl StatsBlock {
    /// Create zeroed statistics
    pub fn new(config: WindowConfig) -> Self {
        StatsBlock {
            stats: PortStats::default(),
            epoch: PortStats::default(),
            epoch_at: Instant::now(),
            window: StatisticsWindow::new(config),
            link_baseline: None,
        }
    }

    /// Count a received frame
    #[inline]
    pub fn record_rx(&mut self, len: usize) {
        self.stats.rx_pkts += 1;
        self.stats.rx_bytes += len as u64;
    }

    /// Count a transmitted frame
    #[inline]
    pub fn record_tx(&mut self, len: usize) {
        self.stats.tx_pkts += 1;
        self.stats.tx_bytes += len as u64;
    }

    /// Count a receive error
    pub fn record_rx_error(&mut self, kind: RxErrorKind) {
        let counter = match kind {
            RxErrorKind::Drop => &mut self.stats.rx_drops,
            RxErrorKind::Error => &mut self.stats.rx_errors,
            RxErrorKind::Fifo => &mut self.stats.rx_fifo_errors,
            RxErrorKind::Frame => &mut self.stats.rx_frame_errors,
        };
        *counter += 1;
    }

    /// Fold a received test-flow packet into the window
    pub fn record_test_sample(&mut self, sample: &TestSample) -> Observation {
        let observation = self.window.update(sample);
        self.export_window();
        observation
    }

    fn export_window(&mut self) {
        let w = &self.window;
        let s = &mut self.stats;

        s.nt_pkts = w.packets();
        s.nt_bytes = w.bytes();
        s.nt_duplicates = w.sequence().duplicates();
        s.nt_reordered = w.sequence().reordered();
        s.nt_clock_anomalies = w.clock_anomalies();

        s.nt_avg_delay_us = saturate(w.delay().average());
        s.nt_mmo_delay_us = saturate(w.delay().mmo() as u64);
        s.nt_max_delay_us = saturate(w.delay().max());
        s.nt_min_delay_us = saturate(w.delay().min());
        s.nt_prev_delay_us = saturate(w.prev_delay_us());

        s.nt_avg_jitter_us = saturate(w.jitter().average());
        s.nt_mmo_jitter_us = saturate(w.jitter().mmo() as u64);
        s.nt_max_jitter_us = saturate(w.jitter().max());
        s.nt_min_jitter_us = saturate(w.jitter().min());

        s.nt_loss_count = w.sequence().lost();
        s.nt_out_of_wnd_count = w.sequence().out_of_window();
        s.nt_loss_percent = w.sequence().loss_percent();
        s.nt_out_of_wnd_percent = w.sequence().out_of_window_percent();
        s.nt_mmo_loss_percent = w.mmo_loss_percent();
        s.nt_mmo_out_of_wnd_percent = w.mmo_out_of_window_percent();
    }

    /// Fold absolute backend error counters into the live stats
    ///
    /// The first reading only establishes a baseline. Later readings add the
    /// wrap-aware delta, treating `max_value` as the largest value the
    /// backend counter can hold before it rolls over to zero.
    pub fn absorb_link_counters(&mut self, reading: LinkCounters, max_value: u64) {
        if let Some(prev) = self.link_baseline {
            self.stats.rx_drops += counter_delta(prev.rx_drops, reading.rx_drops, max_value);
            self.stats.rx_errors += counter_delta(prev.rx_errors, reading.rx_errors, max_value);
            self.stats.rx_fifo_errors +=
                counter_delta(prev.rx_fifo_errors, reading.rx_fifo_errors, max_value);
            self.stats.rx_frame_errors +=
                counter_delta(prev.rx_frame_errors, reading.rx_frame_errors, max_value);
        }
        self.link_baseline = Some(reading);
    }

    /// Recompute rates from the delta since the last refresh and start a
    /// new epoch
    pub fn refresh_rates(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.epoch_at).as_secs_f64();
        if elapsed > 0.0 {
            let s = &mut self.stats;
            let e = &self.epoch;
            s.rx_pps = per_second(s.rx_pkts.saturating_sub(e.rx_pkts), elapsed);
            s.rx_bps = per_second(s.rx_bytes.saturating_sub(e.rx_bytes) * 8, elapsed);
            s.tx_pps = per_second(s.tx_pkts.saturating_sub(e.tx_pkts), elapsed);
            s.tx_bps = per_second(s.tx_bytes.saturating_sub(e.tx_bytes) * 8, elapsed);
        }
        self.epoch = self.stats;
        self.epoch_at = now;
    }

    /// Copy of the live counters
    pub fn snapshot(&self) -> PortStats {
        self.stats
    }

    /// Copy of the epoch generation
    pub fn epoch(&self) -> PortStats {
        self.epoch
    }

    /// Test-flow window
    pub fn window(&self) -> &StatisticsWindow {
        &self.window
    }

    /// Replace the test-flow window with one sized by `config` and start
    /// a new epoch
    pub fn reconfigure(&mut self, config: WindowConfig, now: Instant) {
        self.window = StatisticsWindow::new(config);
        self.reset(now);
    }

    /// Zero both generations and the window
    ///
    /// The backend counter baseline survives so the next absorbed reading
    /// only contributes what happened after the reset.
    pub fn reset(&mut self, now: Instant) {
        self.stats = PortStats::default();
        self.epoch = PortStats::default();
        self.epoch_at = now;
        self.window.reset();
    }
}

impl Default for StatsBlock {
    fn default() -> Self {
        StatsBlock::new(WindowConfig::default())
    }
}

/// Difference between two readings of a counter that wraps after `max`
pub fn counter_delta(prev: u64, cur: u64, max: u64) -> u64 {
    if cur >= prev {
        cur - prev
    } else {
        max.saturating_sub(prev).saturating_add(cur).saturating_add(1)
    }
}

fn per_second(delta: u64, secs: f64) -> u64 {
    (delta as f64 / secs) as u64
}

fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::SeqNumber;
    use std::time::Duration;

    fn sample(seq: u32, delay_us: u64) -> TestSample {
        let sent = Duration::from_millis(u64::from(seq));
        TestSample {
            seq: SeqNumber::new(seq),
            sent_at: sent,
            received_at: sent + Duration::from_micros(delay_us),
            len: 128,
        }
    }

    #[test]
    fn test_rates_from_epoch_delta() {
        let start = Instant::now();
        let mut block = StatsBlock::new(WindowConfig::default());
        block.reset(start);

        for _ in 0..1000 {
            block.record_rx(125);
            block.record_tx(250);
        }
        block.refresh_rates(start + Duration::from_secs(2));

        let stats = block.snapshot();
        assert_eq!(stats.rx_pps, 500);
        assert_eq!(stats.rx_bps, 500_000);
        assert_eq!(stats.tx_pps, 500);
        assert_eq!(stats.tx_bps, 1_000_000);
        assert_eq!(block.epoch().rx_pkts, 1000);

        // Nothing new in the next epoch
        block.refresh_rates(start + Duration::from_secs(3));
        assert_eq!(block.snapshot().rx_pps, 0);
        assert_eq!(block.snapshot().rx_pkts, 1000);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let start = Instant::now();
        let mut block = StatsBlock::default();
        block.reset(start);
        block.record_rx(64);
        block.record_test_sample(&sample(0, 40));
        block.refresh_rates(start + Duration::from_secs(1));
        assert!(block.snapshot().rx_pps > 0);

        block.reset(start + Duration::from_secs(1));
        assert_eq!(block.snapshot(), PortStats::default());
        assert_eq!(block.epoch(), PortStats::default());
        assert_eq!(block.window().packets(), 0);
    }

    #[test]
    fn test_window_exported() {
        let mut block = StatsBlock::default();
        for seq in (0..300u32).filter(|&s| s != 7) {
            block.record_test_sample(&sample(seq, 1500));
        }
        block.record_test_sample(&sample(299, 1500));

        let stats = block.snapshot();
        assert_eq!(stats.nt_pkts, 300);
        assert_eq!(stats.nt_bytes, 300 * 128);
        assert_eq!(stats.nt_avg_delay_us, 1500);
        assert_eq!(stats.nt_min_delay_us, 1500);
        assert_eq!(stats.nt_loss_count, 1);
        assert_eq!(stats.nt_out_of_wnd_count, 1);
        assert_eq!(stats.nt_duplicates, 1);
        assert!(stats.nt_loss_percent > 0.0);
        // Test-flow accounting does not touch link counters
        assert_eq!(stats.rx_pkts, 0);
    }

    #[test]
    fn test_rx_errors_counted_by_kind() {
        let mut block = StatsBlock::default();
        block.record_rx_error(RxErrorKind::Drop);
        block.record_rx_error(RxErrorKind::Drop);
        block.record_rx_error(RxErrorKind::Fifo);

        let stats = block.snapshot();
        assert_eq!(stats.rx_drops, 2);
        assert_eq!(stats.rx_fifo_errors, 1);
        assert_eq!(stats.rx_errors, 0);
        assert_eq!(stats.rx_frame_errors, 0);
    }

    #[test]
    fn test_counter_delta_wraps() {
        assert_eq!(counter_delta(10, 15, u64::from(u32::MAX)), 5);
        assert_eq!(counter_delta(u64::from(u32::MAX) - 1, 3, u64::from(u32::MAX)), 5);
        assert_eq!(counter_delta(5, 5, u64::MAX), 0);
    }

    #[test]
    fn test_absorb_link_counters() {
        let max = u64::from(u32::MAX);
        let mut block = StatsBlock::default();

        block.absorb_link_counters(
            LinkCounters {
                rx_drops: max - 2,
                rx_errors: 100,
                ..Default::default()
            },
            max,
        );
        assert_eq!(block.snapshot().rx_drops, 0);

        block.absorb_link_counters(
            LinkCounters {
                rx_drops: 4,
                rx_errors: 103,
                ..Default::default()
            },
            max,
        );
        let stats = block.snapshot();
        assert_eq!(stats.rx_drops, 7);
        assert_eq!(stats.rx_errors, 3);

        block.reset(Instant::now());
        block.absorb_link_counters(
            LinkCounters {
                rx_drops: 5,
                rx_errors: 103,
                ..Default::default()
            },
            max,
        );
        assert_eq!(block.snapshot().rx_drops, 1);
        assert_eq!(block.snapshot().rx_errors, 0);
    }

    #[test]
    fn test_reconfigure_starts_new_epoch() {
        let start = Instant::now();
        let mut block = StatsBlock::new(WindowConfig::default());
        block.record_rx(128);
        block.record_test_sample(&sample(0, 100));
        assert_eq!(block.window().sequence().size(), 128);

        block.reconfigure(
            WindowConfig {
                loss_window: 1000,
                ..Default::default()
            },
            start,
        );

        assert_eq!(block.window().sequence().size(), 1024);
        assert_eq!(block.snapshot(), PortStats::default());
        assert_eq!(block.window().packets(), 0);
    }
}
