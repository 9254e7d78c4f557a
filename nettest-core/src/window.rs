//! Streaming delay, jitter, loss and reorder estimation
//!
//! Every received test-flow packet is folded into the window exactly once.
//! State is fixed-size: a handful of running estimators plus a bitmap ring
//! covering the last `W` sequence numbers. Nothing grows with the number of
//! packets received.

use crate::mmo::Mmo;
use crate::sequence::SeqNumber;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Averaging window for delay MMO
pub const DEFAULT_DELAY_MMO_WINDOW: u32 = 16;
/// Averaging window for jitter MMO
pub const DEFAULT_JITTER_MMO_WINDOW: u32 = 16;
/// Out-of-order acceptance window, in sequence numbers
pub const DEFAULT_LOSS_WINDOW: u32 = 128;
/// Averaging window for loss and out-of-window MMO
pub const DEFAULT_LOSS_MMO_WINDOW: u32 = 128;
/// Largest reorder acceptance window; larger requests are clamped
pub const MAX_LOSS_WINDOW: u32 = 1 << 20;

/// Window sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// MMO window for one-way delay
    pub delay_mmo_window: u32,
    /// MMO window for jitter
    pub jitter_mmo_window: u32,
    /// Reorder acceptance window (rounded up to a power of two)
    pub loss_window: u32,
    /// MMO window for loss and out-of-window percentages
    pub loss_mmo_window: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            delay_mmo_window: DEFAULT_DELAY_MMO_WINDOW,
            jitter_mmo_window: DEFAULT_JITTER_MMO_WINDOW,
            loss_window: DEFAULT_LOSS_WINDOW,
            loss_mmo_window: DEFAULT_LOSS_MMO_WINDOW,
        }
    }
}

/// One received test-flow packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestSample {
    /// Sender-assigned sequence number
    pub seq: SeqNumber,
    /// Send timestamp (since the shared epoch)
    pub sent_at: Duration,
    /// Receive timestamp (since the same epoch)
    pub received_at: Duration,
    /// Frame length in bytes
    pub len: usize,
}

/// Running min/max/average/MMO of a microsecond quantity
#[derive(Debug, Clone)]
pub struct Estimator {
    min: u64,
    max: u64,
    sum: u128,
    count: u64,
    mmo: Mmo,
}

impl Estimator {
    /// Create an estimator whose MMO uses `mmo_window` samples
    pub fn new(mmo_window: u32) -> Self {
        Estimator {
            min: u64::MAX,
            max: 0,
            sum: 0,
            count: 0,
            mmo: Mmo::new(mmo_window),
        }
    }

    /// Fold in one sample (microseconds)
    #[inline]
    pub fn record(&mut self, sample_us: u64) {
        self.min = self.min.min(sample_us);
        self.max = self.max.max(sample_us);
        self.sum += u128::from(sample_us);
        self.count += 1;
        self.mmo.update(sample_us as f64);
    }

    /// Smallest sample, 0 when empty
    pub fn min(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.min
        }
    }

    /// Largest sample
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Arithmetic mean since the last reset
    pub fn average(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            (self.sum / u128::from(self.count)) as u64
        }
    }

    /// Modified moving average
    pub fn mmo(&self) -> f64 {
        self.mmo.value()
    }

    /// Number of samples
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Forget all samples
    pub fn reset(&mut self) {
        *self = Estimator::new(self.mmo.window());
    }
}

/// How a sequence number related to the window when it arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// First packet of the test, initialises the window
    First,
    /// Advanced the highest sequence seen; `skipped` numbers were jumped over
    Advanced { skipped: u32 },
    /// Filled a gap still inside the window
    Reordered,
    /// Already seen inside the window
    Duplicate,
    /// Arrived behind the trailing edge of the window
    Late,
    /// Older than the first packet of the test
    BeforeStart,
}

/// Loss and reorder tracking over a trailing window of sequence numbers
///
/// Bit `n mod W` of the ring says whether sequence number `n` has been seen.
/// When the highest sequence advances, slots leaving the trailing edge are
/// inspected before reuse; any still unset is a lost packet.
#[derive(Debug, Clone)]
pub struct SequenceWindow {
    size: u32,
    mask: u32,
    seen: Vec<u64>,
    first: Option<SeqNumber>,
    highest: SeqNumber,
    expected: u64,
    lost: u64,
    out_of_window: u64,
    duplicates: u64,
    reordered: u64,
}

impl SequenceWindow {
    /// Create a window covering `size` sequence numbers
    ///
    /// The size is clamped to `1..=MAX_LOSS_WINDOW` and rounded up to a
    /// power of two so that ring slots stay aligned when sequence numbers
    /// wrap at 2^32.
    pub fn new(size: u32) -> Self {
        let size = size
            .clamp(1, MAX_LOSS_WINDOW)
            .checked_next_power_of_two()
            .unwrap_or(MAX_LOSS_WINDOW);
        let words = (size as usize + 63) / 64;

        SequenceWindow {
            size,
            mask: size - 1,
            seen: vec![0; words],
            first: None,
            highest: SeqNumber::default(),
            expected: 0,
            lost: 0,
            out_of_window: 0,
            duplicates: 0,
            reordered: 0,
        }
    }

    #[inline]
    fn slot(&self, seq: SeqNumber) -> (usize, u64) {
        let idx = (seq.as_raw() & self.mask) as usize;
        (idx / 64, 1u64 << (idx % 64))
    }

    #[inline]
    fn is_seen(&self, seq: SeqNumber) -> bool {
        let (word, bit) = self.slot(seq);
        self.seen[word] & bit != 0
    }

    #[inline]
    fn mark(&mut self, seq: SeqNumber) {
        let (word, bit) = self.slot(seq);
        self.seen[word] |= bit;
    }

    #[inline]
    fn unmark(&mut self, seq: SeqNumber) {
        let (word, bit) = self.slot(seq);
        self.seen[word] &= !bit;
    }

    fn unseen_slots(&self) -> u64 {
        let used_bits = self.size.min(64);
        let valid = if used_bits == 64 {
            u64::MAX
        } else {
            (1u64 << used_bits) - 1
        };
        self.seen
            .iter()
            .map(|word| u64::from((!word & valid).count_ones()))
            .sum()
    }

    fn declare_lost(&mut self, count: u64) {
        self.lost += count;
        self.out_of_window += count;
    }

    /// Fold one sequence number into the window
    pub fn record(&mut self, seq: SeqNumber) -> Arrival {
        let Some(first) = self.first else {
            // Everything before the first packet counts as already seen.
            self.seen.fill(u64::MAX);
            self.first = Some(seq);
            self.highest = seq;
            self.expected = 1;
            return Arrival::First;
        };

        let distance = self.highest.distance_to(seq);

        if distance > 0 {
            let advance = distance as u32;
            if advance >= self.size {
                let skipped = u64::from(advance - self.size);
                let unseen = self.unseen_slots();
                self.declare_lost(unseen + skipped);
                self.seen.fill(0);
            } else {
                let mut n = self.highest;
                for _ in 0..advance {
                    n = n.next();
                    // Slot of `n` still describes `n - size`.
                    if !self.is_seen(n) {
                        self.declare_lost(1);
                    }
                    self.unmark(n);
                }
            }
            self.mark(seq);
            self.highest = seq;
            self.expected += u64::from(advance);
            return Arrival::Advanced {
                skipped: advance - 1,
            };
        }

        // Only meaningful while the window still reaches back to the start.
        if self.expected < u64::from(self.size) && seq.lt(first) {
            return Arrival::BeforeStart;
        }

        if distance > -(self.size as i64) as i32 {
            if self.is_seen(seq) {
                self.duplicates += 1;
                Arrival::Duplicate
            } else {
                self.mark(seq);
                self.reordered += 1;
                Arrival::Reordered
            }
        } else {
            self.out_of_window += 1;
            Arrival::Late
        }
    }

    /// Effective window size
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Highest sequence number seen, if any
    pub fn highest(&self) -> Option<SeqNumber> {
        self.first.map(|_| self.highest)
    }

    /// Sequence numbers covered so far (`highest - first + 1`)
    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Packets declared lost
    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Packets outside the window (lost plus late arrivals)
    pub fn out_of_window(&self) -> u64 {
        self.out_of_window
    }

    /// Duplicates seen inside the window
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Gaps filled after the highest sequence had moved past them
    pub fn reordered(&self) -> u64 {
        self.reordered
    }

    /// Loss over the life of the test, percent
    pub fn loss_percent(&self) -> f64 {
        percent(self.lost, self.expected)
    }

    /// Out-of-window over the life of the test, percent
    pub fn out_of_window_percent(&self) -> f64 {
        percent(self.out_of_window, self.expected)
    }

    /// Forget all history
    pub fn reset(&mut self) {
        *self = SequenceWindow::new(self.size);
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// Result of folding one sample into the window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Sequence classification
    pub arrival: Arrival,
    /// Signed one-way delay in microseconds
    pub delay_us: i64,
    /// Delay came out negative (clock error); estimators saw 0 instead
    pub clock_anomaly: bool,
}

/// Delay, jitter, loss and reorder estimators for one test flow
#[derive(Debug, Clone)]
pub struct StatisticsWindow {
    delay: Estimator,
    jitter: Estimator,
    prev_delay_us: Option<u64>,
    sequence: SequenceWindow,
    loss_mmo: Mmo,
    out_of_window_mmo: Mmo,
    packets: u64,
    bytes: u64,
    clock_anomalies: u64,
}

impl StatisticsWindow {
    /// Create an empty window
    pub fn new(config: WindowConfig) -> Self {
        StatisticsWindow {
            delay: Estimator::new(config.delay_mmo_window),
            jitter: Estimator::new(config.jitter_mmo_window),
            prev_delay_us: None,
            sequence: SequenceWindow::new(config.loss_window),
            loss_mmo: Mmo::new(config.loss_mmo_window),
            out_of_window_mmo: Mmo::new(config.loss_mmo_window),
            packets: 0,
            bytes: 0,
            clock_anomalies: 0,
        }
    }

    /// Fold in one received test-flow packet
    pub fn update(&mut self, sample: &TestSample) -> Observation {
        self.packets += 1;
        self.bytes += sample.len as u64;

        let delay_us = signed_micros(sample.received_at) - signed_micros(sample.sent_at);
        let clock_anomaly = delay_us < 0;
        if clock_anomaly {
            self.clock_anomalies += 1;
        }
        let delay = delay_us.max(0) as u64;

        self.delay.record(delay);
        if let Some(prev) = self.prev_delay_us {
            self.jitter.record(delay.abs_diff(prev));
        }
        self.prev_delay_us = Some(delay);

        let arrival = self.sequence.record(sample.seq);
        self.loss_mmo.update(self.sequence.loss_percent());
        self.out_of_window_mmo
            .update(self.sequence.out_of_window_percent());

        Observation {
            arrival,
            delay_us,
            clock_anomaly,
        }
    }

    /// One-way delay estimator
    pub fn delay(&self) -> &Estimator {
        &self.delay
    }

    /// Jitter estimator
    pub fn jitter(&self) -> &Estimator {
        &self.jitter
    }

    /// Previous (clamped) delay sample in microseconds
    pub fn prev_delay_us(&self) -> u64 {
        self.prev_delay_us.unwrap_or(0)
    }

    /// Loss/reorder tracker
    pub fn sequence(&self) -> &SequenceWindow {
        &self.sequence
    }

    /// Smoothed loss percentage
    pub fn mmo_loss_percent(&self) -> f64 {
        self.loss_mmo.value()
    }

    /// Smoothed out-of-window percentage
    pub fn mmo_out_of_window_percent(&self) -> f64 {
        self.out_of_window_mmo.value()
    }

    /// Test-flow packets folded in
    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// Test-flow bytes folded in
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Samples whose delay came out negative
    pub fn clock_anomalies(&self) -> u64 {
        self.clock_anomalies
    }

    /// Forget all history, keeping the configuration
    pub fn reset(&mut self) {
        self.delay.reset();
        self.jitter.reset();
        self.prev_delay_us = None;
        self.sequence.reset();
        self.loss_mmo.reset();
        self.out_of_window_mmo.reset();
        self.packets = 0;
        self.bytes = 0;
        self.clock_anomalies = 0;
    }
}

impl Default for StatisticsWindow {
    fn default() -> Self {
        StatisticsWindow::new(WindowConfig::default())
    }
}

fn signed_micros(ts: Duration) -> i64 {
    i64::try_from(ts.as_micros()).unwrap_or(i64::MAX)
}
