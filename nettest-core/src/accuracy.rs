//! Transmit rate accuracy tiers
//!
//! Higher accuracy means the transmitter wakes up for every packet; lower
//! tiers let it sleep longer and send packets in bursts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Named trade-off between transmit timing precision and backend cost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateAccuracy {
    /// Per-packet timing
    #[default]
    High,
    /// Short batches
    Medium,
    /// Long batches, cheapest
    Low,
}

/// What a backend must honour for a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingProfile {
    /// Shortest sleep the transmitter takes; shorter waits are spun or
    /// accumulated
    pub timer_granularity: Duration,
    /// Most packets sent back-to-back per wakeup
    pub burst_size: usize,
}

impl RateAccuracy {
    /// All tiers, most accurate first
    pub const ALL: [RateAccuracy; 3] = [RateAccuracy::High, RateAccuracy::Medium, RateAccuracy::Low];

    /// Backend contract for this tier
    pub const fn profile(self) -> TimingProfile {
        match self {
            RateAccuracy::High => TimingProfile {
                timer_granularity: Duration::from_micros(1),
                burst_size: 1,
            },
            RateAccuracy::Medium => TimingProfile {
                timer_granularity: Duration::from_micros(100),
                burst_size: 16,
            },
            RateAccuracy::Low => TimingProfile {
                timer_granularity: Duration::from_millis(1),
                burst_size: 64,
            },
        }
    }
}

impl fmt::Display for RateAccuracy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RateAccuracy::High => "high",
            RateAccuracy::Medium => "medium",
            RateAccuracy::Low => "low",
        };
        f.write_str(name)
    }
}
