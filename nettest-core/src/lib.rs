//! Per-port traffic generator engine core
//!
//! Everything here is pure computation with no I/O: sequence arithmetic,
//! the receive-side statistics window, port counters, the test-flow tag,
//! rate accuracy tiers and the transmit schedule builder.

pub mod accuracy;
pub mod mmo;
pub mod schedule;
pub mod sequence;
pub mod stats;
pub mod stream;
pub mod tag;
pub mod window;

pub use accuracy::{RateAccuracy, TimingProfile};
pub use mmo::Mmo;
pub use schedule::{
    LoopMode, PacketSet, Schedule, ScheduleBuilder, ScheduleError, ScheduleLimits,
    ScheduledPacket, TransmitMode, MAX_FRAME_SIZE,
};
pub use sequence::SeqNumber;
pub use stats::{counter_delta, LinkCounters, PortStats, RxErrorKind, StatsBlock};
pub use stream::{BurstStream, Emission, Stream, StreamId, StreamMode};
pub use tag::{TestTag, TAG_LEN, TAG_MAGIC};
pub use window::{
    Arrival, Observation, StatisticsWindow, TestSample, WindowConfig, MAX_LOSS_WINDOW,
};
