//! NetTest - per-port traffic generator and analyzer engine
//!
//! High-level API: a [`Port`] wired to a transport backend, with device
//! emulation and operator notes.

pub use nettest_core as core;
pub use nettest_io as io;

pub mod config;
pub mod device;
pub mod notes;
pub mod port;

pub use config::{PortConfig, PortConfigDelta, PortSnapshot, StreamSummary};
pub use device::{l3_endpoints, DeviceManager, MacAddr, StaticDeviceTable, MAX_L3_INSPECT};
pub use notes::{Note, NoteLog, NoteSink, Severity};
pub use port::{Port, PortError, PortRecorder};

// Re-export commonly used types
pub use nettest_core::{
    BurstStream, LoopMode, PortStats, RateAccuracy, Stream, StreamId, StreamMode, TransmitMode,
};
pub use nettest_io::{LinkState, SimBackend, SimConfig, TransportBackend, UdpBackend, UdpConfig};
