//! Transport backends for the port engine
//!
//! This crate provides the backend contract the engine drives, the transmit
//! worker and packet list shared by the bundled backends, pacing clocks,
//! pcap capture, and two backends: an in-process simulation and UDP
//! sockets.

pub mod backend;
pub mod pcap;
pub mod sim;
pub mod time;
pub mod transmit;
pub mod udp;

pub use backend::{BackendError, FrameSink, LinkState, TransportBackend, DEFAULT_STOP_TIMEOUT};
pub use pcap::{parse_records, Capture, CaptureBuffer, CapturedFrame, DEFAULT_MAX_CAPTURE_BYTES};
pub use sim::{SimBackend, SimConfig};
pub use time::{since_epoch, unix_now, Pace, Pacer, Ticker};
pub use transmit::{PacketList, TransmitJob, Wire, Worker};
pub use udp::{UdpBackend, UdpConfig};
