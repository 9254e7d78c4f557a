//! NetTest CLI Library
//!
//! Shared functionality for the port driver.

pub mod config;
pub mod stats;

pub use config::{BackendSection, Config, ConfigError, LoopConfig, PortSection, StreamSection};
pub use stats::{display_compact_stats, display_port_stats, format_bandwidth, format_bytes};
