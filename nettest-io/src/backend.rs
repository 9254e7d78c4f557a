//! Transport backend contract
//!
//! A backend owns the wire side of a port: it holds the device packet list,
//! drains it at the configured rate, captures received frames and reports
//! link state. The port drives it through [`TransportBackend`] and receives
//! traffic back through a [`FrameSink`].

use bytes::Bytes;
use nettest_core::{LinkCounters, LoopMode, RateAccuracy, RxErrorKind, Schedule, TimingProfile};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Default bound on waiting for a backend worker to exit
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Backend errors
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend is not attached")]
    NotAttached,

    #[error("Not supported by this backend: {0}")]
    Unsupported(&'static str),

    #[error("Backend refused: {0}")]
    Refused(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Physical link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    #[default]
    Unknown,
    Up,
    Down,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Unknown => "unknown",
            LinkState::Up => "up",
            LinkState::Down => "down",
        };
        f.write_str(name)
    }
}

/// Receive-side callbacks, called from backend threads
pub trait FrameSink: Send + Sync {
    /// A frame arrived at `at`
    fn frame_received(&self, frame: &[u8], at: SystemTime);

    /// A frame of `len` bytes left the port
    fn frame_sent(&self, len: usize);

    /// The backend saw a receive error
    fn rx_error(&self, _kind: RxErrorKind) {}
}

/// Wire side of a port
pub trait TransportBackend: Send {
    /// Short human-readable backend name
    fn name(&self) -> &str;

    /// Bind to the interface and start delivering received frames to `sink`
    fn attach(&mut self, sink: Arc<dyn FrameSink>) -> Result<(), BackendError>;

    /// Stop all workers and release the interface
    fn detach(&mut self);

    fn has_exclusive_control(&self) -> bool;

    /// Request or release exclusive control; returns whether the backend
    /// now matches the request
    fn set_exclusive_control(&mut self, exclusive: bool) -> bool;

    fn link_state(&self) -> LinkState;

    /// Discard the packet list being staged
    ///
    /// The list currently in use keeps running until a new one is finalised.
    fn clear_packet_list(&mut self) -> Result<(), BackendError>;

    /// Open a packet set: the next `size` appended entries repeat `repeats`
    /// times with `delay` between passes
    fn loop_next_packet_set(
        &mut self,
        size: usize,
        repeats: u64,
        delay: Duration,
    ) -> Result<(), BackendError>;

    /// Append one entry to the staged list
    fn append_to_packet_list(&mut self, delay: Duration, frame: Bytes)
        -> Result<(), BackendError>;

    /// Set the device-level loop and finalise the staged list
    fn set_packet_list_loop_mode(&mut self, mode: LoopMode) -> Result<(), BackendError>;

    fn start_transmit(&mut self) -> Result<(), BackendError>;

    /// Stop transmitting; a no-op if not transmitting
    fn stop_transmit(&mut self) -> Result<(), BackendError>;

    fn is_transmit_on(&self) -> bool;

    fn start_capture(&mut self) -> Result<(), BackendError>;

    /// Stop capturing; a no-op if not capturing
    fn stop_capture(&mut self) -> Result<(), BackendError>;

    fn is_capture_on(&self) -> bool;

    /// Frames captured by the last capture session
    fn capture_data(&self) -> Result<Box<dyn Read + Send>, BackendError>;

    /// Current rate accuracy tier
    fn rate_accuracy(&self) -> RateAccuracy;

    /// Switch tier; on error the previous tier stays active
    fn set_rate_accuracy(
        &mut self,
        accuracy: RateAccuracy,
        profile: TimingProfile,
    ) -> Result<(), BackendError>;

    fn start_device_emulation(&mut self) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("device emulation"))
    }

    fn stop_device_emulation(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn is_device_emulation_on(&self) -> bool {
        false
    }

    /// Send a frame on behalf of an emulated device
    fn send_emulation_packet(&mut self, _frame: Bytes) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("device emulation"))
    }

    /// Transmit-affecting port configuration changed
    fn transmitter_config_changed(&mut self) {}

    /// Receive-side port configuration changed
    fn monitor_config_changed(&mut self) {}

    /// Absolute receive error counters, if the backend keeps any
    fn link_counters(&self) -> Option<LinkCounters> {
        None
    }

    /// Largest value a [`link_counters`](TransportBackend::link_counters)
    /// field holds before wrapping to zero
    fn max_counter_value(&self) -> u64 {
        u64::MAX
    }

    /// Stage and finalise a complete schedule
    fn install_schedule(&mut self, schedule: &Schedule) -> Result<(), BackendError> {
        self.clear_packet_list()?;
        for set in schedule.sets() {
            self.loop_next_packet_set(set.packets.len(), set.repeats, set.repeat_delay)?;
            for packet in &set.packets {
                self.append_to_packet_list(packet.delay, packet.frame.clone())?;
            }
        }
        self.set_packet_list_loop_mode(schedule.loop_mode())?;

        tracing::debug!(
            "{}: installed {} packets per pass",
            self.name(),
            schedule.packet_count()
        );
        Ok(())
    }
}
