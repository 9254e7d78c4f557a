//! Port configuration and snapshots

use crate::notes::Note;
use nettest_core::{
    LoopMode, PortStats, RateAccuracy, StreamId, StreamMode, TransmitMode,
    WindowConfig,
};
use nettest_io::LinkState;
use serde::{Deserialize, Serialize};

/// Settings a port starts with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub name: String,
    pub description: String,
    pub transmit_mode: TransmitMode,
    /// Device-level repetition of the whole schedule
    pub loop_mode: LoopMode,
    /// Request exclusive control of the interface on init
    pub exclusive_control: bool,
    /// Receive-side statistics window sizing
    pub window: WindowConfig,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            name: String::from("port"),
            description: String::new(),
            transmit_mode: TransmitMode::Sequential,
            loop_mode: LoopMode::Once,
            exclusive_control: false,
            window: WindowConfig::default(),
        }
    }
}

/// Partial configuration change; `None` fields are left alone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfigDelta {
    pub name: Option<String>,
    pub description: Option<String>,
    pub transmit_mode: Option<TransmitMode>,
    pub loop_mode: Option<LoopMode>,
    pub exclusive_control: Option<bool>,
    /// New receive window sizing; starts a new measurement epoch
    pub window: Option<WindowConfig>,
}

impl PortConfigDelta {
    /// Whether applying this delta to `config` changes what gets sent
    pub fn affects_transmit(&self, config: &PortConfig) -> bool {
        self.transmit_mode.map_or(false, |m| m != config.transmit_mode)
            || self.loop_mode.map_or(false, |m| m != config.loop_mode)
    }

    /// Whether applying this delta to `config` changes how traffic is measured
    pub fn affects_monitor(&self, config: &PortConfig) -> bool {
        self.window.map_or(false, |w| w != config.window)
    }
}

/// One configured stream as seen from outside
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub id: StreamId,
    pub enabled: bool,
    pub mode: StreamMode,
    pub frames: usize,
    pub repeats: u64,
}

/// Serializable view of a port
#[derive(Debug, Clone, Serialize)]
pub struct PortSnapshot {
    pub id: u32,
    pub config: PortConfig,
    pub usable: bool,
    pub link_state: LinkState,
    pub rate_accuracy: RateAccuracy,
    pub exclusive_control: bool,
    pub transmit_on: bool,
    pub capture_on: bool,
    pub device_emulation_on: bool,
    pub schedule_dirty: bool,
    pub scheduled_packets: u64,
    pub streams: Vec<StreamSummary>,
    pub stats: PortStats,
    pub notes: Vec<Note>,
}
