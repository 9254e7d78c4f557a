//! Configuration file support for the port driver

use bytes::Bytes;
use nettest::{
    BurstStream, LoopMode, PortConfig, RateAccuracy, SimConfig, Stream, StreamId, StreamMode,
    TransmitMode, UdpConfig,
};
use nettest_core::{TestTag, WindowConfig, MAX_FRAME_SIZE, MAX_LOSS_WINDOW, TAG_LEN};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Device-level loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LoopConfig {
    #[default]
    Once,
    Repeat {
        count: u64,
        #[serde(default)]
        delay_us: u64,
    },
    Forever {
        #[serde(default)]
        delay_us: u64,
    },
}

impl LoopConfig {
    pub fn to_loop_mode(self) -> LoopMode {
        match self {
            LoopConfig::Once => LoopMode::Once,
            LoopConfig::Repeat { count, delay_us } => LoopMode::Repeat {
                count,
                delay: Duration::from_micros(delay_us),
            },
            LoopConfig::Forever { delay_us } => LoopMode::Forever {
                delay: Duration::from_micros(delay_us),
            },
        }
    }
}

/// Port section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSection {
    /// Port number
    #[serde(default)]
    pub id: u32,
    /// Port name
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub transmit_mode: TransmitMode,
    #[serde(default)]
    pub accuracy: RateAccuracy,
    #[serde(default, rename = "loop")]
    pub loop_config: LoopConfig,
    #[serde(default)]
    pub exclusive_control: bool,
    /// Statistics interval in milliseconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval_ms: u64,
    /// Receive window sizing
    #[serde(default)]
    pub window: WindowConfig,
}

fn default_stats_interval() -> u64 {
    1000
}

/// Transport backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendSection {
    /// In-process loopback
    Sim {
        /// Drop every Nth received frame
        drop_every: Option<u64>,
        /// Simulated one-way delay in microseconds
        #[serde(default)]
        wire_delay_us: u64,
    },
    /// UDP datagrams
    Udp {
        bind: SocketAddr,
        peer: Option<SocketAddr>,
        send_buffer: Option<usize>,
        recv_buffer: Option<usize>,
    },
}

impl BackendSection {
    /// Simulator settings, if this is the simulated backend
    pub fn sim_config(&self) -> Option<SimConfig> {
        match *self {
            BackendSection::Sim {
                drop_every,
                wire_delay_us,
            } => Some(SimConfig {
                drop_every,
                wire_delay: Duration::from_micros(wire_delay_us),
                ..Default::default()
            }),
            BackendSection::Udp { .. } => None,
        }
    }

    /// Socket settings, if this is the UDP backend
    pub fn udp_config(&self) -> Option<UdpConfig> {
        match *self {
            BackendSection::Udp {
                bind,
                peer,
                send_buffer,
                recv_buffer,
            } => {
                let mut config = UdpConfig::new(bind, peer);
                config.send_buffer = send_buffer;
                config.recv_buffer = recv_buffer;
                Some(config)
            }
            BackendSection::Sim { .. } => None,
        }
    }
}

/// One stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSection {
    pub id: u32,
    /// Explicit frames as hex strings
    #[serde(default)]
    pub frames: Vec<String>,
    /// Size of generated frames when `frames` is empty
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
    /// Number of generated frames when `frames` is empty
    #[serde(default = "default_frame_count")]
    pub frame_count: usize,
    /// Append a test tag to every frame
    #[serde(default = "default_true")]
    pub tagged: bool,
    /// Gap between frames in microseconds
    #[serde(default)]
    pub gap_us: u64,
    #[serde(default = "default_repeats")]
    pub repeats: u64,
    /// Gap between bursts in microseconds
    #[serde(default)]
    pub repeat_delay_us: u64,
    #[serde(default)]
    pub mode: StreamMode,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_frame_size() -> usize {
    128
}

fn default_frame_count() -> usize {
    1
}

fn default_repeats() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

impl StreamSection {
    /// Build the stream this section describes
    pub fn build(&self) -> Result<Arc<dyn Stream>, ConfigError> {
        let mut frames = Vec::new();

        if self.frames.is_empty() {
            let body = if self.tagged {
                self.frame_size.checked_sub(TAG_LEN).ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "stream {}: frame_size {} cannot hold a {} byte test tag",
                        self.id, self.frame_size, TAG_LEN
                    ))
                })?
            } else {
                self.frame_size
            };
            for i in 0..self.frame_count {
                frames.push(self.finish_frame(vec![i as u8; body]));
            }
        } else {
            for (i, hex) in self.frames.iter().enumerate() {
                let bytes = decode_hex(hex).ok_or_else(|| {
                    ConfigError::Invalid(format!("stream {}: frame {} is not valid hex", self.id, i))
                })?;
                frames.push(self.finish_frame(bytes));
            }
        }

        if let Some(frame) = frames.iter().find(|f| f.len() > MAX_FRAME_SIZE) {
            return Err(ConfigError::Invalid(format!(
                "stream {}: {} byte frame exceeds {}",
                self.id,
                frame.len(),
                MAX_FRAME_SIZE
            )));
        }

        Ok(Arc::new(
            BurstStream::new(StreamId(self.id), frames)
                .with_gap(Duration::from_micros(self.gap_us))
                .with_repeats(self.repeats, Duration::from_micros(self.repeat_delay_us))
                .with_mode(self.mode)
                .with_enabled(self.enabled),
        ))
    }

    fn finish_frame(&self, mut body: Vec<u8>) -> Bytes {
        if self.tagged {
            body.extend_from_slice(&TestTag::placeholder());
        }
        Bytes::from(body)
    }
}

/// Decode a hex string, ignoring whitespace and `:` separators
pub fn decode_hex(text: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = text
        .bytes()
        .filter(|b| !b.is_ascii_whitespace() && *b != b':')
        .collect();
    if digits.len() % 2 != 0 {
        return None;
    }

    digits
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}

fn validate_window(window: &WindowConfig) -> Result<(), ConfigError> {
    if window.loss_window == 0 || window.loss_window > MAX_LOSS_WINDOW {
        return Err(ConfigError::Invalid(format!(
            "loss_window must be in 1..={}, got {}",
            MAX_LOSS_WINDOW, window.loss_window
        )));
    }
    let mmo_windows = [
        ("delay_mmo_window", window.delay_mmo_window),
        ("jitter_mmo_window", window.jitter_mmo_window),
        ("loss_mmo_window", window.loss_mmo_window),
    ];
    if let Some((name, _)) = mmo_windows.iter().find(|(_, size)| *size == 0) {
        return Err(ConfigError::Invalid(format!("{} must be positive", name)));
    }
    Ok(())
}

/// Whole configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: PortSection,
    pub backend: BackendSection,
    #[serde(default)]
    pub streams: Vec<StreamSection>,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids: Vec<u32> = self.streams.iter().map(|s| s.id).collect();
        ids.sort_unstable();
        if let Some(pair) = ids.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ConfigError::Invalid(format!(
                "stream id {} used twice",
                pair[0]
            )));
        }
        if self.port.stats_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "stats_interval_ms must be positive".to_string(),
            ));
        }
        validate_window(&self.port.window)
    }

    /// Engine configuration for the port section
    pub fn port_config(&self) -> PortConfig {
        PortConfig {
            name: self.port.name.clone(),
            description: self.port.description.clone(),
            transmit_mode: self.port.transmit_mode,
            loop_mode: self.port.loop_config.to_loop_mode(),
            exclusive_control: self.port.exclusive_control,
            window: self.port.window,
        }
    }

    /// Build every configured stream
    pub fn build_streams(&self) -> Result<Vec<Arc<dyn Stream>>, ConfigError> {
        self.streams.iter().map(StreamSection::build).collect()
    }

    /// Statistics interval as Duration
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.port.stats_interval_ms)
    }

    /// Example: two interleaved test streams over the simulated backend
    pub fn example() -> Self {
        Config {
            port: PortSection {
                id: 0,
                name: "port0".to_string(),
                description: "loopback demo".to_string(),
                transmit_mode: TransmitMode::Interleaved,
                accuracy: RateAccuracy::Medium,
                loop_config: LoopConfig::Forever { delay_us: 1000 },
                exclusive_control: false,
                stats_interval_ms: 1000,
                window: WindowConfig::default(),
            },
            backend: BackendSection::Sim {
                drop_every: Some(1000),
                wire_delay_us: 250,
            },
            streams: vec![
                StreamSection {
                    id: 1,
                    frames: Vec::new(),
                    frame_size: 128,
                    frame_count: 4,
                    tagged: true,
                    gap_us: 100,
                    repeats: 100,
                    repeat_delay_us: 500,
                    mode: StreamMode::Merged,
                    enabled: true,
                },
                StreamSection {
                    id: 2,
                    frames: vec!["ffffffffffff0200000000010800".to_string()],
                    frame_size: 64,
                    frame_count: 1,
                    tagged: true,
                    gap_us: 0,
                    repeats: 50,
                    repeat_delay_us: 1000,
                    mode: StreamMode::Merged,
                    enabled: true,
                },
            ],
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
