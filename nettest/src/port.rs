//! Port engine
//!
//! A [`Port`] owns one transmit/receive endpoint: the streams configured on
//! it, the device schedule built from them, and the statistics computed from
//! what it receives. Configuration calls run on the caller's thread; the
//! backend delivers traffic from its own threads through a [`PortRecorder`].

use crate::config::{PortConfig, PortConfigDelta, PortSnapshot, StreamSummary};
use crate::device::{DeviceManager, MacAddr, StaticDeviceTable, MAX_L3_INSPECT};
use crate::notes::{Note, NoteLog, NoteSink, Severity};
use bytes::Bytes;
use nettest_core::{
    PortStats, RateAccuracy, RxErrorKind, Schedule, ScheduleBuilder, ScheduleError,
    ScheduleLimits, StatsBlock, Stream, StreamId, TestSample, TestTag,
};
use nettest_io::{since_epoch, BackendError, FrameSink, LinkState, TransportBackend};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Read;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use thiserror::Error;

/// Port errors
#[derive(Error, Debug)]
pub enum PortError {
    #[error("Port {0} is not usable")]
    Unusable(u32),

    #[error("Duplicate stream: {0}")]
    DuplicateStream(StreamId),

    #[error("Stream not found: {0}")]
    StreamNotFound(StreamId),

    #[error("{stream} has no frame {index}")]
    InvalidIndex { stream: StreamId, index: usize },

    #[error("Rate accuracy {0} not supported by the backend")]
    UnsupportedAccuracy(RateAccuracy),

    #[error("Exclusive control refused by the backend")]
    ExclusiveControlRefused,

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Receive-side handle the backend calls into
///
/// Cheap to clone; every clone updates the same statistics.
#[derive(Clone)]
pub struct PortRecorder {
    port_id: u32,
    stats: Arc<Mutex<StatsBlock>>,
    notes: Arc<dyn NoteSink>,
    anomaly_noted: Arc<AtomicBool>,
}

impl PortRecorder {
    /// Current statistics
    pub fn stats(&self) -> PortStats {
        self.stats.lock().snapshot()
    }
}

impl FrameSink for PortRecorder {
    fn frame_received(&self, frame: &[u8], at: SystemTime) {
        let tag = TestTag::parse(frame);
        let observation = {
            let mut stats = self.stats.lock();
            stats.record_rx(frame.len());
            tag.map(|tag| {
                stats.record_test_sample(&TestSample {
                    seq: tag.seq,
                    sent_at: tag.sent_at,
                    received_at: since_epoch(at),
                    len: frame.len(),
                })
            })
        };

        // One note per measurement epoch is enough
        if let Some(observation) = observation {
            if observation.clock_anomaly && !self.anomaly_noted.swap(true, Ordering::Relaxed) {
                self.notes.add_note(
                    Severity::Warning,
                    format!(
                        "port {}: negative one-way delay ({} us), sender and receiver clocks disagree",
                        self.port_id, observation.delay_us
                    ),
                );
            }
        }
    }

    fn frame_sent(&self, len: usize) {
        self.stats.lock().record_tx(len);
    }

    fn rx_error(&self, kind: RxErrorKind) {
        self.stats.lock().record_rx_error(kind);
    }
}

/// Frame prefix handed to device lookups
fn inspect_prefix(frame: &[u8]) -> &[u8] {
    &frame[..frame.len().min(MAX_L3_INSPECT)]
}

/// One traffic generator port
pub struct Port {
    id: u32,
    config: PortConfig,
    usable: bool,
    backend: Box<dyn TransportBackend>,
    devices: Box<dyn DeviceManager>,
    notes: Arc<dyn NoteSink>,
    streams: Vec<Arc<dyn Stream>>,
    index: HashMap<StreamId, usize>,
    schedule: Arc<Schedule>,
    limits: ScheduleLimits,
    dirty: bool,
    rebuilds: u64,
    stats: Arc<Mutex<StatsBlock>>,
    anomaly_noted: Arc<AtomicBool>,
}

impl Port {
    /// Create an unattached port; call [`init`](Port::init) before use
    pub fn new(id: u32, config: PortConfig, backend: Box<dyn TransportBackend>) -> Self {
        let stats = StatsBlock::new(config.window);
        Port {
            id,
            config,
            usable: false,
            backend,
            devices: Box::new(StaticDeviceTable::new()),
            notes: Arc::new(NoteLog::default()),
            streams: Vec::new(),
            index: HashMap::new(),
            schedule: Arc::new(Schedule::empty()),
            limits: ScheduleLimits::default(),
            dirty: true,
            rebuilds: 0,
            stats: Arc::new(Mutex::new(stats)),
            anomaly_noted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use `devices` for neighbor resolution and MAC lookups
    pub fn with_device_manager(mut self, devices: Box<dyn DeviceManager>) -> Self {
        self.devices = devices;
        self
    }

    /// Send notes to `notes`
    pub fn with_note_sink(mut self, notes: Arc<dyn NoteSink>) -> Self {
        self.notes = notes;
        self
    }

    /// Bound schedule construction
    pub fn with_limits(mut self, limits: ScheduleLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Attach the backend
    ///
    /// Success makes the port usable. On failure the port stays unusable and
    /// an error note is recorded.
    pub fn init(&mut self) -> Result<(), PortError> {
        if self.usable {
            return Ok(());
        }

        if let Err(e) = self.backend.attach(Arc::new(self.recorder())) {
            self.note(Severity::Error, format!("cannot attach {} backend: {}", self.backend.name(), e));
            return Err(e.into());
        }
        self.usable = true;

        if self.config.exclusive_control && !self.backend.set_exclusive_control(true) {
            self.config.exclusive_control = false;
            self.note(Severity::Warning, "exclusive control not granted".to_string());
        }

        tracing::info!(
            "Port {} ({}) ready on {} backend",
            self.id,
            self.config.name,
            self.backend.name()
        );
        Ok(())
    }

    /// Receive-side handle sharing this port's statistics
    pub fn recorder(&self) -> PortRecorder {
        PortRecorder {
            port_id: self.id,
            stats: Arc::clone(&self.stats),
            notes: Arc::clone(&self.notes),
            anomaly_noted: Arc::clone(&self.anomaly_noted),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    /// Whether the backend is attached
    pub fn is_usable(&self) -> bool {
        self.usable
    }

    fn ensure_usable(&self) -> Result<(), PortError> {
        if self.usable {
            Ok(())
        } else {
            Err(PortError::Unusable(self.id))
        }
    }

    fn note(&self, severity: Severity, message: String) {
        self.notes
            .add_note(severity, format!("port {}: {}", self.id, message));
    }

    /// Record an operator note
    pub fn add_note(&self, severity: Severity, message: impl Into<String>) {
        self.note(severity, message.into());
    }

    /// Notes retained by the note sink
    pub fn notes(&self) -> Vec<Note> {
        self.notes.history()
    }

    // Schedule

    /// Whether a stream or transmit setting changed since the last build
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Schedule last accepted by the backend
    pub fn schedule(&self) -> Arc<Schedule> {
        Arc::clone(&self.schedule)
    }

    /// Schedules built and installed so far
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Rebuild and install the schedule if anything changed
    ///
    /// The dirty flag is cleared only once the backend accepted the new
    /// list.
    pub fn update_schedule(&mut self) -> Result<(), PortError> {
        if !self.dirty {
            return Ok(());
        }

        let built = ScheduleBuilder::new(self.config.transmit_mode)
            .with_loop_mode(self.config.loop_mode)
            .with_limits(self.limits)
            .build(&self.streams);
        let schedule = match built {
            Ok(schedule) => schedule,
            Err(e) => {
                self.note(Severity::Error, format!("schedule rejected: {}", e));
                return Err(e.into());
            }
        };

        if let Err(e) = self.backend.install_schedule(&schedule) {
            self.note(Severity::Error, format!("backend refused schedule: {}", e));
            return Err(e.into());
        }

        self.schedule = Arc::new(schedule);
        self.dirty = false;
        self.rebuilds += 1;
        tracing::debug!(
            "Port {}: schedule rebuilt, {} packets per pass",
            self.id,
            self.schedule.packet_count()
        );
        Ok(())
    }

    // Transmit and capture

    /// Start transmitting, rebuilding the schedule first if needed
    pub fn start_transmit(&mut self) -> Result<(), PortError> {
        self.ensure_usable()?;
        self.update_schedule()?;
        self.backend.start_transmit()?;

        tracing::info!(
            "Port {}: transmit started ({}, {} packets per pass)",
            self.id,
            self.backend.rate_accuracy(),
            self.schedule.packet_count()
        );
        Ok(())
    }

    /// Stop transmitting; succeeds when nothing is running
    pub fn stop_transmit(&mut self) -> Result<(), PortError> {
        self.backend.stop_transmit()?;
        Ok(())
    }

    pub fn is_transmit_on(&self) -> bool {
        self.backend.is_transmit_on()
    }

    pub fn start_capture(&mut self) -> Result<(), PortError> {
        self.ensure_usable()?;
        self.backend.start_capture()?;
        Ok(())
    }

    pub fn stop_capture(&mut self) -> Result<(), PortError> {
        self.backend.stop_capture()?;
        Ok(())
    }

    pub fn is_capture_on(&self) -> bool {
        self.backend.is_capture_on()
    }

    /// Byte stream of the last capture
    pub fn capture_data(&self) -> Result<Box<dyn Read + Send>, PortError> {
        Ok(self.backend.capture_data()?)
    }

    // Device emulation

    pub fn start_device_emulation(&mut self) -> Result<(), PortError> {
        self.ensure_usable()?;
        self.backend.start_device_emulation()?;
        Ok(())
    }

    pub fn stop_device_emulation(&mut self) -> Result<(), PortError> {
        self.backend.stop_device_emulation()?;
        Ok(())
    }

    pub fn is_device_emulation_on(&self) -> bool {
        self.backend.is_device_emulation_on()
    }

    /// Send a frame on behalf of an emulated device
    pub fn send_emulation_packet(&mut self, frame: Bytes) -> Result<(), PortError> {
        self.ensure_usable()?;
        self.backend.send_emulation_packet(frame)?;
        Ok(())
    }

    /// Ask the device manager to resolve the neighbor of every frame of
    /// every enabled stream
    pub fn resolve_device_neighbors(&mut self) {
        let mut frames = 0usize;
        for stream in self.streams.iter().filter(|s| s.is_enabled()) {
            for emission in stream.emissions() {
                self.devices.resolve_neighbors(inspect_prefix(&emission.frame));
                frames += 1;
            }
        }
        tracing::debug!("Port {}: neighbor resolution for {} frames", self.id, frames);
    }

    pub fn clear_device_neighbors(&mut self) {
        self.devices.clear_neighbors();
    }

    fn frame_of(&self, id: StreamId, frame_index: usize) -> Result<Bytes, PortError> {
        let stream = self.stream(id).ok_or(PortError::StreamNotFound(id))?;
        stream.frame(frame_index).ok_or(PortError::InvalidIndex {
            stream: id,
            index: frame_index,
        })
    }

    /// MAC of the emulated device sending frame `frame_index` of a stream
    ///
    /// `frame_index` counts across repeats and wraps at the burst length.
    pub fn device_mac_address(
        &self,
        id: StreamId,
        frame_index: usize,
    ) -> Result<Option<MacAddr>, PortError> {
        let frame = self.frame_of(id, frame_index)?;
        Ok(self.devices.device_mac(inspect_prefix(&frame)))
    }

    /// Resolved MAC of the neighbor frame `frame_index` of a stream is sent to
    pub fn neighbor_mac_address(
        &self,
        id: StreamId,
        frame_index: usize,
    ) -> Result<Option<MacAddr>, PortError> {
        let frame = self.frame_of(id, frame_index)?;
        Ok(self.devices.neighbor_mac(inspect_prefix(&frame)))
    }

    // Configuration

    /// Apply a configuration change
    ///
    /// An exclusive-control change is settled with the backend first; if it
    /// is refused nothing else in the delta is applied.
    pub fn modify(&mut self, delta: PortConfigDelta) -> Result<(), PortError> {
        if let Some(exclusive) = delta.exclusive_control {
            if exclusive != self.backend.has_exclusive_control()
                && !self.backend.set_exclusive_control(exclusive)
            {
                self.note(
                    Severity::Warning,
                    format!("exclusive control change to {} refused", exclusive),
                );
                return Err(PortError::ExclusiveControlRefused);
            }
            self.config.exclusive_control = exclusive;
        }

        let affects_transmit = delta.affects_transmit(&self.config);
        let affects_monitor = delta.affects_monitor(&self.config);
        if let Some(name) = delta.name {
            self.config.name = name;
        }
        if let Some(description) = delta.description {
            self.config.description = description;
        }
        if let Some(mode) = delta.transmit_mode {
            self.config.transmit_mode = mode;
        }
        if let Some(loop_mode) = delta.loop_mode {
            self.config.loop_mode = loop_mode;
        }

        if affects_transmit {
            self.mark_dirty();
            self.backend.transmitter_config_changed();
        }
        if let Some(window) = delta.window.filter(|_| affects_monitor) {
            self.config.window = window;
            self.stats.lock().reconfigure(window, Instant::now());
            self.anomaly_noted.store(false, Ordering::Relaxed);
            self.backend.monitor_config_changed();
            tracing::info!(
                "Port {}: receive window now {} sequence numbers",
                self.id,
                window.loss_window
            );
        }
        Ok(())
    }

    /// Switch rate accuracy tier; the previous tier stays on failure
    pub fn set_rate_accuracy(&mut self, accuracy: RateAccuracy) -> Result<(), PortError> {
        match self.backend.set_rate_accuracy(accuracy, accuracy.profile()) {
            Ok(()) => {
                tracing::info!("Port {}: rate accuracy {}", self.id, accuracy);
                Ok(())
            }
            Err(BackendError::Unsupported(_)) => Err(PortError::UnsupportedAccuracy(accuracy)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn rate_accuracy(&self) -> RateAccuracy {
        self.backend.rate_accuracy()
    }

    pub fn link_state(&self) -> LinkState {
        self.backend.link_state()
    }

    // Streams

    /// Append a stream; its id must be new to this port
    pub fn add_stream(&mut self, stream: Arc<dyn Stream>) -> Result<(), PortError> {
        let id = stream.id();
        if self.index.contains_key(&id) {
            return Err(PortError::DuplicateStream(id));
        }

        self.index.insert(id, self.streams.len());
        self.streams.push(stream);
        self.mark_dirty();
        Ok(())
    }

    /// Remove a stream, shifting later streams down one position
    pub fn delete_stream(&mut self, id: StreamId) -> Result<Arc<dyn Stream>, PortError> {
        let position = self.index.remove(&id).ok_or(PortError::StreamNotFound(id))?;
        let stream = self.streams.remove(position);
        for slot in self.index.values_mut() {
            if *slot > position {
                *slot -= 1;
            }
        }

        self.mark_dirty();
        Ok(stream)
    }

    /// Swap in a new version of a stream, keeping its position
    pub fn replace_stream(&mut self, stream: Arc<dyn Stream>) -> Result<Arc<dyn Stream>, PortError> {
        let id = stream.id();
        let position = *self.index.get(&id).ok_or(PortError::StreamNotFound(id))?;
        let old = mem::replace(&mut self.streams[position], stream);

        self.mark_dirty();
        Ok(old)
    }

    /// A stream's content changed behind its `Arc`
    pub fn stream_modified(&mut self, id: StreamId) -> Result<(), PortError> {
        if !self.index.contains_key(&id) {
            return Err(PortError::StreamNotFound(id));
        }
        self.mark_dirty();
        Ok(())
    }

    /// Stream at a position in insertion order
    pub fn stream_at_index(&self, index: usize) -> Option<&Arc<dyn Stream>> {
        self.streams.get(index)
    }

    pub fn stream(&self, id: StreamId) -> Option<&Arc<dyn Stream>> {
        self.index.get(&id).map(|&position| &self.streams[position])
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    // Statistics

    /// Current statistics
    pub fn stats(&self) -> PortStats {
        self.stats.lock().snapshot()
    }

    /// Zero every counter, rate and estimator
    pub fn reset_stats(&self) {
        self.stats.lock().reset(Instant::now());
        self.anomaly_noted.store(false, Ordering::Relaxed);
    }

    /// Recompute packet and bit rates over the time since the last refresh
    pub fn refresh_rates(&self) {
        self.stats.lock().refresh_rates(Instant::now());
    }

    /// Fold the backend's interface error counters into the statistics
    pub fn absorb_link_counters(&self) {
        if let Some(reading) = self.backend.link_counters() {
            let max = self.backend.max_counter_value();
            self.stats.lock().absorb_link_counters(reading, max);
        }
    }

    /// Periodic statistics poll: link counters, then rates
    pub fn poll_stats(&self) {
        self.absorb_link_counters();
        self.refresh_rates();
    }

    /// Serializable view of the whole port
    pub fn snapshot(&self) -> PortSnapshot {
        PortSnapshot {
            id: self.id,
            config: self.config.clone(),
            usable: self.usable,
            link_state: self.link_state(),
            rate_accuracy: self.rate_accuracy(),
            exclusive_control: self.backend.has_exclusive_control(),
            transmit_on: self.is_transmit_on(),
            capture_on: self.is_capture_on(),
            device_emulation_on: self.is_device_emulation_on(),
            schedule_dirty: self.dirty,
            scheduled_packets: self.schedule.packet_count(),
            streams: self
                .streams
                .iter()
                .map(|s| StreamSummary {
                    id: s.id(),
                    enabled: s.is_enabled(),
                    mode: s.mode(),
                    frames: s.frame_count(),
                    repeats: s.repeat_count(),
                })
                .collect(),
            stats: self.stats(),
            notes: self.notes(),
        }
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        if self.usable {
            self.backend.detach();
        }
    }
}
