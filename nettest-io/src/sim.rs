//! Simulated loopback backend
//!
//! Frames travel over an in-process channel instead of a NIC. A backend
//! built with [`SimBackend::loopback`] receives its own transmissions; a
//! [`SimBackend::pair`] models two ports joined by a cable. Knobs on
//! [`SimConfig`] inject the failures a real interface can produce.

use crate::backend::{BackendError, FrameSink, LinkState, TransportBackend, DEFAULT_STOP_TIMEOUT};
use crate::pcap::Capture;
use crate::transmit::{PacketList, TransmitJob, Wire, Worker};
use bytes::Bytes;
use crossbeam::channel::{self, select, Receiver, Sender};
use nettest_core::{LinkCounters, LoopMode, RateAccuracy, TimingProfile};
use std::io::{self, Read};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Simulated interface behaviour
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Reported link state while attached
    pub link_state: LinkState,
    /// Whether exclusive control can be granted
    pub allow_exclusive_control: bool,
    /// Tiers the interface accepts
    pub accuracies: Vec<RateAccuracy>,
    /// Make `attach` fail
    pub fail_attach: bool,
    /// Make packet list installation fail
    pub refuse_packet_list: bool,
    /// Drop every Nth received frame, counting it as an interface drop
    pub drop_every: Option<u64>,
    /// Wrap point of the interface drop counter
    pub counter_max: u64,
    /// Added to every receive timestamp
    pub wire_delay: Duration,
    /// Bound on waiting for workers to exit
    pub stop_timeout: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            link_state: LinkState::Up,
            allow_exclusive_control: true,
            accuracies: RateAccuracy::ALL.to_vec(),
            fail_attach: false,
            refuse_packet_list: false,
            drop_every: None,
            counter_max: u64::from(u32::MAX),
            wire_delay: Duration::ZERO,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

struct WireFrame {
    data: Bytes,
}

struct SimWire {
    peer: Sender<WireFrame>,
}

impl Wire for SimWire {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.peer
            .send(WireFrame {
                data: Bytes::copy_from_slice(frame),
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
    }
}

/// In-process transport backend
pub struct SimBackend {
    config: SimConfig,
    inbox: Receiver<WireFrame>,
    peer: Sender<WireFrame>,
    sink: Option<Arc<dyn FrameSink>>,
    accuracy: RateAccuracy,
    profile: TimingProfile,
    exclusive: bool,
    emulation: bool,
    packets: PacketList,
    capture: Arc<Capture>,
    drops: Arc<AtomicU64>,
    next_seq: Arc<AtomicU32>,
    transmitter: Option<Worker>,
    receiver: Option<Worker>,
}

impl SimBackend {
    fn with_channels(config: SimConfig, inbox: Receiver<WireFrame>, peer: Sender<WireFrame>) -> Self {
        SimBackend {
            config,
            inbox,
            peer,
            sink: None,
            accuracy: RateAccuracy::High,
            profile: RateAccuracy::High.profile(),
            exclusive: false,
            emulation: false,
            packets: PacketList::default(),
            capture: Arc::new(Capture::default()),
            drops: Arc::new(AtomicU64::new(0)),
            next_seq: Arc::new(AtomicU32::new(0)),
            transmitter: None,
            receiver: None,
        }
    }

    /// Backend that receives what it sends
    pub fn loopback(config: SimConfig) -> Self {
        let (tx, rx) = channel::unbounded();
        SimBackend::with_channels(config, rx, tx)
    }

    /// Two backends wired to each other
    pub fn pair(a: SimConfig, b: SimConfig) -> (Self, Self) {
        let (to_b, b_inbox) = channel::unbounded();
        let (to_a, a_inbox) = channel::unbounded();
        (
            SimBackend::with_channels(a, a_inbox, to_b),
            SimBackend::with_channels(b, b_inbox, to_a),
        )
    }

    fn sink(&self) -> Result<Arc<dyn FrameSink>, BackendError> {
        self.sink.clone().ok_or(BackendError::NotAttached)
    }

    fn stop_receiver(&mut self) {
        if let Some(worker) = self.receiver.take() {
            if let Err(e) = worker.stop(self.config.stop_timeout) {
                tracing::warn!("sim: {}", e);
            }
        }
    }
}

fn receive_loop(
    inbox: Receiver<WireFrame>,
    stop: Receiver<()>,
    sink: Arc<dyn FrameSink>,
    capture: Arc<Capture>,
    drops: Arc<AtomicU64>,
    drop_every: Option<u64>,
    wire_delay: Duration,
) {
    let mut count = 0u64;
    loop {
        let frame = select! {
            recv(stop) -> _ => break,
            recv(inbox) -> msg => match msg {
                Ok(frame) => frame,
                Err(_) => break,
            },
        };

        count += 1;
        if matches!(drop_every, Some(n) if n > 0 && count % n == 0) {
            drops.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let at = SystemTime::now() + wire_delay;
        capture.record(&frame.data, at);
        sink.frame_received(&frame.data, at);
    }
}

impl TransportBackend for SimBackend {
    fn name(&self) -> &str {
        "sim"
    }

    fn attach(&mut self, sink: Arc<dyn FrameSink>) -> Result<(), BackendError> {
        if self.config.fail_attach {
            return Err(BackendError::Refused("simulated attach failure".into()));
        }
        self.stop_receiver();

        let inbox = self.inbox.clone();
        let capture = Arc::clone(&self.capture);
        let drops = Arc::clone(&self.drops);
        let (drop_every, wire_delay) = (self.config.drop_every, self.config.wire_delay);
        let rx_sink = Arc::clone(&sink);
        self.receiver = Some(Worker::spawn("sim-rx", move |stop| {
            receive_loop(inbox, stop, rx_sink, capture, drops, drop_every, wire_delay)
        })?);
        self.sink = Some(sink);

        tracing::info!("sim: attached");
        Ok(())
    }

    fn detach(&mut self) {
        if let Err(e) = self.stop_transmit() {
            tracing::warn!("sim: {}", e);
        }
        self.capture.stop();
        self.emulation = false;
        self.stop_receiver();
        if self.sink.take().is_some() {
            tracing::info!("sim: detached");
        }
    }

    fn has_exclusive_control(&self) -> bool {
        self.exclusive
    }

    fn set_exclusive_control(&mut self, exclusive: bool) -> bool {
        if exclusive && !self.config.allow_exclusive_control {
            return false;
        }
        self.exclusive = exclusive;
        true
    }

    fn link_state(&self) -> LinkState {
        if self.sink.is_some() {
            self.config.link_state
        } else {
            LinkState::Unknown
        }
    }

    fn clear_packet_list(&mut self) -> Result<(), BackendError> {
        if self.config.refuse_packet_list {
            return Err(BackendError::Refused("packet list rejected".into()));
        }
        self.packets.clear();
        Ok(())
    }

    fn loop_next_packet_set(
        &mut self,
        size: usize,
        repeats: u64,
        delay: Duration,
    ) -> Result<(), BackendError> {
        self.packets.begin_set(size, repeats, delay)
    }

    fn append_to_packet_list(
        &mut self,
        delay: Duration,
        frame: Bytes,
    ) -> Result<(), BackendError> {
        self.packets.append(delay, frame)
    }

    fn set_packet_list_loop_mode(&mut self, mode: LoopMode) -> Result<(), BackendError> {
        self.packets.finalize(mode).map(|_| ())
    }

    fn start_transmit(&mut self) -> Result<(), BackendError> {
        let sink = self.sink()?;
        if self.is_transmit_on() {
            return Ok(());
        }
        if let Some(finished) = self.transmitter.take() {
            finished.stop(self.config.stop_timeout)?;
        }

        let schedule = self
            .packets
            .active()
            .ok_or_else(|| BackendError::Refused("no packet list installed".into()))?;
        let job = TransmitJob {
            schedule,
            profile: self.profile,
            wire: SimWire {
                peer: self.peer.clone(),
            },
            sink,
            next_seq: Arc::clone(&self.next_seq),
        };
        self.transmitter = Some(Worker::spawn("sim-tx", move |stop| job.run(stop))?);

        tracing::info!("sim: transmit started ({})", self.accuracy);
        Ok(())
    }

    fn stop_transmit(&mut self) -> Result<(), BackendError> {
        match self.transmitter.take() {
            Some(worker) => worker.stop(self.config.stop_timeout),
            None => Ok(()),
        }
    }

    fn is_transmit_on(&self) -> bool {
        self.transmitter.as_ref().map_or(false, Worker::is_running)
    }

    fn start_capture(&mut self) -> Result<(), BackendError> {
        self.sink()?;
        self.capture.start();
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<(), BackendError> {
        self.capture.stop();
        Ok(())
    }

    fn is_capture_on(&self) -> bool {
        self.capture.is_on()
    }

    fn capture_data(&self) -> Result<Box<dyn Read + Send>, BackendError> {
        Ok(self.capture.reader())
    }

    fn rate_accuracy(&self) -> RateAccuracy {
        self.accuracy
    }

    fn set_rate_accuracy(
        &mut self,
        accuracy: RateAccuracy,
        profile: TimingProfile,
    ) -> Result<(), BackendError> {
        if !self.config.accuracies.contains(&accuracy) {
            return Err(BackendError::Unsupported("rate accuracy tier"));
        }
        self.accuracy = accuracy;
        self.profile = profile;
        Ok(())
    }

    fn start_device_emulation(&mut self) -> Result<(), BackendError> {
        self.sink()?;
        self.emulation = true;
        Ok(())
    }

    fn stop_device_emulation(&mut self) -> Result<(), BackendError> {
        self.emulation = false;
        Ok(())
    }

    fn is_device_emulation_on(&self) -> bool {
        self.emulation
    }

    fn send_emulation_packet(&mut self, frame: Bytes) -> Result<(), BackendError> {
        if !self.emulation {
            return Err(BackendError::Refused("device emulation is not running".into()));
        }
        SimWire {
            peer: self.peer.clone(),
        }
        .send(&frame)?;
        Ok(())
    }

    fn link_counters(&self) -> Option<LinkCounters> {
        let raw = self.drops.load(Ordering::Relaxed);
        let wrapped = match self.config.counter_max.checked_add(1) {
            Some(modulus) => raw % modulus,
            None => raw,
        };
        Some(LinkCounters {
            rx_drops: wrapped,
            ..Default::default()
        })
    }

    fn max_counter_value(&self) -> u64 {
        self.config.counter_max
    }
}

impl Drop for SimBackend {
    fn drop(&mut self) {
        self.detach();
    }
}
