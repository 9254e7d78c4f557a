//! UDP-socket backend
//!
//! Each frame travels as one datagram to a fixed peer, and every datagram
//! received on the bound socket is handed to the port as a frame. Useful for
//! running two ports on different hosts without raw socket privileges.

use crate::backend::{BackendError, FrameSink, LinkState, TransportBackend, DEFAULT_STOP_TIMEOUT};
use crate::pcap::Capture;
use crate::transmit::{PacketList, TransmitJob, Wire, Worker};
use bytes::Bytes;
use crossbeam::channel::{Receiver, TryRecvError};
use nettest_core::{LoopMode, RateAccuracy, RxErrorKind, TimingProfile, MAX_FRAME_SIZE};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind, Read};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// How long a receive call blocks before checking for stop
const RECV_POLL: Duration = Duration::from_millis(50);

/// UDP backend settings
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Local address to bind
    pub bind: SocketAddr,
    /// Where transmitted frames go
    pub peer: Option<SocketAddr>,
    pub send_buffer: Option<usize>,
    pub recv_buffer: Option<usize>,
    /// Bound on waiting for workers to exit
    pub stop_timeout: Duration,
}

impl UdpConfig {
    /// Bind `bind`, sending to `peer`
    pub fn new(bind: SocketAddr, peer: Option<SocketAddr>) -> Self {
        UdpConfig {
            bind,
            peer,
            send_buffer: None,
            recv_buffer: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// Open and configure the datagram socket
fn open_socket(config: &UdpConfig) -> io::Result<UdpSocket> {
    let domain = if config.bind.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;
    if let Some(size) = config.send_buffer {
        socket.set_send_buffer_size(size)?;
    }
    if let Some(size) = config.recv_buffer {
        socket.set_recv_buffer_size(size)?;
    }
    socket.bind(&config.bind.into())?;
    socket.set_read_timeout(Some(RECV_POLL))?;

    Ok(socket.into())
}

struct UdpWire {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl Wire for UdpWire {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.socket.send_to(frame, self.peer).map(|_| ())
    }
}

fn receive_loop(socket: UdpSocket, stop: Receiver<()>, sink: Arc<dyn FrameSink>, capture: Arc<Capture>) {
    // One spare byte tells a full-size frame from a truncated datagram
    let mut buf = vec![0u8; MAX_FRAME_SIZE + 1];
    loop {
        if !matches!(stop.try_recv(), Err(TryRecvError::Empty)) {
            break;
        }

        match socket.recv_from(&mut buf) {
            Ok((n, from)) if n > MAX_FRAME_SIZE => {
                tracing::debug!("udp: oversize datagram from {} dropped", from);
                sink.rx_error(RxErrorKind::Frame);
            }
            Ok((n, _from)) => {
                let at = SystemTime::now();
                capture.record(&buf[..n], at);
                sink.frame_received(&buf[..n], at);
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                // ICMP port unreachable from an earlier send
            }
            Err(e) => {
                tracing::warn!("udp: receive error: {}", e);
                sink.rx_error(RxErrorKind::Error);
            }
        }
    }
}

/// Transport backend carrying frames as UDP datagrams
pub struct UdpBackend {
    config: UdpConfig,
    socket: UdpSocket,
    sink: Option<Arc<dyn FrameSink>>,
    accuracy: RateAccuracy,
    profile: TimingProfile,
    packets: PacketList,
    capture: Arc<Capture>,
    next_seq: Arc<AtomicU32>,
    transmitter: Option<Worker>,
    receiver: Option<Worker>,
}

impl UdpBackend {
    /// Bind the socket; traffic starts flowing on attach
    pub fn bind(config: UdpConfig) -> Result<Self, BackendError> {
        let socket = open_socket(&config)?;
        tracing::debug!("udp: bound {}", socket.local_addr()?);

        Ok(UdpBackend {
            config,
            socket,
            sink: None,
            accuracy: RateAccuracy::Medium,
            profile: RateAccuracy::Medium.profile(),
            packets: PacketList::default(),
            capture: Arc::new(Capture::default()),
            next_seq: Arc::new(AtomicU32::new(0)),
            transmitter: None,
            receiver: None,
        })
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, BackendError> {
        Ok(self.socket.local_addr()?)
    }

    /// Change where transmitted frames go
    pub fn set_peer(&mut self, peer: SocketAddr) {
        self.config.peer = Some(peer);
    }

    fn sink(&self) -> Result<Arc<dyn FrameSink>, BackendError> {
        self.sink.clone().ok_or(BackendError::NotAttached)
    }

    fn stop_receiver(&mut self) {
        if let Some(worker) = self.receiver.take() {
            if let Err(e) = worker.stop(self.config.stop_timeout) {
                tracing::warn!("udp: {}", e);
            }
        }
    }
}

impl TransportBackend for UdpBackend {
    fn name(&self) -> &str {
        "udp"
    }

    fn attach(&mut self, sink: Arc<dyn FrameSink>) -> Result<(), BackendError> {
        self.stop_receiver();

        let socket = self.socket.try_clone()?;
        let capture = Arc::clone(&self.capture);
        let rx_sink = Arc::clone(&sink);
        self.receiver = Some(Worker::spawn("udp-rx", move |stop| {
            receive_loop(socket, stop, rx_sink, capture)
        })?);
        self.sink = Some(sink);

        tracing::info!("udp: attached on {}", self.socket.local_addr()?);
        Ok(())
    }

    fn detach(&mut self) {
        if let Err(e) = self.stop_transmit() {
            tracing::warn!("udp: {}", e);
        }
        self.capture.stop();
        self.stop_receiver();
        if self.sink.take().is_some() {
            tracing::info!("udp: detached");
        }
    }

    fn has_exclusive_control(&self) -> bool {
        false
    }

    fn set_exclusive_control(&mut self, exclusive: bool) -> bool {
        // A shared socket can never be exclusive
        !exclusive
    }

    fn link_state(&self) -> LinkState {
        if self.sink.is_some() {
            LinkState::Up
        } else {
            LinkState::Unknown
        }
    }

    fn clear_packet_list(&mut self) -> Result<(), BackendError> {
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

        let peer = self
            .config
            .peer
            .ok_or_else(|| BackendError::Refused("no peer address configured".into()))?;
        let schedule = self
            .packets
            .active()
            .ok_or_else(|| BackendError::Refused("no packet list installed".into()))?;
        let job = TransmitJob {
            schedule,
            profile: self.profile,
            wire: UdpWire {
                socket: self.socket.try_clone()?,
                peer,
            },
            sink,
            next_seq: Arc::clone(&self.next_seq),
        };
        self.transmitter = Some(Worker::spawn("udp-tx", move |stop| job.run(stop))?);

        tracing::info!("udp: transmit to {} started ({})", peer, self.accuracy);
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
        // Per-packet wakeups are not achievable through the socket layer
        if accuracy == RateAccuracy::High {
            return Err(BackendError::Unsupported("high rate accuracy"));
        }
        self.accuracy = accuracy;
        self.profile = profile;
        Ok(())
    }
}

impl Drop for UdpBackend {
    fn drop(&mut self) {
        self.detach();
    }
}
