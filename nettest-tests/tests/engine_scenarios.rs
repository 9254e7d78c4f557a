//! End-to-end port scenarios
//!
//! Two ports wired back to back through the simulated backend (and once
//! through real UDP sockets): one transmits tagged test traffic, the other
//! measures it.

use bytes::Bytes;
use nettest::core::{TestTag, WindowConfig};
use nettest::{
    BurstStream, LoopMode, Port, PortConfig, PortConfigDelta, RateAccuracy, SimBackend, SimConfig,
    Stream, StreamId, StreamMode, TransmitMode, UdpBackend, UdpConfig,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn tagged_frame(fill: u8) -> Bytes {
    let mut frame = vec![fill; 64];
    frame.extend_from_slice(&TestTag::placeholder());
    Bytes::from(frame)
}

fn stream(id: u32, frames: usize, repeats: u64) -> Arc<dyn Stream> {
    Arc::new(
        BurstStream::new(StreamId(id), vec![tagged_frame(id as u8); frames])
            .with_gap(Duration::from_micros(10))
            .with_repeats(repeats, Duration::from_micros(20)),
    )
}

fn port_pair(tx: SimConfig, rx: SimConfig, rx_config: PortConfig) -> (Port, Port) {
    let (a, b) = SimBackend::pair(tx, rx);
    let mut sender = Port::new(1, PortConfig::default(), Box::new(a));
    let mut receiver = Port::new(2, rx_config, Box::new(b));
    sender.init().unwrap();
    receiver.init().unwrap();
    (sender, receiver)
}

fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn test_pair_measurement() {
    let (mut sender, receiver) =
        port_pair(SimConfig::default(), SimConfig::default(), PortConfig::default());

    sender.add_stream(stream(1, 4, 50)).unwrap();
    sender.start_transmit().unwrap();

    assert!(wait_for(|| receiver.stats().nt_pkts == 200));
    assert!(wait_for(|| sender.stats().tx_pkts == 200));

    let rx = receiver.stats();
    assert_eq!(rx.rx_pkts, 200);
    assert_eq!(rx.nt_bytes, 200 * (64 + TestTag::placeholder().len() as u64));
    assert_eq!(rx.nt_loss_count, 0);
    assert_eq!(rx.nt_duplicates, 0);
    assert_eq!(rx.nt_clock_anomalies, 0);
    assert!(rx.nt_min_delay_us <= rx.nt_avg_delay_us);
    assert!(rx.nt_avg_delay_us <= rx.nt_max_delay_us);

    // The receiver never transmitted
    assert_eq!(rx.tx_pkts, 0);
    assert_eq!(sender.stats().nt_pkts, 0);
}

#[test]
fn test_interface_drops_become_loss() {
    let rx_config = PortConfig {
        window: WindowConfig {
            loss_window: 16,
            ..Default::default()
        },
        ..Default::default()
    };
    let rx_sim = SimConfig {
        drop_every: Some(10),
        ..Default::default()
    };
    let (mut sender, receiver) = port_pair(SimConfig::default(), rx_sim, rx_config);

    sender.add_stream(stream(1, 1, 100)).unwrap();
    sender.start_transmit().unwrap();

    assert!(wait_for(|| receiver.stats().nt_pkts == 90));
    receiver.poll_stats();

    let rx = receiver.stats();
    assert_eq!(rx.rx_drops, 10);
    // Sequence numbers 9, 19, .. 99 were dropped; only those 16 or more
    // behind the highest received (98) have left the window.
    assert_eq!(rx.nt_loss_count, 8);
    assert!(rx.nt_loss_percent > 0.0);
}

#[test]
fn test_wire_delay_is_measured() {
    let rx_sim = SimConfig {
        wire_delay: Duration::from_millis(5),
        ..Default::default()
    };
    let (mut sender, receiver) = port_pair(SimConfig::default(), rx_sim, PortConfig::default());

    sender.add_stream(stream(1, 1, 10)).unwrap();
    sender.start_transmit().unwrap();

    assert!(wait_for(|| receiver.stats().nt_pkts == 10));
    assert!(receiver.stats().nt_min_delay_us >= 5_000);
}

#[test]
fn test_interleaved_streams_all_arrive() {
    let (mut sender, receiver) =
        port_pair(SimConfig::default(), SimConfig::default(), PortConfig::default());

    sender
        .modify(PortConfigDelta {
            transmit_mode: Some(TransmitMode::Interleaved),
            ..Default::default()
        })
        .unwrap();
    sender.add_stream(stream(1, 2, 10)).unwrap();
    sender.add_stream(stream(2, 1, 30)).unwrap();
    let standalone: Arc<dyn Stream> = Arc::new(
        BurstStream::new(StreamId(3), vec![tagged_frame(3)])
            .with_repeats(5, Duration::ZERO)
            .with_mode(StreamMode::Standalone),
    );
    sender.add_stream(standalone).unwrap();

    sender.start_transmit().unwrap();
    assert_eq!(sender.schedule().packet_count(), 55);
    assert_eq!(sender.schedule().sets().len(), 2);

    assert!(wait_for(|| receiver.stats().nt_pkts == 55));
    assert_eq!(receiver.stats().nt_loss_count, 0);
}

#[test]
fn test_reset_between_runs() {
    let (mut sender, receiver) =
        port_pair(SimConfig::default(), SimConfig::default(), PortConfig::default());

    sender.add_stream(stream(1, 1, 20)).unwrap();
    sender.start_transmit().unwrap();
    assert!(wait_for(|| receiver.stats().nt_pkts == 20));

    receiver.reset_stats();
    let cleared = receiver.stats();
    assert_eq!(cleared.nt_pkts, 0);
    assert_eq!(cleared.rx_pkts, 0);
    assert_eq!(cleared.nt_max_delay_us, 0);

    // Sequence numbers continue across sessions; the fresh window starts
    // from whatever arrives first.
    assert!(wait_for(|| !sender.is_transmit_on()));
    sender.start_transmit().unwrap();
    assert!(wait_for(|| receiver.stats().nt_pkts == 20));
    assert_eq!(receiver.stats().nt_loss_count, 0);
    assert_eq!(sender.rebuild_count(), 1);
}

#[test]
fn test_forever_loop_until_stopped() {
    let (mut sender, receiver) =
        port_pair(SimConfig::default(), SimConfig::default(), PortConfig::default());

    sender
        .modify(PortConfigDelta {
            loop_mode: Some(LoopMode::Forever {
                delay: Duration::from_micros(100),
            }),
            ..Default::default()
        })
        .unwrap();
    sender.add_stream(stream(1, 2, 1)).unwrap();
    sender.start_transmit().unwrap();

    assert!(wait_for(|| receiver.stats().nt_pkts >= 20));
    assert!(sender.is_transmit_on());

    sender.stop_transmit().unwrap();
    assert!(!sender.is_transmit_on());

    thread::sleep(Duration::from_millis(20));
    let settled = receiver.stats().nt_pkts;
    thread::sleep(Duration::from_millis(20));
    assert_eq!(receiver.stats().nt_pkts, settled);
    assert_eq!(receiver.stats().nt_loss_count, 0);
}

#[test]
fn test_stop_without_start_on_pair() {
    let (mut sender, mut receiver) =
        port_pair(SimConfig::default(), SimConfig::default(), PortConfig::default());

    sender.stop_transmit().unwrap();
    receiver.stop_transmit().unwrap();
    receiver.stop_capture().unwrap();
    assert!(!sender.is_transmit_on());
    assert_eq!(receiver.stats().rx_pkts, 0);
}

#[test]
fn test_udp_loopback_measurement() {
    let mut a = UdpBackend::bind(UdpConfig::new("127.0.0.1:0".parse().unwrap(), None)).unwrap();
    let b = UdpBackend::bind(UdpConfig::new("127.0.0.1:0".parse().unwrap(), None)).unwrap();
    a.set_peer(b.local_addr().unwrap());

    let mut sender = Port::new(1, PortConfig::default(), Box::new(a));
    let mut receiver = Port::new(2, PortConfig::default(), Box::new(b));
    sender.init().unwrap();
    receiver.init().unwrap();

    assert!(sender.set_rate_accuracy(RateAccuracy::High).is_err());
    sender.set_rate_accuracy(RateAccuracy::Low).unwrap();
    assert_eq!(sender.rate_accuracy(), RateAccuracy::Low);

    let slow: Arc<dyn Stream> = Arc::new(
        BurstStream::new(StreamId(1), vec![tagged_frame(1)])
            .with_repeats(20, Duration::from_micros(200)),
    );
    sender.add_stream(slow).unwrap();
    sender.start_transmit().unwrap();

    assert!(wait_for(|| receiver.stats().nt_pkts == 20));
    assert_eq!(receiver.stats().nt_loss_count, 0);
}
