//! NetTest port driver
//!
//! Runs one port from a TOML file: installs the configured streams, transmits
//! for a while and prints the port statistics.

use clap::Parser;
use nettest::{Port, SimBackend, TransportBackend, UdpBackend};
use nettest_cli::config::Config;
use nettest_cli::stats::{display_compact_stats, display_port_stats};
use nettest_io::Ticker;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "nettest-port")]
#[command(about = "Traffic generator and analyzer for a single port", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, required_unless_present = "example")]
    config: Option<PathBuf>,

    /// Run time in seconds (0 runs until the schedule finishes)
    #[arg(short, long, default_value = "10")]
    duration: u64,

    /// Print an example configuration and exit
    #[arg(long)]
    example: bool,

    /// Print a snapshot of the port at the end
    #[arg(long)]
    snapshot: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.example {
        print!("{}", toml::to_string_pretty(&Config::example())?);
        return Ok(());
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = args
        .config
        .ok_or_else(|| anyhow::anyhow!("--config is required"))?;
    let config = Config::from_file(&path)
        .map_err(|e| anyhow::anyhow!("Failed to load '{}': {}", path.display(), e))?;

    tracing::info!("NetTest port starting...");
    tracing::info!("Port: {} ({} streams)", config.port.name, config.streams.len());

    let backend: Box<dyn TransportBackend> = if let Some(sim) = config.backend.sim_config() {
        Box::new(SimBackend::loopback(sim))
    } else if let Some(udp) = config.backend.udp_config() {
        let backend = UdpBackend::bind(udp)?;
        tracing::info!("Bound to: {}", backend.local_addr()?);
        Box::new(backend)
    } else {
        anyhow::bail!("No usable backend configured");
    };

    let mut port = Port::new(config.port.id, config.port_config(), backend);
    port.init()?;

    if let Err(e) = port.set_rate_accuracy(config.port.accuracy) {
        tracing::warn!(
            "Rate accuracy {} not available ({}), keeping {}",
            config.port.accuracy,
            e,
            port.rate_accuracy()
        );
    }

    for stream in config.build_streams()? {
        port.add_stream(stream)?;
    }

    port.reset_stats();
    port.start_transmit()?;

    let started = Instant::now();
    let run_for = Duration::from_secs(args.duration);
    let mut ticker = Ticker::new(config.stats_interval());

    loop {
        thread::sleep(ticker.remaining().min(Duration::from_millis(50)));

        if ticker.try_tick() {
            port.poll_stats();
            display_compact_stats(&port.stats(), started.elapsed());
        }

        let finished = if args.duration == 0 {
            !port.is_transmit_on()
        } else {
            started.elapsed() >= run_for
        };
        if finished {
            break;
        }
    }

    port.stop_transmit()?;
    // Let in-flight frames land before the final reading
    thread::sleep(Duration::from_millis(100));
    port.poll_stats();

    println!();
    display_port_stats(port.name(), &port.stats());

    for note in port.notes() {
        println!("  [{}] {}", note.severity, note.message);
    }

    if args.snapshot {
        println!("{:#?}", port.snapshot());
    }

    tracing::info!("NetTest port finished after {:?}", started.elapsed());
    Ok(())
}
