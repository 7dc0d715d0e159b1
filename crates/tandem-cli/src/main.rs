//! `tandem` — two-core simulation scenarios for the TM7 coordination stack.
//!
//! ```text
//! USAGE:
//!   tandem ping [--count N] [--r sync|async]   Cross-core ping round trips
//!   tandem reslock [--cycles N]                Resource-lock contention
//!   tandem watchdog [--hang]                   Heartbeat supervision demo
//!   tandem info                                Query the peer device id
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::BytesMut;
use clap::{Parser, Subcommand, ValueEnum};
use tandem_amp::{
    ChannelConfig, EnvelopeTable, LoopbackTransport, Node, NodeConfig, SupervisorConfig,
};
use tandem_chip::cpu::CoreId;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tandem", about = "Tandem TM7 cross-core coordination CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Clone, Copy, ValueEnum)]
enum SendKind {
    Sync,
    Async,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run N cross-core ping round trips and report latency.
    Ping {
        /// Number of pings.
        #[arg(long, default_value_t = 100)]
        count: u32,
        /// Send discipline.
        #[arg(long = "r", value_enum, default_value = "sync")]
        kind: SendKind,
    },
    /// Contend for a shared resource from both cores.
    Reslock {
        /// Acquire/release cycles per core.
        #[arg(long, default_value_t = 50)]
        cycles: u32,
    },
    /// Run the heartbeat supervisor against a beating (or hung) peer.
    Watchdog {
        /// Simulate a hang: stop the beacon halfway through.
        #[arg(long)]
        hang: bool,
    },
    /// Query the peer core's device identification.
    Info,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Ping { count, kind } => cmd_ping(count, kind)?,
        Cmd::Reslock { cycles } => cmd_reslock(cycles)?,
        Cmd::Watchdog { hang } => cmd_watchdog(hang)?,
        Cmd::Info => cmd_info()?,
    }

    Ok(())
}

/// Bring up both cores with a "ping" channel served by the system core.
fn bring_up(extra_sys: Vec<ChannelConfig>) -> Result<(Node, Node)> {
    let (t0, t1) = LoopbackTransport::pair();
    let shared_ram = EnvelopeTable::new();

    let mut cfg = NodeConfig::system_core(0x00C0_FFEE);
    for chan in extra_sys {
        cfg = cfg.channel(chan);
    }
    let cpu0 = Node::init(cfg, t0, shared_ram.clone())?;
    let cpu1 = Node::init(
        NodeConfig::new(CoreId::CPU1).channel(ChannelConfig::new("ping")),
        t1,
        shared_ram,
    )?;
    Ok((cpu0, cpu1))
}

fn cmd_ping(count: u32, kind: SendKind) -> Result<()> {
    let served = Arc::new(AtomicU32::new(0));
    let served2 = Arc::clone(&served);

    let ping = ChannelConfig::new("ping").on_receive(move |payload, _req| {
        served2.fetch_add(1, Ordering::SeqCst);
        payload[0] = payload[0].wrapping_add(1);
        0
    });
    let (cpu0, cpu1) = bring_up(vec![ping])?;
    let chan = cpu1.channel("ping")?;

    println!("pinging {count}× ({})", match kind {
        SendKind::Sync => "sync",
        SendKind::Async => "async",
    });

    let start = Instant::now();
    match kind {
        SendKind::Sync => {
            for i in 0..count {
                let reply = chan.send_sync(BytesMut::from(&[(i % 255) as u8][..]))?;
                anyhow::ensure!(
                    reply.payload[0] == ((i % 255) as u8).wrapping_add(1),
                    "bad echo at iteration {i}"
                );
            }
        }
        SendKind::Async => {
            for i in 0..count {
                chan.send_async(BytesMut::from(&[(i % 255) as u8][..]))?;
            }
            // Fire-and-forget: wait for the server to observe them all.
            while served.load(Ordering::SeqCst) < count {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
    let elapsed = start.elapsed();

    println!(
        "{count} round trips in {:.2?}  ({:.1} µs each)",
        elapsed,
        elapsed.as_micros() as f64 / f64::from(count)
    );
    println!("server handled {} requests", served.load(Ordering::SeqCst));

    cpu1.deinit()?;
    cpu0.deinit()?;
    Ok(())
}

fn cmd_reslock(cycles: u32) -> Result<()> {
    let (cpu0, cpu1) = bring_up(Vec::new())?;
    let cpu0 = Arc::new(cpu0);
    let cpu1 = Arc::new(cpu1);

    println!("contending for DMA0: {cycles} cycles per core");
    let start = Instant::now();

    let mut workers = Vec::new();
    for node in [Arc::clone(&cpu0), Arc::clone(&cpu1)] {
        workers.push(std::thread::spawn(move || -> Result<()> {
            for _ in 0..cycles {
                node.resource_lock()
                    .acquire(tandem_chip::resource::DMA0, Duration::from_secs(30))?;
                std::thread::sleep(Duration::from_micros(200));
                node.resource_lock().release(tandem_chip::resource::DMA0)?;
            }
            Ok(())
        }));
    }
    for w in workers {
        w.join().expect("worker panicked")?;
    }

    println!("done in {:.2?}, no overlap, no starvation", start.elapsed());
    Ok(())
}

fn cmd_watchdog(hang: bool) -> Result<()> {
    let (t0, t1) = LoopbackTransport::pair();
    let shared_ram = EnvelopeTable::new();

    let mut cfg = NodeConfig::system_core(0x00C0_FFEE);
    cfg.supervisor = Some(SupervisorConfig {
        deadline: Duration::from_millis(500),
        ..SupervisorConfig::default()
    });
    let cpu0 = Node::init(cfg, t0, shared_ram.clone())?;
    let mut cpu1 = Node::init(
        NodeConfig::application_core(Duration::from_millis(100)),
        t1,
        shared_ram,
    )?;

    let sup = cpu0.supervisor().expect("system core supervises").clone();
    sup.set_escalation_hook(Arc::new(|core| {
        println!("!! liveness timeout on {core} — hardware would reset here");
    }));
    sup.reset_notify(CoreId::CPU1, true);

    std::thread::sleep(Duration::from_secs(1));
    println!("cpu1 powered on: {}", sup.is_powered_on(CoreId::CPU1));

    if hang {
        println!("hanging the application core ...");
        cpu1.stop_beacon();
        std::thread::sleep(Duration::from_secs(2));
    } else {
        println!("letting it beat for 2 s ...");
        std::thread::sleep(Duration::from_secs(2));
        println!("still powered on: {}", sup.is_powered_on(CoreId::CPU1));
    }

    cpu1.deinit()?;
    cpu0.deinit()?;
    Ok(())
}

fn cmd_info() -> Result<()> {
    let (cpu0, cpu1) = bring_up(Vec::new())?;
    let id = cpu1.query_peer_device_id()?;

    println!("Peer device");
    println!("  chip id   : {:#010x}", id.chip_id);
    println!("  revision  : {:#06x}", id.revision);
    println!("  unique id : {:#018x}", id.unique_id);

    cpu1.deinit()?;
    cpu0.deinit()?;
    Ok(())
}
