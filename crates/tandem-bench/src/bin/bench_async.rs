//! Asynchronous send throughput.
//!
//! Fire-and-forget sends queue on the local dispatcher; the interesting
//! number is sustained words/second through the single transmit gate,
//! and how far completion (ACK processed, envelope freed) lags behind
//! queueing.
//!
//! Usage:
//!   cargo run --bin bench_async
//!   cargo run --bin bench_async -- --messages 20000

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::BytesMut;
use tandem_amp::{ChannelConfig, EnvelopeTable, LoopbackTransport, Node, NodeConfig};
use tandem_chip::cpu::CoreId;
use tracing_subscriber::EnvFilter;

const DEFAULT_MESSAGES: u64 = 10_000;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let messages = parse_arg(&args, "--messages", DEFAULT_MESSAGES);

    println!("Async send throughput");
    println!("=====================");
    println!("Messages       : {messages}");
    println!();

    let handled = Arc::new(AtomicU64::new(0));
    let completed = Arc::new(AtomicU64::new(0));

    let (t0, t1) = LoopbackTransport::pair();
    let shared_ram = EnvelopeTable::new();
    let handled2 = Arc::clone(&handled);
    let cpu0 = Node::init(
        NodeConfig::system_core(0xBE9C).channel(
            ChannelConfig::new("sink").on_receive(move |_payload, _req| {
                handled2.fetch_add(1, Ordering::Relaxed);
                0
            }),
        ),
        t0,
        Arc::clone(&shared_ram),
    )?;
    let completed2 = Arc::clone(&completed);
    let cpu1 = Node::init(
        NodeConfig::new(CoreId::CPU1).channel(
            ChannelConfig::new("sink").on_send_done(move |_payload, _result| {
                completed2.fetch_add(1, Ordering::Relaxed);
            }),
        ),
        t1,
        Arc::clone(&shared_ram),
    )?;
    let chan = cpu1.channel("sink")?;

    let start = Instant::now();
    for i in 0..messages {
        chan.send_async(BytesMut::from(&(i as u32).to_le_bytes()[..]))?;
    }
    let queued = start.elapsed();

    while completed.load(Ordering::Relaxed) < messages {
        std::thread::sleep(Duration::from_millis(1));
    }
    let drained = start.elapsed();

    let rate = |n: u64, d: Duration| n as f64 / d.as_secs_f64();
    println!("queueing   : {queued:.2?}  ({:.0} msg/s)", rate(messages, queued));
    println!("completion : {drained:.2?}  ({:.0} msg/s)", rate(messages, drained));
    println!("handled {} / completed {}", handled.load(Ordering::Relaxed), completed.load(Ordering::Relaxed));
    println!("live envelopes after drain: {}", shared_ram.live());

    cpu1.deinit()?;
    cpu0.deinit()?;
    Ok(())
}

fn parse_arg(args: &[String], name: &str, default: u64) -> u64 {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
