//! Synchronous cross-core round-trip latency.
//!
//! One envelope per call: command word out, handler on the peer
//! dispatcher, ACK back. The loopback link adds two thread hand-offs per
//! direction, so absolute numbers measure the host scheduler as much as
//! the stack; the interesting outputs are the distribution shape and
//! the per-payload-size deltas.
//!
//! Usage:
//!   cargo run --bin bench_roundtrip
//!   cargo run --bin bench_roundtrip -- --iterations 5000

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use bytes::BytesMut;
use tandem_amp::{ChannelConfig, EnvelopeTable, LoopbackTransport, Node, NodeConfig};
use tandem_chip::cpu::CoreId;
use tracing_subscriber::EnvFilter;

const DEFAULT_ITERATIONS: usize = 2000;
const PAYLOAD_SIZES: [usize; 4] = [1, 16, 64, 256];

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let iterations = parse_arg(&args, "--iterations", DEFAULT_ITERATIONS);

    println!("Sync round-trip latency");
    println!("=======================");
    println!("Iterations     : {iterations} per payload size");
    println!();

    let (t0, t1) = LoopbackTransport::pair();
    let shared_ram = EnvelopeTable::new();
    let cpu0 = Node::init(
        NodeConfig::system_core(0xBE9C).channel(
            ChannelConfig::new("echo").on_receive(|payload, _req| {
                // Touch the payload so the echo is not free.
                if let Some(first) = payload.first_mut() {
                    *first = first.wrapping_add(1);
                }
                0
            }),
        ),
        t0,
        Arc::clone(&shared_ram),
    )?;
    let cpu1 = Node::init(
        NodeConfig::new(CoreId::CPU1).channel(ChannelConfig::new("echo")),
        t1,
        shared_ram,
    )?;
    let chan = cpu1.channel("echo")?;

    for size in PAYLOAD_SIZES {
        // Warmup
        for _ in 0..50 {
            chan.send_sync(BytesMut::from(&vec![0u8; size][..]))?;
        }

        let mut latencies_us = Vec::with_capacity(iterations);
        for _ in 0..iterations {
            let payload = BytesMut::from(&vec![0u8; size][..]);
            let start = Instant::now();
            let reply = chan.send_sync(payload)?;
            latencies_us.push(start.elapsed().as_micros() as u64);
            anyhow::ensure!(reply.payload[0] == 1, "echo mismatch");
        }

        latencies_us.sort_unstable();
        let p = |q: f64| latencies_us[((latencies_us.len() - 1) as f64 * q) as usize];
        let mean: u64 = latencies_us.iter().sum::<u64>() / latencies_us.len() as u64;
        println!(
            "{size:>4} B   mean {mean:>5} µs   p50 {:>5} µs   p99 {:>5} µs   max {:>5} µs",
            p(0.50),
            p(0.99),
            latencies_us[latencies_us.len() - 1],
        );
    }

    cpu1.deinit()?;
    cpu0.deinit()?;
    Ok(())
}

fn parse_arg(args: &[String], name: &str, default: usize) -> usize {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
