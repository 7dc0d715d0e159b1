//! Two-node ping over the loopback mailbox.
//!
//! Demonstrates bringing up both cores in one process and making a
//! synchronous cross-core call.

use bytes::BytesMut;
use tandem_amp::{ChannelConfig, EnvelopeTable, LoopbackTransport, Node, NodeConfig, Result};
use tandem_chip::cpu::CoreId;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("tandem_amp=info")
        .init();

    let (t0, t1) = LoopbackTransport::pair();
    let shared_ram = EnvelopeTable::new();

    // System core: serves "ping" by incrementing the first byte.
    let cpu0 = Node::init(
        NodeConfig::system_core(0x00C0_FFEE).channel(
            ChannelConfig::new("ping").on_receive(|payload, _req| {
                payload[0] = payload[0].wrapping_add(1);
                0
            }),
        ),
        t0,
        shared_ram.clone(),
    )?;

    // Application core: pure client.
    let cpu1 = Node::init(
        NodeConfig::new(CoreId::CPU1).channel(ChannelConfig::new("ping")),
        t1,
        shared_ram,
    )?;

    let reply = cpu1.channel("ping")?.send_sync(BytesMut::from(&[41u8][..]))?;
    println!("ping(41) -> {}", reply.payload[0]);

    let id = cpu1.query_peer_device_id()?;
    println!(
        "peer chip {:#010x} rev {:#06x} unique {:#018x}",
        id.chip_id, id.revision, id.unique_id
    );

    cpu1.deinit()?;
    cpu0.deinit()?;
    Ok(())
}
