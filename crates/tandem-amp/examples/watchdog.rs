//! Liveness supervision demo: watch the application core's heartbeat,
//! then silence it and observe the escalation.

use std::sync::Arc;
use std::time::Duration;

use tandem_amp::{EnvelopeTable, LoopbackTransport, Node, NodeConfig, Result, SupervisorConfig};
use tandem_chip::cpu::CoreId;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("tandem_amp=info")
        .init();

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
        println!("!! {core} went silent — this is where the chip would hard-reset");
    }));
    sup.reset_notify(CoreId::CPU1, true);

    println!("application core beating every 100 ms; watching for 2 s ...");
    std::thread::sleep(Duration::from_secs(2));
    println!("supervisor sees cpu1 powered on: {}", sup.is_powered_on(CoreId::CPU1));

    println!("stopping the beacon (core hang simulation) ...");
    cpu1.stop_beacon();
    std::thread::sleep(Duration::from_secs(2));

    cpu1.deinit()?;
    cpu0.deinit()?;
    Ok(())
}
