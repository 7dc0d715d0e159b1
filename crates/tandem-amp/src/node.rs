//! Per-core context object.
//!
//! A [`Node`] is everything one core runs for cross-core coordination:
//! its IPC core (dispatcher, channel registry), resource-lock instance,
//! and either a liveness supervisor (the watching core) or a heartbeat
//! beacon (the watched core). There are no process-wide globals —
//! "one instance per process" is expressed by owning exactly one `Node`
//! per simulated core, created by [`Node::init`] and consumed by
//! [`Node::deinit`].
//!
//! Built-in channel registrations:
//!
//! | Channel | Purpose |
//! |---------|---------|
//! | `"amp_res"` | resource-lock count/grant protocol |
//! | `"heartbeat"` | beacon pings feeding the supervisor |
//! | `"sysinfo"` | device-id service (server on the system core) |
//!
//! User channels from [`NodeConfig::channels`] are registered after the
//! built-ins, in the order given.

use std::sync::Arc;
use std::time::Duration;

use tandem_chip::cpu::CoreId;
use tandem_chip::resource::RESOURCE_COUNT;
use tracing::{debug, info};

use crate::channel::{ChannelConfig, IpcChannel};
use crate::envelope::EnvelopeTable;
use crate::error::Result;
use crate::heartbeat::{Beacon, Supervisor, SupervisorConfig, HEARTBEAT_CHANNEL};
use crate::ipc::{IpcBuilder, IpcCore};
use crate::reslock::{ResourceLock, RES_LOCK_CHANNEL};
use crate::rpc::{device_id_server, query_device_id, DeviceId, RpcClient, DEVICE_ID_CHANNEL};
use crate::sync::spinlock::CoreToken;
use crate::transport::{MailboxTransport, TransportStatus};

/// Configuration for one core's node.
#[derive(Debug)]
pub struct NodeConfig {
    /// Which core this node is.
    pub core: CoreId,
    /// Number of arbitrated shared resources.
    pub resources: u16,
    /// True on the core hosting the authoritative resource-lock count
    /// table (the system core).
    pub resource_server: bool,
    /// Run a liveness supervisor for the companion core.
    pub supervisor: Option<SupervisorConfig>,
    /// Send heartbeat pings at this period (the supervised side).
    pub beacon_period: Option<Duration>,
    /// Serve the device-id channel with this die-unique id. `None`
    /// registers the pure-client side.
    pub device_id: Option<u64>,
    /// Application channel registrations.
    pub channels: Vec<ChannelConfig>,
}

impl NodeConfig {
    /// Defaults for `core`: resource client, no supervisor, no beacon.
    #[must_use]
    pub fn new(core: CoreId) -> Self {
        Self {
            core,
            resources: RESOURCE_COUNT,
            resource_server: false,
            supervisor: None,
            beacon_period: None,
            device_id: None,
            channels: Vec::new(),
        }
    }

    /// Typical system-core role: resource server, device-id service,
    /// supervising the application core.
    #[must_use]
    pub fn system_core(unique_id: u64) -> Self {
        Self {
            core: CoreId::CPU0,
            resources: RESOURCE_COUNT,
            resource_server: true,
            supervisor: Some(SupervisorConfig::default()),
            beacon_period: None,
            device_id: Some(unique_id),
            channels: Vec::new(),
        }
    }

    /// Typical application-core role: resource client with a beacon.
    #[must_use]
    pub fn application_core(beacon_period: Duration) -> Self {
        Self {
            core: CoreId::CPU1,
            resources: RESOURCE_COUNT,
            resource_server: false,
            supervisor: None,
            beacon_period: Some(beacon_period),
            device_id: None,
            channels: Vec::new(),
        }
    }

    /// Add an application channel.
    #[must_use]
    pub fn channel(mut self, cfg: ChannelConfig) -> Self {
        self.channels.push(cfg);
        self
    }
}

/// One core's coordination context.
#[derive(Debug)]
pub struct Node {
    core: CoreId,
    token: CoreToken,
    ipc: IpcCore,
    reslock: Arc<ResourceLock>,
    supervisor: Option<Arc<Supervisor>>,
    beacon: Option<Beacon>,
    device_id_client: RpcClient,
}

impl Node {
    /// Bring the node up: build the channel registry, start the
    /// dispatcher (and supervisor/beacon), wire the subsystems together
    /// and announce startup to the peer.
    ///
    /// # Errors
    ///
    /// Registry conflicts, thread spawn failure, or a transport error
    /// while announcing startup.
    pub fn init(
        config: NodeConfig,
        transport: Arc<dyn MailboxTransport>,
        shared_ram: Arc<EnvelopeTable>,
    ) -> Result<Self> {
        let core = config.core;
        let token = CoreToken::new(core);
        debug!("{core}: node init");

        let supervisor = config.supervisor.map(|cfg| Arc::new(Supervisor::start(cfg)));
        let reslock = ResourceLock::new(
            core,
            token.clone(),
            config.resources,
            config.resource_server,
        );

        let mut builder = IpcBuilder::new(core)
            .channel(reslock.channel_config())
            .channel(match &supervisor {
                Some(sup) => sup.channel_config(),
                None => ChannelConfig::new(HEARTBEAT_CHANNEL),
            })
            .channel(match config.device_id {
                Some(unique_id) => device_id_server(unique_id),
                None => ChannelConfig::new(DEVICE_ID_CHANNEL),
            });
        for cfg in config.channels {
            builder = builder.channel(cfg);
        }

        let ipc = builder.build(&token, transport, shared_ram)?;

        reslock.attach(RpcClient::new(ipc.channel(RES_LOCK_CHANNEL)?));
        let device_id_client = RpcClient::new(ipc.channel(DEVICE_ID_CHANNEL)?);

        if let Some(sup) = &supervisor {
            // Any inbound traffic counts as a sign of life.
            let sup_traffic = Arc::clone(sup);
            ipc.set_traffic_hook(Arc::new(move |source| {
                sup_traffic.heartbeat_notify(source);
            }));
        }
        {
            let sup = supervisor.clone();
            let reslock_hook = Arc::clone(&reslock);
            ipc.set_peer_state_hook(Arc::new(move |source, powered_on| {
                if !powered_on {
                    // A dying peer abandons its pending resource
                    // requests; hand anything it owned to local waiters.
                    reslock_hook.reset_peer(source);
                }
                if let Some(sup) = &sup {
                    sup.reset_notify(source, powered_on);
                }
            }));
        }

        let beacon = match config.beacon_period {
            Some(period) => Some(Beacon::start(
                ipc.channel(HEARTBEAT_CHANNEL)?,
                core,
                period,
            )?),
            None => None,
        };

        ipc.announce_startup()?;
        info!("{core}: node up");

        Ok(Self {
            core,
            token,
            ipc,
            reslock,
            supervisor,
            beacon,
            device_id_client,
        })
    }

    /// This node's core.
    #[must_use]
    pub fn core(&self) -> CoreId {
        self.core
    }

    /// The core token (for spinlock use by application code).
    #[must_use]
    pub fn token(&self) -> &CoreToken {
        &self.token
    }

    /// Handle for a registered channel.
    ///
    /// # Errors
    ///
    /// [`AmpError::NoSuchChannel`](crate::AmpError::NoSuchChannel) for
    /// unregistered names.
    pub fn channel(&self, name: &str) -> Result<IpcChannel> {
        self.ipc.channel(name)
    }

    /// The cross-core resource lock.
    #[must_use]
    pub fn resource_lock(&self) -> &ResourceLock {
        &self.reslock
    }

    /// The liveness supervisor, on the watching core.
    #[must_use]
    pub fn supervisor(&self) -> Option<&Arc<Supervisor>> {
        self.supervisor.as_ref()
    }

    /// Query the peer's device identification over RPC.
    ///
    /// # Errors
    ///
    /// Transport or decode errors.
    pub fn query_peer_device_id(&self) -> Result<DeviceId> {
        query_device_id(&self.device_id_client)
    }

    /// Current mailbox FIFO state.
    #[must_use]
    pub fn mailbox_state(&self) -> TransportStatus {
        self.ipc.mailbox_state()
    }

    /// True if `core` has announced startup and not shut down since.
    #[must_use]
    pub fn core_is_up(&self, core: CoreId) -> bool {
        self.ipc.core_is_up(core)
    }

    /// Stop sending heartbeat pings (the beacon thread joins).
    pub fn stop_beacon(&mut self) {
        if let Some(mut beacon) = self.beacon.take() {
            beacon.stop();
        }
    }

    /// Tear the node down: stop the beacon, perform the shutdown
    /// handshake with the peer, then stop the dispatcher.
    ///
    /// # Errors
    ///
    /// A failed shutdown announcement; local teardown still completes.
    pub fn deinit(mut self) -> Result<()> {
        info!("{}: node deinit", self.core);
        self.stop_beacon();
        let announced = self.ipc.announce_shutdown();
        self.supervisor = None;
        self.ipc.stop();
        announced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transports::loopback::LoopbackTransport;
    use bytes::BytesMut;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::thread;

    /// System core node + application core node over one loopback link.
    fn node_pair(
        sys: impl FnOnce(NodeConfig) -> NodeConfig,
        app: impl FnOnce(NodeConfig) -> NodeConfig,
    ) -> (Node, Node) {
        let (ta, tb) = LoopbackTransport::pair();
        let shared_ram = EnvelopeTable::new();

        let mut sys_cfg = NodeConfig::new(CoreId::CPU0);
        sys_cfg.resource_server = true;
        sys_cfg.device_id = Some(0xFEED_F00D_1234_5678);
        let sys_cfg = sys(sys_cfg);

        let app_cfg = app(NodeConfig::new(CoreId::CPU1));

        let a = Node::init(sys_cfg, ta as Arc<dyn MailboxTransport>, Arc::clone(&shared_ram)).unwrap();
        let b = Node::init(app_cfg, tb as Arc<dyn MailboxTransport>, shared_ram).unwrap();
        (a, b)
    }

    #[test]
    fn ping_scenario_round_trip() {
        // Core A registers "ping" echoing input + 1; core B calls with
        // 41 and must see 42, with the handler observing 41 exactly once.
        let observed = Arc::new(AtomicU32::new(0));
        let observed2 = Arc::clone(&observed);
        let (a, b) = node_pair(
            |cfg| {
                cfg.channel(ChannelConfig::new("ping").on_receive(move |payload, _| {
                    observed2.fetch_add(u32::from(payload[0]), Ordering::SeqCst);
                    payload[0] += 1;
                    0
                }))
            },
            |cfg| cfg.channel(ChannelConfig::new("ping")),
        );

        let reply = b
            .channel("ping")
            .unwrap()
            .send_sync(BytesMut::from(&[41u8][..]))
            .unwrap();
        assert_eq!(reply.payload[0], 42);
        assert_eq!(observed.load(Ordering::SeqCst), 41);

        b.deinit().unwrap();
        a.deinit().unwrap();
    }

    #[test]
    fn device_id_rpc_reports_chip_constants() {
        let (a, b) = node_pair(|cfg| cfg, |cfg| cfg);
        let id = b.query_peer_device_id().unwrap();
        assert_eq!(id.chip_id, tandem_chip::CHIP_ID);
        assert_eq!(id.revision, tandem_chip::CHIP_REVISION);
        assert_eq!(id.unique_id, 0xFEED_F00D_1234_5678);
        drop((a, b));
    }

    #[test]
    fn cross_core_resource_exclusion_and_fairness() {
        let (a, b) = node_pair(|cfg| cfg, |cfg| cfg);
        let a = Arc::new(a);
        let b = Arc::new(b);
        let in_use = Arc::new(AtomicBool::new(false));
        const CYCLES: u32 = 25;

        let mut workers = Vec::new();
        for node in [Arc::clone(&a), Arc::clone(&b)] {
            let in_use = Arc::clone(&in_use);
            workers.push(thread::spawn(move || {
                for _ in 0..CYCLES {
                    node.resource_lock()
                        .acquire(tandem_chip::resource::DMA0, Duration::from_secs(10))
                        .expect("no starvation within timeout");
                    assert!(
                        !in_use.swap(true, Ordering::SeqCst),
                        "ownership overlapped"
                    );
                    thread::sleep(Duration::from_millis(1));
                    in_use.store(false, Ordering::SeqCst);
                    node.resource_lock()
                        .release(tandem_chip::resource::DMA0)
                        .unwrap();
                }
            }));
        }
        for w in workers {
            w.join().unwrap();
        }
    }

    #[test]
    fn remote_timeout_retraction_is_idempotent() {
        let (a, b) = node_pair(|cfg| cfg, |cfg| cfg);

        // The server core holds the resource; the client core's acquire
        // times out remotely and must retract cleanly.
        a.resource_lock()
            .acquire(tandem_chip::resource::QSPI, Duration::from_secs(1))
            .unwrap();
        let err = b
            .resource_lock()
            .acquire(tandem_chip::resource::QSPI, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, crate::AmpError::Timeout { .. }));

        // After release the client acquires immediately; the timed-out
        // request left no residue.
        a.resource_lock().release(tandem_chip::resource::QSPI).unwrap();
        b.resource_lock()
            .acquire(tandem_chip::resource::QSPI, Duration::from_secs(1))
            .unwrap();
        b.resource_lock().release(tandem_chip::resource::QSPI).unwrap();
        drop((a, b));
    }

    #[test]
    fn supervisor_escalates_when_beacon_stops() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = Arc::clone(&fired);
        let (a, mut b) = node_pair(
            |mut cfg| {
                cfg.supervisor = Some(SupervisorConfig {
                    deadline: Duration::from_millis(200),
                    start_retry_wait: Duration::from_millis(40),
                    start_retries: 2,
                });
                cfg
            },
            |mut cfg| {
                cfg.beacon_period = Some(Duration::from_millis(40));
                cfg
            },
        );
        let sup = a.supervisor().unwrap();
        sup.set_escalation_hook(Arc::new(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        sup.reset_notify(CoreId::CPU1, true);

        // Beacon alive: no escalation across several deadlines.
        thread::sleep(Duration::from_millis(500));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(sup.is_powered_on(CoreId::CPU1));

        // Silence the application core without a shutdown handshake.
        b.stop_beacon();
        thread::sleep(Duration::from_millis(800));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop((a, b));
    }

    #[test]
    fn shutdown_handshake_marks_peer_down() {
        let (a, b) = node_pair(|cfg| cfg, |cfg| cfg);
        thread::sleep(Duration::from_millis(50));
        assert!(a.core_is_up(CoreId::CPU1));
        b.deinit().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(!a.core_is_up(CoreId::CPU1));
        a.deinit().unwrap();
    }

    #[test]
    fn peer_shutdown_releases_abandoned_resources() {
        let (a, b) = node_pair(|cfg| cfg, |cfg| cfg);

        // The application core takes the resource, then the system core
        // queues behind it.
        b.resource_lock()
            .acquire(tandem_chip::resource::DMA0, Duration::from_secs(1))
            .unwrap();
        let a = Arc::new(a);
        let a2 = Arc::clone(&a);
        let waiter = thread::spawn(move || {
            a2.resource_lock()
                .acquire(tandem_chip::resource::DMA0, Duration::from_secs(10))
        });
        thread::sleep(Duration::from_millis(100));

        // The application core powers down without releasing. The
        // shutdown notification clears its counts and hands the grant
        // to the waiting system-core task.
        b.deinit().unwrap();
        waiter.join().unwrap().unwrap();
        drop(a);
    }
}
