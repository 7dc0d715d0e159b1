// SPDX-License-Identifier: Apache-2.0

//! Mailbox IPC core.
//!
//! Turns the one-word-at-a-time mailbox transport into named,
//! bidirectional channels with two send disciplines:
//!
//! - **Synchronous**: the caller blocks on the envelope's completion
//!   signal until the peer's handler has run and its ACK arrived; the
//!   handler's return value and the (possibly mutated, echoed-in-place)
//!   payload come back to the caller.
//! - **Asynchronous**: the envelope is queued locally and the dispatcher
//!   transmits it; the ACK later lands on the free list, the channel's
//!   send-done callback runs, and the envelope is freed.
//!
//! One dispatcher thread per core waits on an event set
//! (`SEND | RECV | FREE | LOCAL_SHUTDOWN`); the transport's delivery
//! callback — interrupt context on silicon — only CRC-checks, sorts
//! envelopes onto the pending lists, and posts events. List mutation is
//! shared between the two contexts and guarded by interrupt-mask +
//! spinlock.
//!
//! Every non-SYSTEM command word carries a CRC-8 of the framed envelope
//! body. A mismatch is logged and the word is dropped — no NACK, no
//! retry. A dropped ACK therefore strands its synchronous sender; see
//! `IpcChannel::send_sync` for why this is not papered over here.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use bytes::BytesMut;
use tandem_chip::cpu::{CoreId, CORE_COUNT};
use tandem_chip::result_code::RESULT_NO_SUCH_CHANNEL;
use tandem_chip::wire::{sys_state, MsgType, WireHeader};
use tracing::{debug, error, trace, warn};

use crate::channel::{ChannelConfig, ChannelEntry, IpcChannel};
use crate::envelope::{Envelope, EnvelopeTable, SendMode};
use crate::error::{AmpError, Result};
use crate::sync::event::EventSet;
use crate::sync::semaphore::Semaphore;
use crate::sync::spinlock::{CoreToken, Spinlock};
use crate::sync::{in_isr_context, IsrScope};
use crate::transport::{MailboxCmd, MailboxTransport, TransportStatus};

const EVENT_SEND: u32 = 1 << 0;
const EVENT_RECV: u32 = 1 << 1;
const EVENT_FREE: u32 = 1 << 2;
const EVENT_LOCAL_SHUTDOWN: u32 = 1 << 4;
const EVENT_STOP: u32 = 1 << 5;

const EVENT_ALL: u32 = EVENT_SEND | EVENT_RECV | EVENT_FREE | EVENT_LOCAL_SHUTDOWN | EVENT_STOP;

/// Hook fed with the source core of every valid inbound word (liveness
/// supervision counts any traffic as a heartbeat).
pub(crate) type TrafficHook = Arc<dyn Fn(CoreId) + Send + Sync>;

/// Hook invoked when a SYSTEM message changes a peer's recorded state;
/// `true` = startup, `false` = shutdown.
pub(crate) type PeerStateHook = Arc<dyn Fn(CoreId, bool) + Send + Sync>;

/// Result of a synchronous send.
#[derive(Debug)]
pub struct SyncReply {
    /// Remote result word (handler return value or a reserved code).
    pub result: u32,
    /// The payload, echoed back after in-place mutation by the handler.
    pub payload: BytesMut,
}

#[derive(Debug, Default)]
struct Queues {
    /// Asynchronous envelopes awaiting transmission.
    local: VecDeque<u64>,
    /// Inbound commands awaiting handler dispatch.
    remote: VecDeque<u64>,
    /// Acknowledged asynchronous envelopes awaiting their send-done
    /// callback and release.
    free: VecDeque<u64>,
}

pub(crate) struct IpcShared {
    core: CoreId,
    token: CoreToken,
    transport: Arc<dyn MailboxTransport>,
    table: Arc<EnvelopeTable>,
    channels: Vec<Arc<ChannelEntry>>,
    queues: Spinlock<Queues>,
    events: EventSet,
    /// Transmit gate: one command word in flight at a time; released by
    /// the transport's tx-complete callback.
    tx_gate: Semaphore,
    running: AtomicBool,
    /// Last announced state per core (1 = startup). Own slot is set at
    /// init.
    cpu_state: [AtomicU8; CORE_COUNT],
    traffic_hook: Mutex<Option<TrafficHook>>,
    peer_state_hook: Mutex<Option<PeerStateHook>>,
}

impl std::fmt::Debug for IpcShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcShared")
            .field("core", &self.core)
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

impl IpcShared {
    fn find_channel(&self, name: &str) -> Option<&Arc<ChannelEntry>> {
        self.channels.iter().find(|e| e.cfg.name == name)
    }

    /// Transmit one command word through the gate.
    fn send_word(&self, header: WireHeader, param1: u64, crc_word: u32) -> Result<()> {
        self.tx_gate.take(None)?;
        let cmd = MailboxCmd {
            header: header.to_byte(),
            param1,
            param2: crc_word,
            param3: 0,
        };
        if let Err(e) = self.transport.write(cmd) {
            error!("{}: mailbox write failed: {e}", self.core);
            self.tx_gate.give();
            return Err(e);
        }
        Ok(())
    }

    fn send_envelope(&self, msg_type: MsgType, env: &Envelope, key: u64) -> Result<()> {
        let header = WireHeader::new(self.core, msg_type);
        self.send_word(header, key, u32::from(env.body_crc()))
    }

    /// Announce a core-state change. For a shutdown announcement the
    /// call additionally blocks until the transport has drained the
    /// word, bounding the race where the peer is mid-send while this
    /// core disappears.
    pub(crate) fn send_system(&self, state: u64) -> Result<()> {
        let header = WireHeader::new(self.core, MsgType::System);
        self.send_word(header, state, 0)?;
        if state == sys_state::SHUTDOWN {
            self.tx_gate.take(None)?;
            self.tx_gate.give();
        }
        Ok(())
    }

    fn send_ack(&self, env: &Envelope, key: u64) -> Result<()> {
        trace!("{}: ack {key:#x} result {:#x}", self.core, env.result());
        self.send_envelope(MsgType::Ack, env, key)
    }

    pub(crate) fn send_user(
        self: &Arc<Self>,
        entry: &Arc<ChannelEntry>,
        payload: BytesMut,
        mode: SendMode,
    ) -> Result<SyncReply> {
        if !self.running.load(Ordering::Acquire) {
            return Err(AmpError::Shutdown);
        }
        match mode {
            SendMode::Sync => {
                if in_isr_context() {
                    return Err(AmpError::NonPreemptibleContext {
                        what: "synchronous send from mailbox delivery context",
                    });
                }
                let env = Envelope::new(&entry.cfg.name, payload, SendMode::Sync);
                let key = self.table.insert(Arc::clone(&env));
                if let Err(e) = self.send_envelope(MsgType::Command, &env, key) {
                    self.table.remove(key);
                    return Err(e);
                }
                // Unbounded wait: completion comes only from the ACK.
                env.done().take(None)?;
                let env = match self.table.remove(key) {
                    Some(env) => env,
                    None => {
                        error!("{}: sync envelope {key:#x} freed by peer", self.core);
                        env
                    }
                };
                Ok(SyncReply {
                    result: env.result(),
                    payload: env.take_payload(),
                })
            }
            SendMode::Async => {
                let env = Envelope::new(&entry.cfg.name, payload, SendMode::Async);
                let key = self.table.insert(env);
                self.queues.lock(&self.token).local.push_back(key);
                self.events.post(EVENT_SEND);
                Ok(SyncReply {
                    result: 0,
                    payload: BytesMut::new(),
                })
            }
        }
    }

    // ── Delivery ("ISR") side ────────────────────────────────────────────

    fn rx_isr(&self, cmd: MailboxCmd) {
        let Some(header) = WireHeader::from_byte(cmd.header) else {
            warn!("{}: undecodable header {:#04x}, word dropped", self.core, cmd.header);
            return;
        };
        if header.source == self.core {
            error!("{}: received message from itself", self.core);
        }
        if let Some(hook) = self.traffic_hook.lock().unwrap().clone() {
            hook(header.source);
        }

        match header.msg_type {
            MsgType::Command => {
                let Some(env) = self.table.get(cmd.param1) else {
                    error!("{}: command with dead envelope {:#x}", self.core, cmd.param1);
                    return;
                };
                if u32::from(env.body_crc()) != cmd.param2 {
                    error!("{}: crc check failed on '{}', dropped", self.core, env.channel());
                    return;
                }
                self.queues.lock(&self.token).remote.push_back(cmd.param1);
                self.events.post(EVENT_RECV);
            }
            MsgType::Ack => {
                let Some(env) = self.table.get(cmd.param1) else {
                    error!("{}: ack with dead envelope {:#x}", self.core, cmd.param1);
                    return;
                };
                if u32::from(env.body_crc()) != cmd.param2 {
                    // The stranded sync sender is the documented cost of
                    // the no-NACK protocol.
                    error!("{}: crc check failed on ack for '{}', dropped", self.core, env.channel());
                    return;
                }
                match env.mode() {
                    SendMode::Sync => env.done().give(),
                    SendMode::Async => {
                        self.queues.lock(&self.token).free.push_back(cmd.param1);
                        self.events.post(EVENT_FREE);
                    }
                }
            }
            MsgType::System => {
                let idx = usize::from(header.source.index());
                debug!("{}: {} state changed: {}", self.core, header.source, cmd.param1);
                if idx < CORE_COUNT {
                    self.cpu_state[idx].store(cmd.param1 as u8, Ordering::Release);
                }
                if let Some(hook) = self.peer_state_hook.lock().unwrap().clone() {
                    hook(header.source, cmd.param1 == sys_state::STARTUP);
                }
            }
        }
    }

    // ── Dispatcher side ──────────────────────────────────────────────────

    fn dispatch_loop(self: &Arc<Self>) {
        while self.running.load(Ordering::Acquire) {
            let mut bits = self.events.wait_any(EVENT_ALL, None);
            if bits & EVENT_STOP != 0 {
                break;
            }
            let mut loop_again = true;
            while loop_again {
                loop_again = false;

                if bits & EVENT_FREE != 0 {
                    while let Some(key) = self.pop_queue(|q| &mut q.free) {
                        self.finish_async(key);
                    }
                }

                if bits & EVENT_RECV != 0 {
                    if let Some(key) = self.pop_queue(|q| &mut q.remote) {
                        self.handle_command(key);
                        loop_again = true;
                    }
                }

                if bits & EVENT_SEND != 0 {
                    if let Some(key) = self.pop_queue(|q| &mut q.local) {
                        self.transmit_async(key);
                        loop_again = true;
                    }
                }

                if bits & EVENT_LOCAL_SHUTDOWN != 0 {
                    bits &= !EVENT_LOCAL_SHUTDOWN;
                    if let Err(e) = self.send_system(sys_state::SHUTDOWN) {
                        error!("{}: shutdown announcement failed: {e}", self.core);
                    }
                }
            }
        }
        debug!("{}: ipc dispatcher exiting", self.core);
    }

    fn pop_queue(&self, pick: impl Fn(&mut Queues) -> &mut VecDeque<u64>) -> Option<u64> {
        let mut queues = self.queues.lock(&self.token);
        pick(&mut queues).pop_front()
    }

    /// Run the send-done callback for an acknowledged async envelope and
    /// free it.
    fn finish_async(&self, key: u64) {
        let Some(env) = self.table.remove(key) else {
            error!("{}: free of dead envelope {key:#x}", self.core);
            return;
        };
        if let Some(entry) = self.find_channel(env.channel()) {
            if let Some(tx_done) = &entry.cfg.tx_done {
                tx_done(&env.payload(), env.result());
            }
        }
    }

    /// Dispatch one inbound command to its channel handler and ACK.
    fn handle_command(self: &Arc<Self>, key: u64) {
        let Some(env) = self.table.get(key) else {
            error!("{}: dispatch of dead envelope {key:#x}", self.core);
            return;
        };

        let Some(entry) = self.find_channel(env.channel()) else {
            warn!("{}: no channel '{}' registered locally", self.core, env.channel());
            env.set_result(RESULT_NO_SUCH_CHANNEL);
            if let Err(e) = self.send_ack(&env, key) {
                error!("{}: nak-style ack failed: {e}", self.core);
            }
            return;
        };

        let result = match &entry.cfg.rx {
            Some(rx) => {
                let request = IpcRequest {
                    shared: self,
                    key,
                    env: &env,
                };
                let mut payload = env.payload();
                rx(&mut payload, &request)
            }
            None => 0,
        };

        if env.is_deferred() {
            // Handler took ownership of completion; the ACK goes out
            // later through `DeferredReply::complete`.
            return;
        }

        env.set_result(result);
        if let Err(e) = self.send_ack(&env, key) {
            error!("{}: ack failed: {e}", self.core);
        }
    }

    /// Transmit one queued asynchronous envelope.
    fn transmit_async(&self, key: u64) {
        let Some(env) = self.table.get(key) else {
            error!("{}: transmit of dead envelope {key:#x}", self.core);
            return;
        };
        if let Err(e) = self.send_envelope(MsgType::Command, &env, key) {
            error!("{}: async transmit on '{}' failed: {e}", self.core, env.channel());
            // Without a transmit there will never be an ACK; free here
            // so the slot is not leaked.
            self.table.remove(key);
        }
    }
}

// ── Handler context ──────────────────────────────────────────────────────────

/// Context passed to a channel receive handler.
pub struct IpcRequest<'a> {
    shared: &'a Arc<IpcShared>,
    key: u64,
    env: &'a Arc<Envelope>,
}

impl IpcRequest<'_> {
    /// Defer completion: the dispatcher will not ACK this command; the
    /// handler must later call [`DeferredReply::complete`].
    #[must_use]
    pub fn defer(&self) -> DeferredReply {
        self.env.mark_deferred();
        DeferredReply {
            shared: Arc::downgrade(self.shared),
            key: self.key,
        }
    }
}

/// Completion token for a deferred command. Send the ACK with
/// [`complete`](Self::complete); dropping without completing strands the
/// remote sender (which is why this type is `must_use`).
#[must_use = "the remote sender blocks until complete() is called"]
pub struct DeferredReply {
    shared: Weak<IpcShared>,
    key: u64,
}

impl DeferredReply {
    /// Write the result word and send the ACK.
    ///
    /// # Errors
    ///
    /// Fails if the IPC core has shut down or the transmit fails.
    pub fn complete(self, result: u32) -> Result<()> {
        let shared = self.shared.upgrade().ok_or(AmpError::Shutdown)?;
        let env = shared.table.get(self.key).ok_or(AmpError::Shutdown)?;
        env.set_result(result);
        shared.send_ack(&env, self.key)
    }
}

// ── Public core ──────────────────────────────────────────────────────────────

/// Builder collecting channel registrations for one core's IPC instance.
///
/// Registrations are frozen, in order, when [`build`](Self::build) runs.
#[derive(Debug)]
pub struct IpcBuilder {
    core: CoreId,
    channels: Vec<ChannelConfig>,
}

impl IpcBuilder {
    /// Start a builder for `core`.
    #[must_use]
    pub fn new(core: CoreId) -> Self {
        Self {
            core,
            channels: Vec::new(),
        }
    }

    /// Register a channel. Names must be unique per route.
    #[must_use]
    pub fn channel(mut self, cfg: ChannelConfig) -> Self {
        self.channels.push(cfg);
        self
    }

    /// Freeze the registry, attach to the transport and start the
    /// dispatcher thread.
    ///
    /// # Errors
    ///
    /// [`AmpError::DuplicateChannel`] if two registrations share a name
    /// on the same route.
    pub fn build(
        self,
        token: &CoreToken,
        transport: Arc<dyn MailboxTransport>,
        table: Arc<EnvelopeTable>,
    ) -> Result<IpcCore> {
        let mut entries: Vec<Arc<ChannelEntry>> = Vec::with_capacity(self.channels.len());
        for cfg in self.channels {
            if entries
                .iter()
                .any(|e| e.cfg.name == cfg.name && e.cfg.route == cfg.route)
            {
                return Err(AmpError::duplicate_channel(cfg.name));
            }
            debug!("{}: channel '{}' registered", self.core, cfg.name);
            entries.push(Arc::new(ChannelEntry { cfg }));
        }

        let shared = Arc::new(IpcShared {
            core: self.core,
            token: token.clone(),
            transport: Arc::clone(&transport),
            table,
            channels: entries,
            queues: Spinlock::new(Queues::default()),
            events: EventSet::new(),
            tx_gate: Semaphore::binary_available(),
            running: AtomicBool::new(true),
            cpu_state: std::array::from_fn(|_| AtomicU8::new(0)),
            traffic_hook: Mutex::new(None),
            peer_state_hook: Mutex::new(None),
        });
        shared.cpu_state[usize::from(self.core.index())].store(1, Ordering::Release);

        let weak = Arc::downgrade(&shared);
        transport.set_rx_handler(Arc::new(move |cmd| {
            if let Some(shared) = weak.upgrade() {
                let _isr = IsrScope::enter();
                shared.rx_isr(cmd);
            }
        }));

        let weak = Arc::downgrade(&shared);
        transport.set_tx_complete_handler(Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.tx_gate.give();
            }
        }));

        let dispatcher = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("ipc-{}", self.core))
                .spawn(move || shared.dispatch_loop())
                .map_err(|_| AmpError::NotInitialized {
                    what: "ipc dispatcher thread",
                })?
        };

        Ok(IpcCore {
            shared,
            dispatcher: Some(dispatcher),
        })
    }
}

/// One core's IPC instance: registry, dispatcher thread, transport
/// binding. Owned by the per-core [`Node`](crate::node::Node).
#[derive(Debug)]
pub struct IpcCore {
    shared: Arc<IpcShared>,
    dispatcher: Option<JoinHandle<()>>,
}

impl IpcCore {
    /// Handle for a registered channel.
    ///
    /// # Errors
    ///
    /// [`AmpError::NoSuchChannel`] if the name was never registered.
    pub fn channel(&self, name: &str) -> Result<IpcChannel> {
        let entry = self
            .shared
            .find_channel(name)
            .ok_or_else(|| AmpError::no_such_channel(name))?;
        Ok(IpcChannel {
            entry: Arc::clone(entry),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Current transport FIFO state.
    #[must_use]
    pub fn mailbox_state(&self) -> TransportStatus {
        self.shared.transport.status()
    }

    /// True if `core` has announced startup and not since announced
    /// shutdown.
    #[must_use]
    pub fn core_is_up(&self, core: CoreId) -> bool {
        let idx = usize::from(core.index());
        idx < CORE_COUNT && self.shared.cpu_state[idx].load(Ordering::Acquire) == 1
    }

    /// Announce this core's startup to the peer.
    ///
    /// # Errors
    ///
    /// Transmit failure.
    pub fn announce_startup(&self) -> Result<()> {
        self.shared.send_system(sys_state::STARTUP)
    }

    /// Announce shutdown and block until the word has drained.
    ///
    /// # Errors
    ///
    /// Transmit failure.
    pub fn announce_shutdown(&self) -> Result<()> {
        self.shared.send_system(sys_state::SHUTDOWN)
    }

    /// Request the dispatcher announce shutdown on its own thread (the
    /// path a power-management stop notification takes).
    pub fn request_local_shutdown(&self) {
        self.shared.events.post(EVENT_LOCAL_SHUTDOWN);
    }

    pub(crate) fn set_traffic_hook(&self, hook: TrafficHook) {
        *self.shared.traffic_hook.lock().unwrap() = Some(hook);
    }

    pub(crate) fn set_peer_state_hook(&self, hook: PeerStateHook) {
        *self.shared.peer_state_hook.lock().unwrap() = Some(hook);
    }

    /// Stop the dispatcher and join it.
    pub(crate) fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.events.post(EVENT_STOP);
        if let Some(handle) = self.dispatcher.take() {
            if handle.join().is_err() {
                error!("{}: dispatcher panicked", self.shared.core);
            }
        }
    }
}

impl Drop for IpcCore {
    fn drop(&mut self) {
        if self.dispatcher.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transports::loopback::LoopbackTransport;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    struct Pair {
        a: IpcCore,
        b: IpcCore,
        #[allow(dead_code)]
        link: (Arc<LoopbackTransport>, Arc<LoopbackTransport>),
    }

    /// Core 0 runs a "ping" handler that increments byte 0 of the
    /// payload in place; core 1 is a pure client.
    fn ping_pair(extra_b: Vec<ChannelConfig>, hits: Arc<AtomicU32>) -> Pair {
        let (ta, tb) = LoopbackTransport::pair();
        let table = EnvelopeTable::new();
        let tok_a = CoreToken::new(CoreId::CPU0);
        let tok_b = CoreToken::new(CoreId::CPU1);

        let a = IpcBuilder::new(CoreId::CPU0)
            .channel(ChannelConfig::new("ping").on_receive(move |payload, _req| {
                hits.fetch_add(1, Ordering::SeqCst);
                payload[0] = payload[0].wrapping_add(1);
                0
            }))
            .build(&tok_a, ta.clone() as Arc<dyn MailboxTransport>, Arc::clone(&table))
            .unwrap();

        let mut builder = IpcBuilder::new(CoreId::CPU1).channel(ChannelConfig::new("ping"));
        for cfg in extra_b {
            builder = builder.channel(cfg);
        }
        let b = builder
            .build(&tok_b, tb.clone() as Arc<dyn MailboxTransport>, table)
            .unwrap();

        Pair { a, b, link: (ta, tb) }
    }

    #[test]
    fn sync_round_trip_increments_payload() {
        let hits = Arc::new(AtomicU32::new(0));
        let pair = ping_pair(Vec::new(), Arc::clone(&hits));

        let chan = pair.b.channel("ping").unwrap();
        let reply = chan.send_sync(BytesMut::from(&[41u8][..])).unwrap();
        assert_eq!(reply.result, 0);
        assert_eq!(reply.payload[0], 42);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        drop(pair);
    }

    #[test]
    fn sync_calls_back_to_back_stay_ordered() {
        let hits = Arc::new(AtomicU32::new(0));
        let pair = ping_pair(Vec::new(), Arc::clone(&hits));
        let chan = pair.b.channel("ping").unwrap();
        for i in 0..32u8 {
            let reply = chan.send_sync(BytesMut::from(&[i][..])).unwrap();
            assert_eq!(reply.payload[0], i + 1);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn async_send_runs_send_done_callback() {
        let hits = Arc::new(AtomicU32::new(0));
        let (done_tx, done_rx) = channel();
        let cfg = ChannelConfig::new("ping-async").on_send_done(move |payload, result| {
            done_tx.send((payload[0], result)).unwrap();
        });

        // Register the async channel on B; its handler lives on A.
        let (ta, tb) = LoopbackTransport::pair();
        let table = EnvelopeTable::new();
        let tok_a = CoreToken::new(CoreId::CPU0);
        let tok_b = CoreToken::new(CoreId::CPU1);
        let hits2 = Arc::clone(&hits);
        let _a = IpcBuilder::new(CoreId::CPU0)
            .channel(ChannelConfig::new("ping-async").on_receive(move |payload, _| {
                hits2.fetch_add(1, Ordering::SeqCst);
                payload[0] = payload[0].wrapping_add(1);
                7
            }))
            .build(&tok_a, ta as Arc<dyn MailboxTransport>, Arc::clone(&table))
            .unwrap();
        let b = IpcBuilder::new(CoreId::CPU1)
            .channel(cfg)
            .build(&tok_b, tb as Arc<dyn MailboxTransport>, Arc::clone(&table))
            .unwrap();

        let chan = b.channel("ping-async").unwrap();
        chan.send_async(BytesMut::from(&[10u8][..])).unwrap();

        let (echoed, result) = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(echoed, 11);
        assert_eq!(result, 7);
        assert_eq!(table.live(), 0, "async envelope must be freed after ack");
    }

    #[test]
    fn unknown_channel_acks_no_such_channel() {
        let hits = Arc::new(AtomicU32::new(0));
        // "orphan" is registered on B only, so A replies NO_SUCH_CHANNEL.
        let pair = ping_pair(vec![ChannelConfig::new("orphan")], Arc::clone(&hits));
        let chan = pair.b.channel("orphan").unwrap();
        let reply = chan.send_sync(BytesMut::from(&[0u8][..])).unwrap();
        assert_eq!(reply.result, RESULT_NO_SUCH_CHANNEL);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn corrupted_command_is_dropped_without_dispatch() {
        let hits = Arc::new(AtomicU32::new(0));
        let pair = ping_pair(Vec::new(), Arc::clone(&hits));
        // Corrupt every outbound word from B: flip a CRC bit.
        pair.link.1.set_fault_hook(Some(Arc::new(|cmd: &mut MailboxCmd| {
            cmd.param2 ^= 0x01;
        })));

        let chan = pair.b.channel("ping").unwrap();
        chan.send_async(BytesMut::from(&[1u8][..])).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        // Silent drop: the handler never ran and no crash occurred.
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn deferred_completion_acks_later() {
        let (ta, tb) = LoopbackTransport::pair();
        let table = EnvelopeTable::new();
        let tok_a = CoreToken::new(CoreId::CPU0);
        let tok_b = CoreToken::new(CoreId::CPU1);
        let (defer_tx, defer_rx) = channel::<DeferredReply>();

        let _a = IpcBuilder::new(CoreId::CPU0)
            .channel(ChannelConfig::new("slow").on_receive(move |_payload, req| {
                defer_tx.send(req.defer()).unwrap();
                0 // ignored once deferred
            }))
            .build(&tok_a, ta as Arc<dyn MailboxTransport>, Arc::clone(&table))
            .unwrap();
        let b = IpcBuilder::new(CoreId::CPU1)
            .channel(ChannelConfig::new("slow"))
            .build(&tok_b, tb as Arc<dyn MailboxTransport>, table)
            .unwrap();

        // Complete from a side thread after a delay.
        let completer = std::thread::spawn(move || {
            let reply = defer_rx.recv().unwrap();
            std::thread::sleep(Duration::from_millis(50));
            reply.complete(99).unwrap();
        });

        let chan = b.channel("slow").unwrap();
        let reply = chan.send_sync(BytesMut::new()).unwrap();
        assert_eq!(reply.result, 99);
        completer.join().unwrap();
    }

    #[test]
    fn duplicate_registration_rejected() {
        let tok = CoreToken::new(CoreId::CPU0);
        let (ta, _tb) = LoopbackTransport::pair();
        let err = IpcBuilder::new(CoreId::CPU0)
            .channel(ChannelConfig::new("dup"))
            .channel(ChannelConfig::new("dup"))
            .build(&tok, ta as Arc<dyn MailboxTransport>, EnvelopeTable::new())
            .unwrap_err();
        assert!(matches!(err, AmpError::DuplicateChannel { .. }));
    }

    #[test]
    fn system_messages_track_peer_state() {
        let hits = Arc::new(AtomicU32::new(0));
        let pair = ping_pair(Vec::new(), hits);
        pair.b.announce_startup().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(pair.a.core_is_up(CoreId::CPU1));

        pair.b.announce_shutdown().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!pair.a.core_is_up(CoreId::CPU1));
    }
}
