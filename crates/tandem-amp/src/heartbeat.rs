// SPDX-License-Identifier: Apache-2.0

//! Liveness supervision of the companion core.
//!
//! The supervisor runs on the watching core and tracks the companion
//! through a small state machine:
//!
//! ```text
//!   PoweredOff ──reset_notify(on)──► Starting ──power-up──► PoweredOn
//!        ▲                                                      │
//!        └──────────────── reset_notify(off) ◄──────────────────┘
//! ```
//!
//! Heartbeats — explicit pings from the companion's beacon task, or any
//! mailbox traffic at all — refresh the deadline. If a `PoweredOn`
//! companion misses the deadline, and is not dumping diagnostic state or
//! inside a low-power pause window, the supervisor declares a liveness
//! timeout **exactly once** and fires the escalation hook. The default
//! hook aborts the process — the host stand-in for the hard system reset
//! that converts a silently hung core into an observable reboot. The
//! timeout does not re-arm until a fresh power-on transition.
//!
//! While `Starting`, the supervisor waits a bounded number of retries
//! for the power-up confirmation; running out of retries is logged but
//! not fatal — escalation is reserved for a core that was up and then
//! went silent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tandem_chip::cpu::CoreId;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelConfig, IpcChannel};
use crate::error::Result;
use crate::sync::event::EventSet;

const EV_START_CORE: u32 = 1 << 0;
const EV_STOP_CORE: u32 = 1 << 1;
const EV_POWER_UP: u32 = 1 << 2;
const EV_HEARTBEAT: u32 = 1 << 3;
const EV_QUIT: u32 = 1 << 4;

const EV_ALL: u32 = EV_START_CORE | EV_STOP_CORE | EV_POWER_UP | EV_HEARTBEAT | EV_QUIT;

/// Channel carrying beacon pings from the supervised core.
pub const HEARTBEAT_CHANNEL: &str = "heartbeat";

const OP_POWER_UP: u8 = 0;
const OP_BEAT: u8 = 1;

/// Companion-core liveness state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    /// Not powered; no deadline runs.
    PoweredOff,
    /// Power-on requested; waiting for the first sign of life.
    Starting,
    /// Alive; the heartbeat deadline is armed.
    PoweredOn,
}

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Heartbeat deadline; also the poll interval while not `PoweredOff`.
    pub deadline: Duration,
    /// Wait per retry for the power-up confirmation while `Starting`.
    pub start_retry_wait: Duration,
    /// Retries before giving up on a start (logged, not fatal).
    pub start_retries: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(2),
            start_retry_wait: Duration::from_millis(500),
            start_retries: 3,
        }
    }
}

/// Escalation hook fired on liveness timeout.
pub type EscalationHook = Arc<dyn Fn(CoreId) + Send + Sync>;

#[derive(Debug)]
struct SupState {
    /// The single managed core; fixed by the first notification.
    core: Option<CoreId>,
    state: CoreState,
    last_beat: Instant,
    dump_in_progress: bool,
    /// Set on low-power exit: grants one deadline of grace.
    lv_exit_pending: bool,
    /// Latched after escalation; cleared by a fresh power-on.
    fired: bool,
}

struct SupInner {
    cfg: SupervisorConfig,
    events: EventSet,
    state: Mutex<SupState>,
    hook: Mutex<EscalationHook>,
    running: AtomicBool,
}

/// Liveness supervisor for the companion core.
pub struct Supervisor {
    inner: Arc<SupInner>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.inner.state.lock().unwrap().state)
            .finish_non_exhaustive()
    }
}

impl SupInner {
    /// True if the managed core is `self.core` (binding it on first
    /// use). A second core id is rejected: one supervisor manages one
    /// core.
    fn check_core(&self, core: CoreId) -> bool {
        let mut s = self.state.lock().unwrap();
        match s.core {
            None => {
                s.core = Some(core);
                true
            }
            Some(managed) if managed == core => true,
            Some(_) => {
                error!("can't manage multiple cores (got {core})");
                false
            }
        }
    }

    /// Deadline check. Refreshes the timestamp in every legitimate-pause
    /// case; returns true only for a genuine miss.
    fn deadline_missed(&self) -> bool {
        let mut s = self.state.lock().unwrap();
        let now = Instant::now();
        match s.state {
            CoreState::PoweredOff => return false,
            CoreState::Starting => {
                s.last_beat = now;
                return false;
            }
            CoreState::PoweredOn => {}
        }
        if s.dump_in_progress {
            s.last_beat = now;
            return false;
        }
        if now.duration_since(s.last_beat) < self.cfg.deadline {
            s.last_beat = now;
            return false;
        }
        if s.lv_exit_pending {
            // First check after a low-power window: the silence was
            // legitimate, re-arm instead of escalating.
            s.lv_exit_pending = false;
            s.last_beat = now;
            return false;
        }
        true
    }

    fn escalate(&self) {
        let core = {
            let mut s = self.state.lock().unwrap();
            if s.fired {
                return;
            }
            s.fired = true;
            s.core
        };
        let Some(core) = core else { return };
        error!("{core} heartbeat timeout, escalating");
        let hook = self.hook.lock().unwrap().clone();
        hook(core);
    }

    fn supervise_loop(&self) {
        let mut poll: Option<Duration> = None;
        while self.running.load(Ordering::Acquire) {
            let mut bits = self.events.wait_any(EV_ALL, poll);
            if bits & EV_QUIT != 0 {
                break;
            }
            if bits == 0 {
                // Poll expiry: check the deadline.
                bits = EV_HEARTBEAT;
            }

            if bits & EV_STOP_CORE != 0 {
                // Powered off: discard everything else this wake-up.
                let s = self.state.lock().unwrap();
                if s.state == CoreState::PoweredOff {
                    bits = 0;
                }
            }

            if bits & EV_START_CORE != 0 {
                self.run_start_sequence(&mut bits);
            }

            if bits & EV_HEARTBEAT != 0 && self.deadline_missed() {
                self.escalate();
            }

            let state = self.state.lock().unwrap().state;
            poll = match state {
                CoreState::PoweredOff => None,
                _ => Some(self.cfg.deadline),
            };
        }
        debug!("supervisor exiting");
    }

    /// Wait (bounded) for the power-up confirmation of a starting core.
    fn run_start_sequence(&self, bits: &mut u32) {
        let mut retries = 0u32;
        loop {
            {
                let s = self.state.lock().unwrap();
                if s.state != CoreState::Starting {
                    // Confirmation raced us, or the core was stopped.
                    return;
                }
            }
            self.deadline_missed(); // refreshes the timestamp while Starting

            if *bits & EV_POWER_UP != 0 {
                let mut s = self.state.lock().unwrap();
                if s.state == CoreState::Starting {
                    s.state = CoreState::PoweredOn;
                    s.last_beat = Instant::now();
                    s.fired = false;
                    info!("{} powered on", s.core.map_or_else(String::new, |c| c.to_string()));
                }
                return;
            }

            if retries >= self.cfg.start_retries {
                warn!("core start unconfirmed after {retries} retries");
                return;
            }
            *bits = self
                .events
                .wait_any(EV_POWER_UP | EV_STOP_CORE | EV_QUIT, Some(self.cfg.start_retry_wait));
            if *bits & (EV_STOP_CORE | EV_QUIT) != 0 {
                return;
            }
            retries += 1;
        }
    }
}

impl Supervisor {
    /// Start a supervisor thread.
    #[must_use]
    pub fn start(cfg: SupervisorConfig) -> Self {
        let inner = Arc::new(SupInner {
            cfg,
            events: EventSet::new(),
            state: Mutex::new(SupState {
                core: None,
                state: CoreState::PoweredOff,
                last_beat: Instant::now(),
                dump_in_progress: false,
                lv_exit_pending: false,
                fired: false,
            }),
            hook: Mutex::new(Arc::new(|core: CoreId| {
                // Stand-in for the hard reset: a hung companion becomes
                // an observable process exit, not a silent deadlock.
                error!("{core} liveness timeout: aborting");
                std::process::abort();
            })),
            running: AtomicBool::new(true),
        });

        let thread = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("heartbeat".into())
                .spawn(move || inner.supervise_loop())
                .expect("spawn supervisor thread")
        };

        Self {
            inner,
            thread: Some(thread),
        }
    }

    /// Replace the escalation hook (tests, orderly-shutdown policies).
    pub fn set_escalation_hook(&self, hook: EscalationHook) {
        *self.inner.hook.lock().unwrap() = hook;
    }

    /// Power-state notification: `true` when the core is released from
    /// reset, `false` when it is stopped.
    pub fn reset_notify(&self, core: CoreId, power_on: bool) {
        if !self.inner.check_core(core) {
            return;
        }
        let mut s = self.inner.state.lock().unwrap();
        if power_on {
            if s.state != CoreState::PoweredOn {
                s.state = CoreState::Starting;
                s.fired = false;
                s.last_beat = Instant::now();
                drop(s);
                self.inner.events.post(EV_START_CORE);
            }
        } else {
            s.state = CoreState::PoweredOff;
            drop(s);
            self.inner.events.post(EV_STOP_CORE);
        }
    }

    /// Heartbeat from the supervised core (explicit ping or any mailbox
    /// traffic). Doubles as the power-up confirmation.
    pub fn heartbeat_notify(&self, core: CoreId) {
        if !self.inner.check_core(core) {
            return;
        }
        {
            let mut s = self.inner.state.lock().unwrap();
            s.last_beat = Instant::now();
        }
        self.inner.events.post(EV_POWER_UP | EV_HEARTBEAT);
    }

    /// Power-up confirmation without a deadline refresh.
    pub fn power_on_notify(&self, core: CoreId) {
        if !self.inner.check_core(core) {
            return;
        }
        self.inner.events.post(EV_POWER_UP);
    }

    /// The supervised core is dumping diagnostic state; pause the
    /// deadline until cleared.
    pub fn dump_notify(&self, core: CoreId, dumping: bool) {
        if !self.inner.check_core(core) {
            return;
        }
        self.inner.state.lock().unwrap().dump_in_progress = dumping;
    }

    /// The system left a low-power window in which heartbeats were
    /// legitimately paused; grant one deadline of grace.
    pub fn lv_sleep_exit_notify(&self) {
        let mut s = self.inner.state.lock().unwrap();
        s.lv_exit_pending = true;
        s.last_beat = Instant::now();
    }

    /// True if the supervised core reached `PoweredOn` and has not been
    /// stopped since.
    #[must_use]
    pub fn is_powered_on(&self, core: CoreId) -> bool {
        let s = self.inner.state.lock().unwrap();
        s.core == Some(core) && s.state == CoreState::PoweredOn
    }

    /// True if the core is off (or was never managed).
    #[must_use]
    pub fn is_powered_off(&self, core: CoreId) -> bool {
        let s = self.inner.state.lock().unwrap();
        s.core != Some(core) || s.state == CoreState::PoweredOff
    }

    /// Current state of the managed core.
    #[must_use]
    pub fn state(&self) -> CoreState {
        self.inner.state.lock().unwrap().state
    }

    /// Channel registration feeding beacon pings into this supervisor.
    #[must_use]
    pub fn channel_config(self: &Arc<Self>) -> ChannelConfig {
        let weak = Arc::downgrade(self);
        ChannelConfig::new(HEARTBEAT_CHANNEL).on_receive(move |payload, _req| {
            let Some(sup) = weak.upgrade() else { return 0 };
            let Some(core) = payload.first().and_then(|b| CoreId::new(b >> 1)) else {
                return 0;
            };
            match payload.first().map(|b| b & 0x01) {
                Some(OP_POWER_UP) => sup.power_on_notify(core),
                _ => sup.heartbeat_notify(core),
            }
            0
        })
    }

    fn stop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.events.post(EV_QUIT);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

// ── Beacon (supervised side) ─────────────────────────────────────────────────

/// Periodic heartbeat sender running on the supervised core.
#[derive(Debug)]
pub struct Beacon {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Beacon {
    /// Announce power-up, then ping every `period` until stopped.
    ///
    /// # Errors
    ///
    /// Fails only if the initial power-up announcement cannot be queued.
    pub fn start(chan: IpcChannel, core: CoreId, period: Duration) -> Result<Self> {
        chan.send_async(beacon_payload(core, OP_POWER_UP))?;

        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("beacon".into())
                .spawn(move || {
                    while running.load(Ordering::Acquire) {
                        std::thread::sleep(period);
                        if !running.load(Ordering::Acquire) {
                            break;
                        }
                        if let Err(e) = chan.send_async(beacon_payload(core, OP_BEAT)) {
                            warn!("beacon send failed: {e}");
                        }
                    }
                })
                .expect("spawn beacon thread")
        };
        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    /// Stop pinging and join the thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Beacon {
    fn drop(&mut self) {
        self.stop();
    }
}

fn beacon_payload(core: CoreId, op: u8) -> bytes::BytesMut {
    bytes::BytesMut::from(&[(core.index() << 1) | op][..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast_cfg() -> SupervisorConfig {
        SupervisorConfig {
            deadline: Duration::from_millis(150),
            start_retry_wait: Duration::from_millis(40),
            start_retries: 2,
        }
    }

    fn counting_supervisor() -> (Supervisor, Arc<AtomicU32>) {
        let sup = Supervisor::start(fast_cfg());
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = Arc::clone(&fired);
        sup.set_escalation_hook(Arc::new(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        (sup, fired)
    }

    #[test]
    fn reaches_powered_on_after_confirmation() {
        let (sup, _fired) = counting_supervisor();
        sup.reset_notify(CoreId::CPU1, true);
        sup.heartbeat_notify(CoreId::CPU1);
        std::thread::sleep(Duration::from_millis(150));
        assert!(sup.is_powered_on(CoreId::CPU1));
    }

    #[test]
    fn silent_core_escalates_exactly_once() {
        let (sup, fired) = counting_supervisor();
        sup.reset_notify(CoreId::CPU1, true);
        sup.heartbeat_notify(CoreId::CPU1);
        // Beat a few times, then go silent past several deadlines.
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(50));
            sup.heartbeat_notify(CoreId::CPU1);
        }
        std::thread::sleep(Duration::from_millis(700));
        assert_eq!(fired.load(Ordering::SeqCst), 1, "must not re-fire while latched");
    }

    #[test]
    fn rearm_requires_fresh_power_on() {
        let (sup, fired) = counting_supervisor();
        sup.reset_notify(CoreId::CPU1, true);
        sup.heartbeat_notify(CoreId::CPU1);
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Fresh power cycle re-arms the timeout.
        sup.reset_notify(CoreId::CPU1, false);
        sup.reset_notify(CoreId::CPU1, true);
        sup.heartbeat_notify(CoreId::CPU1);
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn powered_off_core_never_escalates() {
        let (sup, fired) = counting_supervisor();
        sup.reset_notify(CoreId::CPU1, true);
        sup.heartbeat_notify(CoreId::CPU1);
        std::thread::sleep(Duration::from_millis(50));
        sup.reset_notify(CoreId::CPU1, false);
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(sup.is_powered_off(CoreId::CPU1));
    }

    #[test]
    fn dump_window_pauses_deadline() {
        let (sup, fired) = counting_supervisor();
        sup.reset_notify(CoreId::CPU1, true);
        sup.heartbeat_notify(CoreId::CPU1);
        std::thread::sleep(Duration::from_millis(30));
        sup.dump_notify(CoreId::CPU1, true);
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        sup.dump_notify(CoreId::CPU1, false);
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn low_power_exit_grants_grace_period() {
        let (sup, fired) = counting_supervisor();
        sup.reset_notify(CoreId::CPU1, true);
        sup.heartbeat_notify(CoreId::CPU1);
        std::thread::sleep(Duration::from_millis(30));

        // Heartbeats paused by a sleep window; on exit the first missed
        // deadline is forgiven.
        sup.lv_sleep_exit_notify();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Still silent well past the grace deadline: now it fires.
        std::thread::sleep(Duration::from_millis(700));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_core_is_rejected() {
        let (sup, _fired) = counting_supervisor();
        sup.reset_notify(CoreId::CPU1, true);
        sup.heartbeat_notify(CoreId::CPU1);
        std::thread::sleep(Duration::from_millis(150));
        // Notifications for another core are ignored.
        sup.reset_notify(CoreId::CPU0, false);
        assert!(sup.is_powered_on(CoreId::CPU1));
        assert!(sup.is_powered_off(CoreId::CPU0));
    }

    #[test]
    fn starting_retries_give_up_without_escalation() {
        let (sup, fired) = counting_supervisor();
        sup.reset_notify(CoreId::CPU1, true);
        // Never confirm power-up.
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(sup.state(), CoreState::Starting);
    }
}
