// SPDX-License-Identifier: Apache-2.0

//! Cross-core shared-resource lock.
//!
//! Grants one core at a time exclusive use of a shared peripheral (a DMA
//! channel, a hardware FIFO). Ownership state is never read directly by
//! both cores: one core — the *server* — holds the authoritative
//! per-core pending-request counts, and the other reaches them through
//! typed RPC on the `"amp_res"` channel. The counts decide everything:
//!
//! - An acquire that finds the resource idle (no pending requests
//!   anywhere) pre-signals the local grant semaphore and proceeds
//!   immediately.
//! - A release hands off to a local waiter first (own count still
//!   nonzero), otherwise notifies the remote core that the resource is
//!   available.
//! - An acquire that times out *retracts* its pending count, and — if
//!   its core's count dropped to zero — drains the grant semaphore to
//!   kill a grant that raced the timeout. Skipping the drain would let
//!   two tasks own the same resource.
//!
//! Callers must be preemptible: calls from mailbox delivery context or
//! before the node is running are rejected, never attempted.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tandem_chip::cpu::{CoreId, CORE_COUNT};
use tracing::{debug, warn};

use crate::channel::ChannelConfig;
use crate::error::{AmpError, Result};
use crate::rpc::{rpc_server_channel, RpcClient, RpcMessage};
use crate::sync::in_isr_context;
use crate::sync::semaphore::Semaphore;
use crate::sync::spinlock::{CoreToken, Spinlock};

/// Channel carrying resource-lock protocol messages.
pub const RES_LOCK_CHANNEL: &str = "amp_res";

/// Index of one shared resource.
pub type ResourceId = u16;

const OWNER_FREE: u8 = 0xFF;

/// Pending-request counts returned by the server for one resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReqCounts {
    /// The asking core's count (before increment for an acquire, after
    /// decrement for a release).
    pub self_count: u16,
    /// Sum of every other core's counts.
    pub others: u16,
}

/// Which side of the count table this core is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

#[derive(Debug)]
struct ResEntry {
    owner: AtomicU8,
    sem: Semaphore,
}

/// Per-core resource-lock instance. Both cores create one; exactly one
/// is the server.
#[derive(Debug)]
pub struct ResourceLock {
    core: CoreId,
    token: CoreToken,
    role: Role,
    entries: Box<[ResEntry]>,
    /// Server only: pending-request counts, `[resource][core]`.
    counts: Spinlock<Vec<[u16; CORE_COUNT]>>,
    /// RPC proxy to the peer's `"amp_res"` handler.
    remote: OnceLock<RpcClient>,
    started: AtomicBool,
}

impl ResourceLock {
    /// Create the instance for one core with `resources` entries.
    #[must_use]
    pub fn new(core: CoreId, token: CoreToken, resources: u16, server: bool) -> Arc<Self> {
        let counts = if server {
            vec![[0u16; CORE_COUNT]; usize::from(resources)]
        } else {
            Vec::new()
        };
        Arc::new(Self {
            core,
            token,
            role: if server { Role::Server } else { Role::Client },
            entries: (0..resources)
                .map(|_| ResEntry {
                    owner: AtomicU8::new(OWNER_FREE),
                    sem: Semaphore::binary(),
                })
                .collect(),
            counts: Spinlock::new(counts),
            remote: OnceLock::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Wire the RPC proxy and mark the instance live. Called by the
    /// node once its IPC core is running.
    pub(crate) fn attach(&self, remote: RpcClient) {
        let _ = self.remote.set(remote);
        self.started.store(true, Ordering::Release);
    }

    fn entry(&self, res: ResourceId) -> Result<&ResEntry> {
        self.entries
            .get(usize::from(res))
            .ok_or(AmpError::InvalidResource {
                id: res,
                count: self.entries.len() as u16,
            })
    }

    fn check_preemptible(&self, what: &'static str) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(AmpError::NotInitialized {
                what: "resource lock",
            });
        }
        if in_isr_context() {
            warn!("{}: {what} called from delivery context", self.core);
            return Err(AmpError::NonPreemptibleContext { what });
        }
        Ok(())
    }

    /// Acquire exclusive use of `res`, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// [`AmpError::Timeout`] if no grant arrived in time (the pending
    /// request is retracted first, leaving counts as if the call never
    /// happened); rejection errors per the module docs.
    pub fn acquire(&self, res: ResourceId, timeout: Duration) -> Result<()> {
        self.check_preemptible("resource acquire")?;
        let entry = self.entry(res)?;

        let counts = match self.role {
            Role::Server => self.acquire_cnt(res, self.core)?,
            Role::Client => self.remote_op(OP_ACQUIRE_CNT, res)?,
        };

        if counts.self_count == 0 && counts.others == 0 {
            // Resource idle: grant immediately.
            entry.sem.give();
            entry.owner.store(self.core.index(), Ordering::Release);
        }

        match entry.sem.take(Some(timeout)) {
            Ok(()) => Ok(()),
            Err(timeout_err) => {
                // Retract the pending request before reporting failure.
                let after = match self.role {
                    Role::Server => self.release_cnt(res, self.core),
                    Role::Client => self.remote_op(OP_RELEASE_CNT, res),
                };
                if let Ok(after) = after {
                    if after.self_count == 0 {
                        // A grant may have slipped in between the timeout
                        // and the retraction; drain it so a later acquire
                        // cannot pair with this stale signal and overlap
                        // with the real owner.
                        entry.sem.try_take();
                    }
                }
                Err(timeout_err)
            }
        }
    }

    /// Release `res`, handing off to a local waiter or notifying the
    /// remote core.
    ///
    /// # Errors
    ///
    /// Rejection errors per the module docs; count underflow reports
    /// [`AmpError::NotInitialized`]-class failure from the server.
    pub fn release(&self, res: ResourceId) -> Result<()> {
        self.check_preemptible("resource release")?;
        let entry = self.entry(res)?;

        let counts = match self.role {
            Role::Server => self.release_cnt(res, self.core)?,
            Role::Client => self.remote_op(OP_RELEASE_CNT, res)?,
        };

        if counts.self_count > 0 {
            // A local task is waiting; hand off without crossing cores.
            entry.sem.give();
        } else if counts.others > 0 {
            self.send_available(res)?;
            entry.owner.store(self.core.peer().index(), Ordering::Release);
        }
        Ok(())
    }

    /// Grant arrived from the remote core: take ownership and wake the
    /// local waiter. IPC handler use only.
    pub(crate) fn available(&self, res: ResourceId) -> Result<()> {
        let entry = self.entry(res)?;
        entry.owner.store(self.core.index(), Ordering::Release);
        entry.sem.give();
        Ok(())
    }

    /// The core currently owning `res`, if any (diagnostic; the counts
    /// are authoritative).
    #[must_use]
    pub fn owner(&self, res: ResourceId) -> Option<CoreId> {
        let entry = self.entries.get(usize::from(res))?;
        CoreId::new(entry.owner.load(Ordering::Acquire))
    }

    // ── Server-side count table ──────────────────────────────────────────

    fn acquire_cnt(&self, res: ResourceId, cpu: CoreId) -> Result<ReqCounts> {
        let mut counts = self.counts.lock(&self.token);
        let row = counts
            .get_mut(usize::from(res))
            .ok_or(AmpError::InvalidResource {
                id: res,
                count: self.entries.len() as u16,
            })?;
        let all: u16 = row.iter().sum();
        let self_count = row[usize::from(cpu.index())];
        row[usize::from(cpu.index())] += 1;
        Ok(ReqCounts {
            self_count,
            others: all - self_count,
        })
    }

    fn release_cnt(&self, res: ResourceId, cpu: CoreId) -> Result<ReqCounts> {
        let mut counts = self.counts.lock(&self.token);
        let row = counts
            .get_mut(usize::from(res))
            .ok_or(AmpError::InvalidResource {
                id: res,
                count: self.entries.len() as u16,
            })?;
        let idx = usize::from(cpu.index());
        if row[idx] == 0 {
            return Err(AmpError::NotInitialized {
                what: "release without pending request",
            });
        }
        row[idx] -= 1;
        let all: u16 = row.iter().sum();
        let self_count = row[idx];
        Ok(ReqCounts {
            self_count,
            others: all - self_count,
        })
    }

    /// Peer core powered off: clear its pending counts. If it owned a
    /// resource local tasks are waiting on, hand the grant to them.
    pub fn reset_peer(&self, peer: CoreId) {
        if self.role != Role::Server {
            return;
        }
        let peer_idx = usize::from(peer.index());
        let self_idx = usize::from(self.core.index());
        let mut counts = self.counts.lock(&self.token);
        for (res, row) in counts.iter_mut().enumerate() {
            if row[peer_idx] > 0 {
                debug!(
                    "{}: clearing {} pending requests of {peer} on resource {res}",
                    self.core, row[peer_idx]
                );
                row[peer_idx] = 0;
                let entry = &self.entries[res];
                if entry.owner.load(Ordering::Acquire) == peer.index() && row[self_idx] > 0 {
                    entry.sem.give();
                }
            }
        }
    }

    // ── Remote (client) side ─────────────────────────────────────────────

    fn remote(&self) -> Result<&RpcClient> {
        self.remote.get().ok_or(AmpError::NotInitialized {
            what: "resource lock rpc proxy",
        })
    }

    fn remote_op(&self, op: u8, res: ResourceId) -> Result<ReqCounts> {
        let mut msg = ResLockMsg {
            op,
            cpu: self.core.index(),
            res,
            counts: ReqCounts::default(),
            status: STATUS_OK,
        };
        self.remote()?.call(&mut msg)?;
        match msg.status {
            STATUS_OK => Ok(msg.counts),
            STATUS_INVALID => Err(AmpError::InvalidResource {
                id: res,
                count: self.entries.len() as u16,
            }),
            _ => Err(AmpError::NotInitialized {
                what: "server rejected count operation",
            }),
        }
    }

    fn send_available(&self, res: ResourceId) -> Result<()> {
        let mut msg = ResLockMsg {
            op: OP_AVAILABLE,
            cpu: self.core.index(),
            res,
            counts: ReqCounts::default(),
            status: STATUS_OK,
        };
        self.remote()?.call(&mut msg)?;
        Ok(())
    }

    /// Channel registration dispatching inbound protocol messages to
    /// this instance.
    pub(crate) fn channel_config(self: &Arc<Self>) -> ChannelConfig {
        let weak: Weak<ResourceLock> = Arc::downgrade(self);
        rpc_server_channel(RES_LOCK_CHANNEL, move |msg: &mut ResLockMsg| {
            let Some(lock) = weak.upgrade() else {
                msg.status = STATUS_GONE;
                return 0;
            };
            lock.handle_op(msg);
            0
        })
    }

    fn handle_op(&self, msg: &mut ResLockMsg) {
        let cpu = match CoreId::new(msg.cpu) {
            Some(cpu) => cpu,
            None => {
                msg.status = STATUS_INVALID;
                return;
            }
        };
        match (msg.op, self.role) {
            (OP_ACQUIRE_CNT, Role::Server) => match self.acquire_cnt(msg.res, cpu) {
                Ok(counts) => {
                    if counts.self_count == 0 && counts.others == 0 {
                        // The remote proceeds immediately as owner;
                        // record that so a later peer reset can hand the
                        // resource to local waiters.
                        if let Ok(entry) = self.entry(msg.res) {
                            entry.owner.store(cpu.index(), Ordering::Release);
                        }
                    }
                    msg.counts = counts;
                    msg.status = STATUS_OK;
                }
                Err(_) => msg.status = STATUS_INVALID,
            },
            (OP_RELEASE_CNT, Role::Server) => match self.release_cnt(msg.res, cpu) {
                Ok(counts) => {
                    msg.counts = counts;
                    msg.status = STATUS_OK;
                }
                Err(_) => msg.status = STATUS_UNDERFLOW,
            },
            (OP_AVAILABLE, _) => match self.available(msg.res) {
                Ok(()) => msg.status = STATUS_OK,
                Err(_) => msg.status = STATUS_INVALID,
            },
            _ => {
                warn!("{}: count operation sent to non-server core", self.core);
                msg.status = STATUS_INVALID;
            }
        }
    }
}

// ── Wire protocol ────────────────────────────────────────────────────────────

const OP_ACQUIRE_CNT: u8 = 1;
const OP_RELEASE_CNT: u8 = 2;
const OP_AVAILABLE: u8 = 3;

const STATUS_OK: u32 = 0;
const STATUS_INVALID: u32 = 1;
const STATUS_UNDERFLOW: u32 = 2;
const STATUS_GONE: u32 = 3;

#[derive(Debug, Clone, Copy)]
struct ResLockMsg {
    op: u8,
    cpu: u8,
    res: ResourceId,
    counts: ReqCounts,
    status: u32,
}

impl RpcMessage for ResLockMsg {
    const EVENT_ID: u16 = 0x0002;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.op);
        buf.put_u8(self.cpu);
        buf.put_u16_le(self.res);
        buf.put_u16_le(self.counts.self_count);
        buf.put_u16_le(self.counts.others);
        buf.put_u32_le(self.status);
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != 12 {
            return Err(AmpError::rpc_decode(format!(
                "res-lock payload is {} bytes, want 12",
                buf.len()
            )));
        }
        Ok(Self {
            op: buf[0],
            cpu: buf[1],
            res: u16::from_le_bytes(buf[2..4].try_into().unwrap()),
            counts: ReqCounts {
                self_count: u16::from_le_bytes(buf[4..6].try_into().unwrap()),
                others: u16::from_le_bytes(buf[6..8].try_into().unwrap()),
            },
            status: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        })
    }
}
