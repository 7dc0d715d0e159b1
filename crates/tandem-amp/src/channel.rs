//! Named channel registry.
//!
//! Channels multiplex the single mailbox link between the cores. Each
//! registration names the channel (unique per route), the route it rides,
//! and optional callbacks: a receive handler invoked by the dispatcher
//! for inbound commands, and a send-done callback invoked when the ACK
//! for an asynchronous send has been processed.
//!
//! Registrations are collected by [`IpcBuilder`](crate::ipc::IpcBuilder)
//! at startup and frozen in registration order — the explicit
//! replacement for the firmware's link-time registration section.

use std::sync::Arc;

use bytes::BytesMut;

use crate::envelope::SendMode;
use crate::error::Result;
use crate::ipc::{IpcRequest, IpcShared, SyncReply};

/// Which pair of cores a channel rides between.
///
/// The TM7 populates a single route; the field exists because the wire
/// protocol reserves room for more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Route {
    /// The system core ↔ application core link.
    #[default]
    Cpu0Cpu1,
}

/// Receive handler: mutate the payload in place (it is echoed back to
/// the sender) and return the result word for the ACK.
pub type RxCallback = Arc<dyn Fn(&mut BytesMut, &IpcRequest<'_>) -> u32 + Send + Sync>;

/// Completion callback for asynchronous sends, given the echoed payload
/// and the remote result word, just before the envelope is freed.
pub type TxDoneCallback = Arc<dyn Fn(&BytesMut, u32) + Send + Sync>;

/// One channel registration.
#[derive(Clone)]
pub struct ChannelConfig {
    pub(crate) name: String,
    pub(crate) route: Route,
    pub(crate) rx: Option<RxCallback>,
    pub(crate) tx_done: Option<TxDoneCallback>,
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("name", &self.name)
            .field("route", &self.route)
            .field("rx", &self.rx.is_some())
            .field("tx_done", &self.tx_done.is_some())
            .finish()
    }
}

impl ChannelConfig {
    /// A registration with no callbacks (pure client side).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            route: Route::Cpu0Cpu1,
            rx: None,
            tx_done: None,
        }
    }

    /// Install the receive handler.
    #[must_use]
    pub fn on_receive(
        mut self,
        f: impl Fn(&mut BytesMut, &IpcRequest<'_>) -> u32 + Send + Sync + 'static,
    ) -> Self {
        self.rx = Some(Arc::new(f));
        self
    }

    /// Install the asynchronous send-done callback.
    #[must_use]
    pub fn on_send_done(mut self, f: impl Fn(&BytesMut, u32) + Send + Sync + 'static) -> Self {
        self.tx_done = Some(Arc::new(f));
        self
    }
}

/// A registered channel bound to a live IPC core.
#[derive(Debug)]
pub(crate) struct ChannelEntry {
    pub(crate) cfg: ChannelConfig,
}

/// Handle for sending on one channel. Created by
/// [`IpcCore::channel`](crate::ipc::IpcCore::channel); never migrates
/// between cores.
#[derive(Clone)]
pub struct IpcChannel {
    pub(crate) entry: Arc<ChannelEntry>,
    pub(crate) shared: Arc<IpcShared>,
}

impl std::fmt::Debug for IpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcChannel")
            .field("name", &self.entry.cfg.name)
            .finish_non_exhaustive()
    }
}

impl IpcChannel {
    /// Channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.entry.cfg.name
    }

    /// Send and block until the remote handler's ACK arrives.
    ///
    /// The wait is **unbounded**: completion is signalled only by the
    /// matching ACK, so a peer that dies mid-call leaves the caller
    /// blocked. This mirrors the transmit path's contract; bound the
    /// risk at a higher layer (liveness supervision) rather than here.
    ///
    /// # Errors
    ///
    /// Transport and lifecycle errors; the remote result word itself is
    /// returned in [`SyncReply`], including reserved codes such as
    /// `RESULT_NO_SUCH_CHANNEL`.
    pub fn send_sync(&self, payload: BytesMut) -> Result<SyncReply> {
        self.shared.send_user(&self.entry, payload, SendMode::Sync)
    }

    /// Queue for transmission and return immediately. The channel's
    /// send-done callback (if any) runs when the ACK is processed.
    ///
    /// # Errors
    ///
    /// Lifecycle errors only; queueing cannot observe the remote side.
    pub fn send_async(&self, payload: BytesMut) -> Result<()> {
        self.shared
            .send_user(&self.entry, payload, SendMode::Async)
            .map(|_| ())
    }
}
