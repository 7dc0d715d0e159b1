//! Cross-core coordination library for the Tandem TM7 dual-core SoC.
//!
//! The TM7 runs an independent firmware image on each core (AMP); the
//! cores coordinate exclusively through a one-word-at-a-time mailbox.
//! This crate is the full coordination stack above that mailbox:
//!
//! ```text
//! application code
//!   ├── rpc        typed request/response ("get device unique id", …)
//!   ├── reslock    exclusive use of shared peripherals, with timeout
//!   └── heartbeat  liveness supervision → reset escalation
//!         │
//!       ipc        named channels, sync/async sends, CRC-8 framing
//!         │
//!     transport    mailbox seam (loopback pair on the host)
//!         │
//!       sync       spinlock / semaphore / event set
//! ```
//!
//! Each simulated core is a [`Node`]; two nodes joined by a
//! [`LoopbackTransport`] pair exercise the entire stack on a host with
//! no silicon.
//!
//! # Quick start
//!
//! ```no_run
//! use bytes::BytesMut;
//! use tandem_amp::prelude::*;
//! use tandem_chip::cpu::CoreId;
//!
//! # fn main() -> tandem_amp::Result<()> {
//! let (t0, t1) = LoopbackTransport::pair();
//! let shared_ram = EnvelopeTable::new();
//!
//! let cfg = NodeConfig::system_core(0xD1E_0001).channel(
//!     ChannelConfig::new("ping").on_receive(|payload, _req| {
//!         payload[0] += 1;
//!         0
//!     }),
//! );
//! let cpu0 = Node::init(cfg, t0, shared_ram.clone())?;
//!
//! let cfg = NodeConfig::new(CoreId::CPU1).channel(ChannelConfig::new("ping"));
//! let cpu1 = Node::init(cfg, t1, shared_ram)?;
//!
//! let reply = cpu1.channel("ping")?.send_sync(BytesMut::from(&[41u8][..]))?;
//! assert_eq!(reply.payload[0], 42);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod channel;
mod envelope;
mod error;
pub mod heartbeat;
pub mod ipc;
pub mod node;
pub mod reslock;
pub mod rpc;
pub mod sync;
pub mod transport;
pub mod transports;

pub use channel::{ChannelConfig, IpcChannel, Route};
pub use envelope::{Envelope, EnvelopeTable, SendMode};
pub use error::{AmpError, Result};
pub use heartbeat::{Beacon, CoreState, Supervisor, SupervisorConfig};
pub use ipc::{DeferredReply, IpcBuilder, IpcCore, IpcRequest, SyncReply};
pub use node::{Node, NodeConfig};
pub use reslock::{ReqCounts, ResourceId, ResourceLock};
pub use rpc::{DeviceId, RpcClient, RpcMessage};
pub use sync::spinlock::{CoreToken, RawSpinlock, SpinGuard, Spinlock, SpinlockPool};
pub use transport::{MailboxCmd, MailboxTransport, TransportStatus};
pub use transports::loopback::LoopbackTransport;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        AmpError, ChannelConfig, CoreToken, EnvelopeTable, IpcChannel, LoopbackTransport, Node,
        NodeConfig, RawSpinlock, Result, RpcClient, Spinlock, Supervisor, SupervisorConfig,
    };
}
