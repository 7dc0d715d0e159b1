//! Mailbox transport abstraction.
//!
//! The physical mailbox moves one command word (header byte + three
//! parameters) per doorbell ring and raises a completion interrupt once
//! the word has been accepted. This trait is that surface and nothing
//! more; register-level doorbell mechanics are entirely the transport's
//! concern. The IPC core is the sole owner of the reserved IPC channel
//! on whichever transport it is given.
//!
//! `param1` carries the envelope reference. On silicon this is a raw
//! pointer into shared SRAM; the host port passes a key into the shared
//! [`EnvelopeTable`](crate::EnvelopeTable) instead, preserving the
//! same-address-space assumption without pointer casts.

use std::fmt::Debug;
use std::sync::Arc;

use crate::error::Result;

/// One mailbox command word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxCmd {
    /// Packed wire header (see [`tandem_chip::wire::WireHeader`]).
    pub header: u8,
    /// Envelope reference (or a system-state word for SYSTEM messages).
    pub param1: u64,
    /// CRC word for non-SYSTEM messages.
    pub param2: u32,
    /// Reserved.
    pub param3: u32,
}

/// Transport FIFO state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    /// No command words in flight.
    Idle,
    /// At least one command word queued or being delivered.
    Busy,
}

/// Callback invoked on the delivery ("ISR") context for each received
/// command word.
pub type RxHandler = Arc<dyn Fn(MailboxCmd) + Send + Sync>;

/// Callback invoked on the delivery context after a transmitted command
/// word has been accepted by the peer.
pub type TxCompleteHandler = Arc<dyn Fn() + Send + Sync>;

/// One endpoint of a mailbox link.
pub trait MailboxTransport: Debug + Send + Sync {
    /// Transmit one command word.
    ///
    /// # Errors
    ///
    /// Returns [`AmpError::TransportBusy`](crate::AmpError::TransportBusy)
    /// when the FIFO is full; the caller may retry or drop.
    fn write(&self, cmd: MailboxCmd) -> Result<()>;

    /// Install the receive callback.
    fn set_rx_handler(&self, handler: RxHandler);

    /// Install the transmit-complete callback.
    fn set_tx_complete_handler(&self, handler: TxCompleteHandler);

    /// Current FIFO state.
    fn status(&self) -> TransportStatus;
}
