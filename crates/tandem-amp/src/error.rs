//! Error types for cross-core coordination operations

use thiserror::Error;

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, AmpError>;

/// Errors that can occur during cross-core coordination
#[derive(Debug, Error)]
pub enum AmpError {
    /// The mailbox FIFO is full; the caller may retry or drop
    #[error("Mailbox transport busy (FIFO full)")]
    TransportBusy,

    /// No channel with this name is registered on the local core
    #[error("No such channel: {name}")]
    NoSuchChannel {
        /// Channel name that failed lookup
        name: String,
    },

    /// A channel with this name is already registered on this route
    #[error("Duplicate channel registration: {name}")]
    DuplicateChannel {
        /// Offending channel name
        name: String,
    },

    /// Resource index out of range
    #[error("Invalid resource id {id} (have {count} resources)")]
    InvalidResource {
        /// Requested resource index
        id: u16,
        /// Number of configured resources
        count: u16,
    },

    /// The subsystem has not been initialized (or has shut down)
    #[error("Not initialized: {what}")]
    NotInitialized {
        /// Subsystem that was not ready
        what: &'static str,
    },

    /// A bounded wait elapsed
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// A blocking API was called from a context that must not block
    /// (mailbox delivery context, or before the node threads run)
    #[error("Blocking call from non-preemptible context: {what}")]
    NonPreemptibleContext {
        /// Description of the rejected call site
        what: &'static str,
    },

    /// The companion core is shut down or has never announced startup
    #[error("Peer core cpu{core} unavailable")]
    PeerUnavailable {
        /// Core number of the unavailable peer
        core: u8,
    },

    /// A received command word carried an undecodable header byte
    #[error("Invalid wire header byte 0x{byte:02x}")]
    InvalidHeader {
        /// Raw header byte
        byte: u8,
    },

    /// The spinlock pool has no free entries
    #[error("Spinlock pool exhausted")]
    PoolExhausted,

    /// Attempted to free a pool lock that is currently held
    #[error("Lock still held (owner cpu{owner})")]
    LockHeld {
        /// Core currently holding the lock
        owner: u8,
    },

    /// The local dispatcher is shutting down
    #[error("IPC core shut down")]
    Shutdown,

    /// Malformed RPC payload
    #[error("RPC decode failed: {reason}")]
    RpcDecode {
        /// Reason for failure
        reason: String,
    },
}

impl AmpError {
    /// Create a no-such-channel error
    pub fn no_such_channel(name: impl Into<String>) -> Self {
        Self::NoSuchChannel { name: name.into() }
    }

    /// Create a duplicate-channel error
    pub fn duplicate_channel(name: impl Into<String>) -> Self {
        Self::DuplicateChannel { name: name.into() }
    }

    /// Create a timeout error from a duration
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Create an RPC decode error
    pub fn rpc_decode(reason: impl Into<String>) -> Self {
        Self::RpcDecode {
            reason: reason.into(),
        }
    }
}
