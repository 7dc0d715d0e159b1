//! Logical mailbox channel assignments and FIFO geometry.
//!
//! The TM7 mailbox block exposes one hardware FIFO per core; software
//! multiplexes logical channels over it. Channel 0 is claimed by the
//! cross-core IPC dispatcher and must not be opened by anything else;
//! the remaining IDs are available to raw-mailbox users (trace, console
//! forwarding).

/// Reserved for the IPC core. All named-channel traffic flows here.
pub const CHANNEL_IPC_SYNC: u8 = 0;

/// Mailbox channel available for console/log forwarding.
pub const CHANNEL_CONSOLE: u8 = 1;

/// Number of logical mailbox channels.
pub const CHANNEL_COUNT: usize = 3;

/// Command-word FIFO depth per core, indexed by core number.
///
/// Core 0 owns the smaller FIFO; it drains its queue from the system
/// image's interrupt path and rarely backs up.
pub const FIFO_DEPTH: [usize; 2] = [2, 4];

/// Default in-flight capacity for software stand-ins for the mailbox
/// FIFO (the loopback transport).
pub const DEFAULT_FIFO_DEPTH: usize = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipc_channel_is_distinct() {
        assert_ne!(CHANNEL_IPC_SYNC, CHANNEL_CONSOLE);
        assert!((CHANNEL_IPC_SYNC as usize) < CHANNEL_COUNT);
    }
}
