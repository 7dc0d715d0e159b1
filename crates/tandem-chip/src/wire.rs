//! Mailbox wire header.
//!
//! Every mailbox command word carries a one-byte header:
//!
//! ```text
//!   bit 7        3 2      0
//!   +------------+--------+
//!   |  type (5)  | src(3) |
//!   +------------+--------+
//! ```
//!
//! `src` is the sending core; `type` distinguishes commands from
//! acknowledgements and system notifications. Type 0 is reserved and is
//! rejected on decode.

use crate::cpu::CoreId;

/// Message type carried in the 5-bit `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    /// A command carrying an envelope to a named channel.
    Command = 1,
    /// Acknowledgement completing a previously sent command.
    Ack = 2,
    /// Core state notification (startup/shutdown); no envelope.
    System = 3,
}

impl MsgType {
    /// Decode the 5-bit type field. Returns `None` for reserved values.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(Self::Command),
            2 => Some(Self::Ack),
            3 => Some(Self::System),
            _ => None,
        }
    }
}

/// Decoded wire header: source core plus message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    /// Core that transmitted the message.
    pub source: CoreId,
    /// Message type.
    pub msg_type: MsgType,
}

impl WireHeader {
    /// Build a header.
    #[must_use]
    pub const fn new(source: CoreId, msg_type: MsgType) -> Self {
        Self { source, msg_type }
    }

    /// Pack into the one-byte wire form.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        self.source.index() | ((self.msg_type as u8) << 3)
    }

    /// Unpack from the one-byte wire form.
    ///
    /// Returns `None` if the type field holds a reserved value.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        let source = match CoreId::new(byte & 0x07) {
            Some(c) => c,
            None => return None,
        };
        match MsgType::from_bits(byte >> 3) {
            Some(msg_type) => Some(Self { source, msg_type }),
            None => None,
        }
    }
}

/// System-message state words carried in `param1` of a [`MsgType::System`]
/// message (these messages carry no envelope).
pub mod sys_state {
    /// The sending core is about to power down.
    pub const SHUTDOWN: u64 = 0;
    /// The sending core has booted and its IPC dispatcher is running.
    pub const STARTUP: u64 = 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        for core in [CoreId::CPU0, CoreId::CPU1] {
            for ty in [MsgType::Command, MsgType::Ack, MsgType::System] {
                let h = WireHeader::new(core, ty);
                assert_eq!(WireHeader::from_byte(h.to_byte()), Some(h));
            }
        }
    }

    #[test]
    fn reserved_type_rejected() {
        // type field = 0 (reserved)
        assert_eq!(WireHeader::from_byte(0x00), None);
        assert_eq!(WireHeader::from_byte(0x05), None);
        // type field > 3 (unassigned)
        assert_eq!(WireHeader::from_byte(4 << 3), None);
        assert_eq!(WireHeader::from_byte(0x1F << 3), None);
    }

    #[test]
    fn source_occupies_low_bits() {
        let h = WireHeader::new(CoreId::CPU1, MsgType::Command);
        assert_eq!(h.to_byte() & 0x07, 1);
        assert_eq!(h.to_byte() >> 3, 1);
    }
}
