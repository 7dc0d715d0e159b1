//! Reserved result words.
//!
//! The result word of an acknowledgement normally carries the receiving
//! channel handler's return value, an application-defined `u32`. A few
//! values are reserved by the IPC core itself and must not be used by
//! handlers.

/// Success / no result.
pub const RESULT_OK: u32 = 0;

/// No handler is registered for the destination channel name on the
/// receiving core. Returned in the ACK without invoking any handler.
pub const RESULT_NO_SUCH_CHANNEL: u32 = 0xFFFF_FFFB;

/// The receiving handler could not decode the request payload.
pub const RESULT_BAD_REQUEST: u32 = 0xFFFF_FF01;

/// First value of the range reserved for future IPC-core use.
pub const RESULT_RESERVED_BASE: u32 = 0xFFFF_FF00;

/// True if `result` is reserved by the IPC core.
#[must_use]
pub const fn is_reserved(result: u32) -> bool {
    result >= RESULT_RESERVED_BASE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_range_covers_no_such_channel() {
        assert!(is_reserved(RESULT_NO_SUCH_CHANNEL));
        assert!(!is_reserved(RESULT_OK));
        assert!(!is_reserved(0x7FFF_FFFF));
    }
}
