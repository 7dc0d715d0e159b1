//! CRC-8 protecting mailbox message bodies.
//!
//! Polynomial 0x31 (x^8 + x^5 + x^4 + 1), MSB-first, initial value 0xFF,
//! no final XOR — the CRC-8/NRSC-5 parameterisation. The receive path
//! recomputes the CRC over the framed body and silently drops messages
//! that fail the check; there is no NACK or retry in the protocol.
//!
//! An 8-bit CRC cannot catch every corruption: all single-bit errors and
//! all burst errors up to 8 bits are detected, but longer error patterns
//! collide with probability 1/256.

/// Generator polynomial.
pub const CRC8_POLY: u8 = 0x31;

/// Initial remainder.
pub const CRC8_INIT: u8 = 0xFF;

/// Lookup table for one-byte-at-a-time CRC computation.
pub const CRC8_TABLE: [u8; 256] = build_table();

const fn build_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut byte = 0usize;
    while byte < 256 {
        let mut rem = byte as u8;
        let mut bit = 0;
        while bit < 8 {
            rem = if rem & 0x80 != 0 {
                (rem << 1) ^ CRC8_POLY
            } else {
                rem << 1
            };
            bit += 1;
        }
        table[byte] = rem;
        byte += 1;
    }
    table
}

/// Compute the CRC-8 of `data` starting from [`CRC8_INIT`].
#[must_use]
pub fn crc8(data: &[u8]) -> u8 {
    crc8_update(CRC8_INIT, data)
}

/// Continue a CRC-8 computation over an additional slice.
///
/// Lets callers checksum a framed body (header fields, then payload)
/// without concatenating buffers.
#[must_use]
pub fn crc8_update(mut crc: u8, data: &[u8]) -> u8 {
    for &b in data {
        crc = CRC8_TABLE[(crc ^ b) as usize];
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_check_value() {
        // CRC-8/NRSC-5 check value for "123456789".
        assert_eq!(crc8(b"123456789"), 0xF7);
    }

    #[test]
    fn update_matches_single_pass() {
        let data = b"the quick brown fox";
        let split = crc8_update(crc8_update(CRC8_INIT, &data[..7]), &data[7..]);
        assert_eq!(split, crc8(data));
    }

    #[test]
    fn single_bit_flips_always_detected() {
        let base = b"cross-core coordination payload";
        let crc = crc8(base);
        let mut buf = *base;
        for byte in 0..buf.len() {
            for bit in 0..8 {
                buf[byte] ^= 1 << bit;
                assert_ne!(crc8(&buf), crc, "flip at {byte}.{bit} undetected");
                buf[byte] ^= 1 << bit;
            }
        }
    }

    #[test]
    fn empty_input_yields_init() {
        assert_eq!(crc8(&[]), CRC8_INIT);
    }
}
