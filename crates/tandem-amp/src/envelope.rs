//! In-flight message envelopes.
//!
//! An [`Envelope`] describes one message in transit: destination channel
//! name, payload, sync/async mode, the result word filled in by the
//! remote side, and the completion signal a synchronous sender blocks
//! on. Envelopes live in an [`EnvelopeTable`] shared by both ends of a
//! link — the stand-in for the shared SRAM both cores address — and the
//! table key travels in `param1` of the mailbox command word.
//!
//! Ownership rule: an envelope is created by the sender, owned by the
//! IPC core while in transit, and *freed exactly once* — by the sender
//! after a synchronous completion, or by the dispatcher's free pass for
//! asynchronous sends. [`EnvelopeTable::remove`] is that free; a second
//! remove of the same key returns `None` and is logged by the caller.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::BytesMut;
use tandem_chip::crc::{crc8_update, CRC8_INIT};

use crate::sync::semaphore::Semaphore;

/// How the sender waits for completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Caller blocks on the envelope until the matching ACK arrives.
    Sync,
    /// Caller returns immediately; the dispatcher transmits and later
    /// frees the envelope when the ACK lands.
    Async,
}

/// One in-flight message.
#[derive(Debug)]
pub struct Envelope {
    channel: String,
    mode: SendMode,
    payload: Mutex<BytesMut>,
    result: AtomicU32,
    /// Set when a handler defers completion (`defer`); suppresses the
    /// dispatcher's immediate ACK.
    deferred: AtomicBool,
    done: Semaphore,
}

impl Envelope {
    /// Create an envelope bound for `channel`.
    pub(crate) fn new(channel: &str, payload: BytesMut, mode: SendMode) -> Arc<Self> {
        Arc::new(Self {
            channel: channel.to_string(),
            mode,
            payload: Mutex::new(payload),
            result: AtomicU32::new(0),
            deferred: AtomicBool::new(false),
            done: Semaphore::binary(),
        })
    }

    /// Destination channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Sender wait mode.
    #[must_use]
    pub fn mode(&self) -> SendMode {
        self.mode
    }

    /// Result word (handler return value, or a reserved code).
    #[must_use]
    pub fn result(&self) -> u32 {
        self.result.load(Ordering::Acquire)
    }

    pub(crate) fn set_result(&self, result: u32) {
        self.result.store(result, Ordering::Release);
    }

    pub(crate) fn mark_deferred(&self) {
        self.deferred.store(true, Ordering::Release);
    }

    pub(crate) fn is_deferred(&self) -> bool {
        self.deferred.load(Ordering::Acquire)
    }

    /// Borrow the payload. Remote handlers mutate it in place; the
    /// transport echoes the buffer back to the sender.
    pub fn payload(&self) -> MutexGuard<'_, BytesMut> {
        self.payload.lock().unwrap()
    }

    /// Take the payload out (sender side, after completion).
    pub(crate) fn take_payload(&self) -> BytesMut {
        std::mem::take(&mut *self.payload.lock().unwrap())
    }

    pub(crate) fn done(&self) -> &Semaphore {
        &self.done
    }

    /// CRC-8 over the framed body: channel name, mode, payload. The
    /// result word is deliberately excluded — the ACK path rewrites it
    /// and recomputes the CRC over the (possibly mutated) body.
    #[must_use]
    pub fn body_crc(&self) -> u8 {
        let mut crc = crc8_update(CRC8_INIT, self.channel.as_bytes());
        crc = crc8_update(crc, &[self.mode as u8]);
        crc8_update(crc, &self.payload.lock().unwrap())
    }
}

// ── Shared table ─────────────────────────────────────────────────────────────

/// Slab of in-flight envelopes shared by both endpoints of a link.
///
/// Keys carry a generation counter, so a stale or double free is
/// detected instead of silently resolving to a recycled slot.
#[derive(Debug, Default)]
pub struct EnvelopeTable {
    slots: Mutex<Slots>,
}

#[derive(Debug, Default)]
struct Slots {
    entries: Vec<Slot>,
    free: Vec<usize>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    env: Option<Arc<Envelope>>,
}

impl EnvelopeTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert an envelope, returning its wire key.
    pub(crate) fn insert(&self, env: Arc<Envelope>) -> u64 {
        let mut slots = self.slots.lock().unwrap();
        let index = match slots.free.pop() {
            Some(i) => {
                slots.entries[i].env = Some(env);
                i
            }
            None => {
                slots.entries.push(Slot {
                    generation: 0,
                    env: Some(env),
                });
                slots.entries.len() - 1
            }
        };
        let generation = slots.entries[index].generation;
        (u64::from(generation) << 32) | index as u64
    }

    /// Look up a live envelope by wire key.
    #[must_use]
    pub fn get(&self, key: u64) -> Option<Arc<Envelope>> {
        let slots = self.slots.lock().unwrap();
        let (index, generation) = split_key(key);
        let slot = slots.entries.get(index)?;
        if slot.generation != generation {
            return None;
        }
        slot.env.clone()
    }

    /// Free an envelope. Returns `None` if the key is stale or was
    /// already freed — the caller logs this as a protocol violation.
    pub(crate) fn remove(&self, key: u64) -> Option<Arc<Envelope>> {
        let mut slots = self.slots.lock().unwrap();
        let (index, generation) = split_key(key);
        let slot = slots.entries.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        let env = slot.env.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        slots.free.push(index);
        Some(env)
    }

    /// Number of live envelopes (diagnostic).
    #[must_use]
    pub fn live(&self) -> usize {
        let slots = self.slots.lock().unwrap();
        slots.entries.iter().filter(|s| s.env.is_some()).count()
    }
}

fn split_key(key: u64) -> (usize, u32) {
    (key as u32 as usize, (key >> 32) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(name: &str, body: &[u8]) -> Arc<Envelope> {
        Envelope::new(name, BytesMut::from(body), SendMode::Sync)
    }

    #[test]
    fn insert_get_remove_round_trip() {
        let table = EnvelopeTable::new();
        let key = table.insert(envelope("ping", b"abc"));
        assert_eq!(table.get(key).unwrap().channel(), "ping");
        assert_eq!(table.live(), 1);
        assert!(table.remove(key).is_some());
        assert_eq!(table.live(), 0);
    }

    #[test]
    fn double_free_detected() {
        let table = EnvelopeTable::new();
        let key = table.insert(envelope("ping", b""));
        assert!(table.remove(key).is_some());
        assert!(table.remove(key).is_none());
        assert!(table.get(key).is_none());
    }

    #[test]
    fn stale_key_rejected_after_slot_reuse() {
        let table = EnvelopeTable::new();
        let first = table.insert(envelope("a", b""));
        table.remove(first).unwrap();
        let second = table.insert(envelope("b", b""));
        // Same slot, new generation.
        assert_ne!(first, second);
        assert!(table.get(first).is_none());
        assert_eq!(table.get(second).unwrap().channel(), "b");
    }

    #[test]
    fn crc_tracks_payload_mutation() {
        let env = envelope("ping", b"hello");
        let before = env.body_crc();
        env.payload()[0] ^= 0x40;
        assert_ne!(env.body_crc(), before);
    }

    #[test]
    fn crc_excludes_result_word() {
        let env = envelope("ping", b"hello");
        let before = env.body_crc();
        env.set_result(0xDEAD_BEEF);
        assert_eq!(env.body_crc(), before);
    }
}
