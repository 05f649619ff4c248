//! Key-state markers guarding populate-versus-invalidate races.
//!
//! A get that misses marks its key before calling the remote map. An
//! invalidation arriving while the call is outstanding flips the mark to
//! `Removed`, and the populate step refuses to write when it sees that.
//!
//! Marks live in a fixed array of slots indexed by the key's partition hash,
//! not in per-key state. Two unrelated keys can share a slot; when that
//! happens the second get simply does not populate, and an invalidation for
//! one key can poison the other key's populate. Both outcomes only cost a
//! later cache miss, never a stale read.
//!
//! # State Transition Diagram
//!
//! ```text
//! Unmarked ── mark_if_unmarked ──→ Marked ── unmark_if_marked ──→ Unmarked
//!                                    │
//!                            remove_if_marked
//!                                    ↓
//!                                 Removed ── unmark_forcibly ──→ Unmarked
//! ```

use std::sync::atomic::{AtomicU8, Ordering};

/// State of one marker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyState {
    Unmarked = 0,
    Marked = 1,
    Removed = 2,
}

impl KeyState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Marked,
            2 => Self::Removed,
            _ => Self::Unmarked,
        }
    }
}

/// Tri-state guard addressed by a key's partition hash.
pub trait KeyStateMarker: Send + Sync + std::fmt::Debug {
    /// `Unmarked → Marked`. Returns whether the transition happened.
    fn mark_if_unmarked(&self, hash: u64) -> bool;

    /// `Marked → Unmarked`. Returns whether the transition happened.
    fn unmark_if_marked(&self, hash: u64) -> bool;

    /// `Marked → Removed`. Returns whether the transition happened.
    fn remove_if_marked(&self, hash: u64) -> bool;

    /// Reset the slot to `Unmarked` whatever its state.
    fn unmark_forcibly(&self, hash: u64);

    /// Reset every slot to `Unmarked`.
    fn unmark_all_forcibly(&self);

    /// Current state of the slot for `hash`.
    fn state(&self, hash: u64) -> KeyState;
}

/// Fixed-size slot array, typically one slot per partition.
#[derive(Debug)]
pub struct StripedKeyStateMarker {
    slots: Box<[AtomicU8]>,
}

impl StripedKeyStateMarker {
    /// Create a marker with `slot_count` slots (at least one).
    pub fn new(slot_count: usize) -> Self {
        let slots = (0..slot_count.max(1))
            .map(|_| AtomicU8::new(KeyState::Unmarked as u8))
            .collect();
        Self { slots }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, hash: u64) -> &AtomicU8 {
        let idx = (hash % self.slots.len() as u64) as usize;
        &self.slots[idx]
    }

    fn cas(&self, hash: u64, from: KeyState, to: KeyState) -> bool {
        self.slot(hash)
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether every slot is `Unmarked`.
    pub fn all_unmarked(&self) -> bool {
        self.slots
            .iter()
            .all(|slot| slot.load(Ordering::Acquire) == KeyState::Unmarked as u8)
    }
}

impl KeyStateMarker for StripedKeyStateMarker {
    fn mark_if_unmarked(&self, hash: u64) -> bool {
        self.cas(hash, KeyState::Unmarked, KeyState::Marked)
    }

    fn unmark_if_marked(&self, hash: u64) -> bool {
        self.cas(hash, KeyState::Marked, KeyState::Unmarked)
    }

    fn remove_if_marked(&self, hash: u64) -> bool {
        self.cas(hash, KeyState::Marked, KeyState::Removed)
    }

    fn unmark_forcibly(&self, hash: u64) {
        self.slot(hash)
            .store(KeyState::Unmarked as u8, Ordering::Release);
    }

    fn unmark_all_forcibly(&self) {
        for slot in self.slots.iter() {
            slot.store(KeyState::Unmarked as u8, Ordering::Release);
        }
    }

    fn state(&self, hash: u64) -> KeyState {
        KeyState::from_u8(self.slot(hash).load(Ordering::Acquire))
    }
}

/// Marker used when invalidate-on-change is off.
///
/// With no invalidations to race against, every transition succeeds and the
/// state always reads `Unmarked`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysSucceedingMarker;

impl KeyStateMarker for AlwaysSucceedingMarker {
    fn mark_if_unmarked(&self, _hash: u64) -> bool {
        true
    }

    fn unmark_if_marked(&self, _hash: u64) -> bool {
        true
    }

    fn remove_if_marked(&self, _hash: u64) -> bool {
        true
    }

    fn unmark_forcibly(&self, _hash: u64) {}

    fn unmark_all_forcibly(&self) {}

    fn state(&self, _hash: u64) -> KeyState {
        KeyState::Unmarked
    }
}
