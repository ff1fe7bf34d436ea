use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::slot::{EntryPointSlot, SLOT_COUNT};

/// Invocation counts, one per slot.
///
/// Counts are relaxed atomics so a registry can sit in a `static` next to the
/// [`HostedAllocator`](crate::HostedAllocator). Nothing orders increments
/// against each other across threads.
#[derive(Debug)]
pub struct CounterRegistry {
    counts: [AtomicU64; SLOT_COUNT],
}

impl Default for CounterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterRegistry {
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            counts: [ZERO; SLOT_COUNT],
        }
    }

    #[inline]
    pub fn increment(&self, slot: EntryPointSlot) {
        self.counts[slot.index()].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn read(&self, slot: EntryPointSlot) -> u64 {
        self.counts[slot.index()].load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        for count in &self.counts {
            count.store(0, Ordering::Relaxed);
        }
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn nonzero(&self) -> impl Iterator<Item = (EntryPointSlot, u64)> + '_ {
        EntryPointSlot::ALL
            .into_iter()
            .map(|slot| (slot, self.read(slot)))
            .filter(|(_, count)| *count > 0)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot(
            EntryPointSlot::ALL
                .into_iter()
                .map(|slot| (slot, self.read(slot)))
                .collect(),
        )
    }
}

/// Point-in-time copy of a [`CounterRegistry`], serialized as
/// `{"slot_name": count, ...}` with every slot present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot(pub BTreeMap<EntryPointSlot, u64>);

impl CounterSnapshot {
    pub fn get(&self, slot: EntryPointSlot) -> u64 {
        self.0.get(&slot).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    /// Per-slot difference `self - earlier`, saturating at zero.
    pub fn since(&self, earlier: &CounterSnapshot) -> CounterSnapshot {
        CounterSnapshot(
            self.0
                .iter()
                .map(|(slot, count)| (*slot, count.saturating_sub(earlier.get(*slot))))
                .collect(),
        )
    }
}
