// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Entity handles and the packed, atomically-updated location table.
//!
//! An [`EntityHandle`] is a (id, version) pair;
//! the [`EntityIndex`] maps id to a packed `(version, archetype, slot)`
//! triple that a single 64-bit compare-and-exchange can retarget, so a
//! migration never needs to lock the index.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::SegQueue;

use crate::append_list::AppendList;

const VERSION_BITS: u32 = 24;
const ARCHETYPE_BITS: u32 = 20;
const SLOT_BITS: u32 = 20;
const VERSION_MASK: u64 = (1u64 << VERSION_BITS) - 1;
const ARCHETYPE_MASK: u64 = (1u64 << ARCHETYPE_BITS) - 1;
const SLOT_MASK: u64 = (1u64 << SLOT_BITS) - 1;

/// Upper bound on both archetype id and global slot index the packed
/// 64-bit `EntityLocation` can address.
pub const MAX_ARCHETYPE_ID: u32 = ARCHETYPE_MASK as u32 - 1;
pub const MAX_SLOT: u32 = SLOT_MASK as u32 - 1;

/// A 64-bit (id, version) pair. Version 0 denotes never-alive; all spawns
/// start at version 1. Equality is bitwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityHandle {
    pub id: u32,
    pub version: u32,
}

impl EntityHandle {
    pub const INVALID: EntityHandle = EntityHandle { id: 0, version: 0 };

    pub fn to_bits(self) -> u64 {
        (self.id as u64) << 32 | self.version as u64
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            id: (bits >> 32) as u32,
            version: bits as u32,
        }
    }
}

/// Unpacked form of the 64-bit location word: 24-bit version, 20-bit
/// archetype-id+1 (0 = not placed), 20-bit slot+1 (0 = not placed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    pub version: u32,
    pub archetype_id: Option<u32>,
    pub slot: Option<u32>,
}

impl EntityLocation {
    const fn pack(self) -> u64 {
        let version = (self.version as u64) & VERSION_MASK;
        let archetype = match self.archetype_id {
            Some(id) => (id as u64 + 1) & ARCHETYPE_MASK,
            None => 0,
        };
        let slot = match self.slot {
            Some(s) => (s as u64 + 1) & SLOT_MASK,
            None => 0,
        };
        version | (archetype << VERSION_BITS) | (slot << (VERSION_BITS + ARCHETYPE_BITS))
    }

    const fn unpack(bits: u64) -> Self {
        let version = (bits & VERSION_MASK) as u32;
        let archetype_raw = (bits >> VERSION_BITS) & ARCHETYPE_MASK;
        let slot_raw = (bits >> (VERSION_BITS + ARCHETYPE_BITS)) & SLOT_MASK;
        Self {
            version,
            archetype_id: if archetype_raw == 0 {
                None
            } else {
                Some((archetype_raw - 1) as u32)
            },
            slot: if slot_raw == 0 {
                None
            } else {
                Some((slot_raw - 1) as u32)
            },
        }
    }

    const fn unplaced(version: u32) -> Self {
        Self {
            version,
            archetype_id: None,
            slot: None,
        }
    }
}

/// Packed `(version, archetype-id, slot)` per entity, stored in an
/// `AppendList<AtomicU64>` so any thread can retarget a live entity's
/// location with a single CAS (no lock, no indirection through a growable
/// `Vec`).
pub struct EntityIndex {
    locations: AppendList<AtomicU64>,
    free_ids: SegQueue<u32>,
}

impl EntityIndex {
    pub fn new() -> Self {
        Self {
            locations: AppendList::new(),
            free_ids: SegQueue::new(),
        }
    }

    /// Allocate a fresh handle: reuse a destroyed id's slot (bumping its
    /// version) or append a new one at version 1.
    pub fn spawn(&self) -> EntityHandle {
        if let Some(id) = self.free_ids.pop() {
            let slot = self
                .locations
                .get(id as usize)
                .expect("freed id must already be published");
            let next_version =
                next_nonzero_version(EntityLocation::unpack(slot.load(Ordering::Acquire)).version);
            slot.store(EntityLocation::unplaced(next_version).pack(), Ordering::Release);
            return EntityHandle {
                id,
                version: next_version,
            };
        }

        let id = self
            .locations
            .add(AtomicU64::new(EntityLocation::unplaced(1).pack()));
        EntityHandle {
            id: id as u32,
            version: 1,
        }
    }

    fn current(&self, id: u32) -> Option<&AtomicU64> {
        self.locations.get(id as usize)
    }

    /// True iff `handle`'s version matches the index's current record.
    pub fn is_alive(&self, handle: EntityHandle) -> bool {
        match self.current(handle.id) {
            Some(slot) => {
                EntityLocation::unpack(slot.load(Ordering::Acquire)).version == handle.version
            }
            None => false,
        }
    }

    /// Current `(archetype_id, slot)` for a live entity, or `None` if the
    /// handle is stale or the entity has never been placed.
    pub fn location(&self, handle: EntityHandle) -> Option<(u32, u32)> {
        let slot = self.current(handle.id)?;
        let loc = EntityLocation::unpack(slot.load(Ordering::Acquire));
        if loc.version != handle.version {
            return None;
        }
        Some((loc.archetype_id?, loc.slot?))
    }

    /// The handle currently recorded for `id`, whatever its version is.
    /// Used internally by archetype swap-and-pop bookkeeping, which learns
    /// a moved entity's *id* from the archetype's entity-id strip and must
    /// retarget its location without a caller-supplied handle.
    pub(crate) fn current_handle(&self, id: u32) -> Option<EntityHandle> {
        let slot = self.current(id)?;
        let loc = EntityLocation::unpack(slot.load(Ordering::Acquire));
        Some(EntityHandle {
            id,
            version: loc.version,
        })
    }

    /// Retarget a live entity to `(archetype_id, slot)` via CAS, retrying
    /// against concurrent updates as long as the version still matches.
    /// Returns `false` if `handle` is stale.
    pub fn set_location(&self, handle: EntityHandle, archetype_id: u32, slot_index: u32) -> bool {
        let Some(cell) = self.current(handle.id) else {
            return false;
        };
        loop {
            let current = cell.load(Ordering::Acquire);
            let unpacked = EntityLocation::unpack(current);
            if unpacked.version != handle.version {
                return false;
            }
            let next = EntityLocation {
                version: unpacked.version,
                archetype_id: Some(archetype_id),
                slot: Some(slot_index),
            }
            .pack();
            if cell
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Invalidate `handle`: bump its version (skipping zero) and clear its
    /// placement. Future `is_alive` on `handle` return false. The id is
    /// returned to the free list for reuse under a fresh handle.
    pub fn destroy(&self, handle: EntityHandle) -> bool {
        let Some(cell) = self.current(handle.id) else {
            return false;
        };
        loop {
            let current = cell.load(Ordering::Acquire);
            let unpacked = EntityLocation::unpack(current);
            if unpacked.version != handle.version {
                return false;
            }
            let next_version = next_nonzero_version(unpacked.version);
            let next = EntityLocation::unplaced(next_version).pack();
            if cell
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.free_ids.push(handle.id);
                return true;
            }
        }
    }
}

impl Default for EntityIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
const fn next_nonzero_version(current: u32) -> u32 {
    let next = (current + 1) & VERSION_MASK as u32;
    if next == 0 {
        1
    } else {
        next
    }
}
