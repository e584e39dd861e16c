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

//! One composition's chunk storage.
//!
//! An `Archetype` owns the ordered [`ChunkHandle`]s
//! backing every entity sharing its mask, plus the add/remove edge caches
//! the registry populates lazily.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use rustc_hash::FxHashMap;

use crate::append_list::AppendList;
use crate::chunk::{ChunkAllocator, ChunkHandle};
use crate::component::ComponentId;
use crate::entity::EntityHandle;
use crate::error::{EcsError, Result};
use crate::layout::ArchetypeLayout;
use crate::mask::BitMask;

/// Byte width of the entity-id strip entry at the head of every chunk.
const ENTITY_ID_BYTES: usize = 4;

/// One composition's runtime storage: a dense, append-only list of chunks
/// plus the live-slot counter and lazily-populated one-hop edges.
pub struct Archetype<const W: usize> {
    pub id: u32,
    pub mask: BitMask<W>,
    pub layout: ArchetypeLayout<W>,
    chunks: AppendList<ChunkHandle>,
    live_count: AtomicU64,
    /// Guards the boundary CAS in `allocate_slot` when `g` crosses into a
    /// fresh chunk, so two racing allocators at the same boundary don't
    /// both append a chunk.
    chunk_append_guard: AtomicU32,
    edges_add: FxHashMap<ComponentId, u32>,
    edges_remove: FxHashMap<ComponentId, u32>,
}

/// Where an entity landed after [`Archetype::allocate_slot`].
#[derive(Debug, Clone, Copy)]
pub struct SlotLocation {
    pub global_slot: u32,
    pub chunk_index: usize,
    pub local_index: usize,
}

impl<const W: usize> Archetype<W> {
    pub fn new(id: u32, mask: BitMask<W>, layout: ArchetypeLayout<W>) -> Self {
        Self {
            id,
            mask,
            layout,
            chunks: AppendList::new(),
            live_count: AtomicU64::new(0),
            chunk_append_guard: AtomicU32::new(0),
            edges_add: FxHashMap::default(),
            edges_remove: FxHashMap::default(),
        }
    }

    pub fn live_count(&self) -> u64 {
        self.live_count.load(Ordering::Acquire)
    }

    fn epc(&self) -> usize {
        self.layout.entities_per_chunk()
    }

    pub(crate) fn chunk_handle(&self, chunk_index: usize) -> Option<ChunkHandle> {
        self.chunks.get(chunk_index).copied()
    }

    fn split(&self, global_slot: u64) -> (usize, usize) {
        let epc = self.epc() as u64;
        ((global_slot / epc) as usize, (global_slot % epc) as usize)
    }

    /// Reserve the next global slot, allocating a new chunk if this slot
    /// starts one, and stamp the entity-id strip. Returns the resulting
    /// location.
    pub fn allocate_slot(
        &self,
        allocator: &ChunkAllocator,
        entity: EntityHandle,
    ) -> Result<SlotLocation> {
        let global_slot = self.live_count.fetch_add(1, Ordering::AcqRel);
        let (chunk_index, local_index) = self.split(global_slot);

        if local_index == 0 {
            // First slot of a fresh chunk: a CAS on the boundary guard
            // decides exactly one caller appends chunk `chunk_index`, so
            // `AppendList::add` is called in chunk order even though
            // multiple threads can race to cross the same boundary.
            loop {
                match self.chunk_append_guard.compare_exchange(
                    chunk_index as u32,
                    chunk_index as u32 + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        let handle = allocator.allocate()?;
                        let appended_at = self.chunks.add(handle);
                        debug_assert_eq!(appended_at, chunk_index);
                        break;
                    }
                    Err(observed) if observed as usize > chunk_index => break,
                    Err(_) => std::hint::spin_loop(),
                }
            }
        } else {
            // Wait for the slot-0 allocator of this chunk to publish it.
            while self.chunks.get(chunk_index).is_none() {
                std::hint::spin_loop();
            }
        }

        let handle = self.chunk_handle(chunk_index).expect("chunk just published");
        self.write_entity_id(allocator, handle, local_index, entity);

        Ok(SlotLocation {
            global_slot: global_slot as u32,
            chunk_index,
            local_index,
        })
    }

    fn write_entity_id(
        &self,
        allocator: &ChunkAllocator,
        handle: ChunkHandle,
        local_index: usize,
        entity: EntityHandle,
    ) {
        let bytes = unsafe {
            allocator
                .get_bytes_mut(handle)
                .expect("freshly-allocated chunk handle must still be valid")
        };
        let offset = local_index * ENTITY_ID_BYTES;
        bytes[offset..offset + ENTITY_ID_BYTES].copy_from_slice(&entity.id.to_le_bytes());
    }

    /// Entity id stored at `global_slot`'s strip position.
    pub fn entity_at(&self, allocator: &ChunkAllocator, global_slot: u32) -> Option<u32> {
        let (chunk_index, local_index) = self.split(global_slot as u64);
        let handle = self.chunk_handle(chunk_index)?;
        let bytes = allocator.get_bytes(handle)?;
        let offset = local_index * ENTITY_ID_BYTES;
        Some(u32::from_le_bytes(
            bytes[offset..offset + ENTITY_ID_BYTES].try_into().unwrap(),
        ))
    }

    /// Byte offset and backing chunk for `component_id` at `global_slot`.
    pub fn component_bytes<'a>(
        &self,
        allocator: &'a ChunkAllocator,
        global_slot: u32,
        component_id: ComponentId,
    ) -> Result<(&'a [u8], usize, usize)> {
        let (chunk_index, local_index) = self.split(global_slot as u64);
        let handle = self
            .chunk_handle(chunk_index)
            .ok_or(EcsError::OutOfRange)?;
        let bytes = allocator.get_bytes(handle).ok_or(EcsError::OutOfRange)?;
        let offset = self.layout.offset_of(component_id, local_index)?;
        let size = self.layout.component_size(component_id)?;
        Ok((bytes, offset, size))
    }

    /// Mutable byte offset and backing chunk for `component_id` at `global_slot`.
    pub fn component_bytes_mut<'a>(
        &self,
        allocator: &'a ChunkAllocator,
        global_slot: u32,
        component_id: ComponentId,
    ) -> Result<(&'a mut [u8], usize, usize)> {
        let (chunk_index, local_index) = self.split(global_slot as u64);
        let handle = self
            .chunk_handle(chunk_index)
            .ok_or(EcsError::OutOfRange)?;
        let bytes = unsafe {
            allocator
                .get_bytes_mut(handle)
                .ok_or(EcsError::OutOfRange)?
        };
        let offset = self.layout.offset_of(component_id, local_index)?;
        let size = self.layout.component_size(component_id)?;
        Ok((bytes, offset, size))
    }

    /// Swap-and-pop removal of `global_slot`. Returns the id of the entity
    /// that was moved into the vacated slot, if any (the caller must
    /// update that entity's `EntityIndex` record).
    pub fn remove_slot(
        &self,
        allocator: &ChunkAllocator,
        global_slot: u32,
    ) -> Result<Option<(u32, u32)>> {
        let last = self.live_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if global_slot as u64 == last {
            return Ok(None);
        }

        for slot in self.layout.slots() {
            if slot.size == 0 {
                continue;
            }
            let (src_bytes, src_offset, size) =
                self.component_bytes(allocator, last as u32, slot.component_id)?;
            let mut tmp = vec![0u8; size];
            tmp.copy_from_slice(&src_bytes[src_offset..src_offset + size]);
            let (dst_bytes, dst_offset, _) =
                self.component_bytes_mut(allocator, global_slot, slot.component_id)?;
            dst_bytes[dst_offset..dst_offset + size].copy_from_slice(&tmp);
        }

        let moved_entity_id = self
            .entity_at(allocator, last as u32)
            .ok_or(EcsError::OutOfRange)?;
        let (chunk_index, local_index) = self.split(global_slot as u64);
        let handle = self.chunk_handle(chunk_index).ok_or(EcsError::OutOfRange)?;
        self.write_entity_id(
            allocator,
            handle,
            local_index,
            EntityHandle {
                id: moved_entity_id,
                version: 0,
            },
        );

        // Releasing a now-empty trailing chunk back to the allocator is
        // deliberately skipped: `AppendList` cannot un-append a chunk handle
        // once published, so this leaves the trailing chunk allocated rather
        // than adding reclaim bookkeeping for a case that never requires it
        // for correctness.
        Ok(Some((moved_entity_id, global_slot)))
    }

    pub fn cached_add_edge(&self, component_id: ComponentId) -> Option<u32> {
        self.edges_add.get(&component_id).copied()
    }

    pub fn cached_remove_edge(&self, component_id: ComponentId) -> Option<u32> {
        self.edges_remove.get(&component_id).copied()
    }

    /// Populate the add-edge cache. Caller (the registry) is the sole writer
    /// during `get_or_create_with_add`, which already serializes concurrent
    /// creators of the same edge through its own interning lock.
    pub fn cache_add_edge(&mut self, component_id: ComponentId, target: u32) {
        self.edges_add.insert(component_id, target);
    }

    pub fn cache_remove_edge(&mut self, component_id: ComponentId, target: u32) {
        self.edges_remove.insert(component_id, target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentRegistry;
    use crate::mask::Mask64;

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    fn build() -> (ChunkAllocator, Archetype<1>, ComponentId) {
        let reg = ComponentRegistry::new(64);
        let pos = reg.register::<Position>().unwrap();
        let infos = reg.infos();
        let mut mask = Mask64::empty();
        mask.set(pos as usize).unwrap();
        let layout = ArchetypeLayout::derive(mask, &infos).unwrap();
        (ChunkAllocator::new(), Archetype::new(0, mask, layout), pos)
    }

    #[test]
    fn allocate_slot_writes_entity_id() {
        let (allocator, archetype, _pos) = build();
        let e = EntityHandle { id: 7, version: 1 };
        let loc = archetype.allocate_slot(&allocator, e).unwrap();
        assert_eq!(
            archetype.entity_at(&allocator, loc.global_slot),
            Some(7)
        );
    }

    #[test]
    fn remove_last_slot_is_plain_drop() {
        let (allocator, archetype, _pos) = build();
        let e = EntityHandle { id: 1, version: 1 };
        let loc = archetype.allocate_slot(&allocator, e).unwrap();
        let moved = archetype.remove_slot(&allocator, loc.global_slot).unwrap();
        assert!(moved.is_none());
        assert_eq!(archetype.live_count(), 0);
    }

    #[test]
    fn swap_and_pop_preserves_other_entities() {
        let (allocator, archetype, pos) = build();
        let e1 = EntityHandle { id: 1, version: 1 };
        let e2 = EntityHandle { id: 2, version: 1 };
        let e3 = EntityHandle { id: 3, version: 1 };

        let loc1 = archetype.allocate_slot(&allocator, e1).unwrap();
        let loc2 = archetype.allocate_slot(&allocator, e2).unwrap();
        let loc3 = archetype.allocate_slot(&allocator, e3).unwrap();

        for (loc, x) in [(loc1, 1.0f32), (loc2, 2.0), (loc3, 3.0)] {
            let (bytes, offset, size) = archetype
                .component_bytes_mut(&allocator, loc.global_slot, pos)
                .unwrap();
            let value = Position { x, y: 0.0 };
            let src = unsafe {
                std::slice::from_raw_parts(&value as *const _ as *const u8, size)
            };
            bytes[offset..offset + size].copy_from_slice(src);
        }

        let moved = archetype.remove_slot(&allocator, loc2.global_slot).unwrap();
        assert_eq!(moved, Some((3, loc2.global_slot)));
        assert_eq!(archetype.entity_at(&allocator, loc2.global_slot), Some(3));

        let (bytes, offset, size) = archetype
            .component_bytes(&allocator, loc1.global_slot, pos)
            .unwrap();
        let read: Position = unsafe { std::ptr::read(bytes[offset..offset + size].as_ptr() as *const Position) };
        assert_eq!(read, Position { x: 1.0, y: 0.0 });

        let (bytes, offset, size) = archetype
            .component_bytes(&allocator, loc2.global_slot, pos)
            .unwrap();
        let read: Position = unsafe { std::ptr::read(bytes[offset..offset + size].as_ptr() as *const Position) };
        assert_eq!(read, Position { x: 3.0, y: 0.0 });
    }
}
