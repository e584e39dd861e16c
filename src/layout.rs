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

//! Structure-of-arrays byte layout derivation for one archetype's chunks.
//!
//! A layout is derived once per distinct component mask and shared by
//! reference from every chunk of that archetype: it never changes after
//! construction.

use crate::chunk::CHUNK_BYTES;
use crate::component::{ComponentId, ComponentTypeInfo};
use crate::error::{EcsError, Result};
use crate::mask::BitMask;
use crate::utils::align_to;

/// Byte offset and size of one component's array within a chunk.
#[derive(Clone, Copy, Debug)]
pub struct ComponentSlot {
    pub component_id: ComponentId,
    pub base_offset: usize,
    pub size: usize,
    pub align: usize,
}

/// Derived, immutable chunk byte layout for one archetype's component mask.
#[derive(Clone, Debug)]
pub struct ArchetypeLayout<const W: usize> {
    mask: BitMask<W>,
    entities_per_chunk: usize,
    /// Sorted by `component_id` ascending for binary-search lookup.
    slots: Vec<ComponentSlot>,
}

impl<const W: usize> ArchetypeLayout<W> {
    /// Derive the layout for `mask`, given the process-wide component info
    /// table (indexed by dense id). Fails with `MaskOverflow` if the
    /// per-entity row (entity-id strip plus every component) cannot fit
    /// within one 16 KiB chunk even at `entities_per_chunk == 1`.
    pub fn derive(mask: BitMask<W>, infos: &[ComponentTypeInfo]) -> Result<Self> {
        let mut included: Vec<ComponentTypeInfo> = mask
            .iter_set_bits()
            .map(|id| infos[id])
            .collect();

        // Decreasing alignment, ties broken by ascending component id —
        // deterministic regardless of registration order.
        included.sort_by(|a, b| b.align.cmp(&a.align).then(a.id.cmp(&b.id)));

        let per_entity_component_bytes: usize = included.iter().map(|c| c.size).sum();
        let per_entity_total = 4 + per_entity_component_bytes;
        let entities_per_chunk = (CHUNK_BYTES / per_entity_total).max(1);

        let mut offset = 4 * entities_per_chunk;
        let mut slots = Vec::with_capacity(included.len());
        for info in &included {
            if info.size == 0 {
                slots.push(ComponentSlot {
                    component_id: info.id,
                    base_offset: 0,
                    size: 0,
                    align: info.align,
                });
                continue;
            }
            offset = align_to(offset, info.align);
            let base_offset = offset;
            let span = entities_per_chunk
                .checked_mul(info.size)
                .ok_or(EcsError::MaskOverflow)?;
            offset = base_offset.checked_add(span).ok_or(EcsError::MaskOverflow)?;
            slots.push(ComponentSlot {
                component_id: info.id,
                base_offset,
                size: info.size,
                align: info.align,
            });
        }

        if offset > CHUNK_BYTES {
            return Err(EcsError::MaskOverflow);
        }

        slots.sort_by_key(|s| s.component_id);

        Ok(Self {
            mask,
            entities_per_chunk,
            slots,
        })
    }

    pub fn mask(&self) -> BitMask<W> {
        self.mask
    }

    pub fn entities_per_chunk(&self) -> usize {
        self.entities_per_chunk
    }

    /// Byte offset of the entity-id strip (always chunk offset 0).
    pub const fn entity_strip_offset() -> usize {
        0
    }

    fn slot(&self, component_id: ComponentId) -> Option<&ComponentSlot> {
        self.slots
            .binary_search_by_key(&component_id, |s| s.component_id)
            .ok()
            .map(|i| &self.slots[i])
    }

    /// Byte offset of `component_id`'s value at `local_index` within a
    /// chunk. Zero-size (tag) components always resolve to offset 0;
    /// callers must treat them as presence-only.
    pub fn offset_of(&self, component_id: ComponentId, local_index: usize) -> Result<usize> {
        let slot = self.slot(component_id).ok_or(EcsError::MissingComponent)?;
        if slot.size == 0 {
            return Ok(0);
        }
        Ok(slot.base_offset + local_index * slot.size)
    }

    pub fn component_size(&self, component_id: ComponentId) -> Result<usize> {
        Ok(self.slot(component_id).ok_or(EcsError::MissingComponent)?.size)
    }

    pub fn has_component(&self, component_id: ComponentId) -> bool {
        self.slot(component_id).is_some()
    }

    pub fn slots(&self) -> &[ComponentSlot] {
        &self.slots
    }
}
