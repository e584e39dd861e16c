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

//! Archetype interning and the add/remove archetype graph.
//!
//! `BitMask -> Archetype` identity is single-writer visible:
//! `get_or_create` either returns the archetype already interned
//! for a mask or inserts one, with races resolved by dropping the loser's
//! candidate. Archetype ids are assigned from a monotonic counter.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::archetype::Archetype;
use crate::component::{ComponentId, ComponentTypeInfo};
use crate::error::{EcsError, Result};
use crate::layout::ArchetypeLayout;
use crate::mask::{BitMask, HashedMask};

/// Interns `BitMask -> Archetype` and caches the one-hop add/remove edges
/// between archetypes.
///
/// Insertion is synchronized with a single `RwLock` rather than true
/// per-bucket locks; a `parking_lot::RwLock` over `FxHashMap` gives the
/// same externally
/// observable behavior — many concurrent readers, one writer on insert,
/// racing inserters drop their loser — without hand-rolling a sharded map).
pub struct ArchetypeRegistry<const W: usize> {
    by_mask: RwLock<FxHashMap<HashedMask<W>, u32>>,
    archetypes: RwLock<Vec<Archetype<W>>>,
    next_id: AtomicU32,
    disposed: AtomicBool,
}

impl<const W: usize> ArchetypeRegistry<W> {
    pub fn new() -> Self {
        Self {
            by_mask: RwLock::new(FxHashMap::default()),
            archetypes: RwLock::new(Vec::new()),
            next_id: AtomicU32::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(EcsError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Number of archetypes interned so far.
    pub fn len(&self) -> usize {
        self.archetypes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the archetype interned for `mask`, creating it (with a
    /// freshly derived layout) if this is the first time it's seen.
    pub fn get_or_create(&self, mask: BitMask<W>, infos: &[ComponentTypeInfo]) -> Result<u32> {
        self.check_disposed()?;
        let key = HashedMask::new(mask);

        if let Some(&id) = self.by_mask.read().get(&key) {
            return Ok(id);
        }

        let layout = ArchetypeLayout::derive(mask, infos)?;

        let mut by_mask = self.by_mask.write();
        if let Some(&id) = by_mask.get(&key) {
            // Lost the race: another writer already interned this mask;
            // drop our freshly derived layout and return the winner.
            return Ok(id);
        }

        let mut archetypes = self.archetypes.write();
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        archetypes.push(Archetype::new(id, mask, layout));
        by_mask.insert(key, id);
        Ok(id)
    }

    /// `get_or_create(source.mask | {component_id})`, with the edge cached
    /// on the source archetype for next time.
    pub fn get_or_create_with_add(
        &self,
        source_id: u32,
        component_id: ComponentId,
        infos: &[ComponentTypeInfo],
    ) -> Result<u32> {
        self.check_disposed()?;
        if let Some(target) = self.with_archetype(source_id, |a| a.cached_add_edge(component_id)) {
            return Ok(target);
        }

        let source_mask = self.with_archetype(source_id, |a| a.mask).ok_or(EcsError::OutOfRange)?;
        let target_mask = source_mask.with(component_id as usize)?;
        let target = self.get_or_create(target_mask, infos)?;

        let mut archetypes = self.archetypes.write();
        if let Some(source) = archetypes.get_mut(source_id as usize) {
            source.cache_add_edge(component_id, target);
        }
        Ok(target)
    }

    /// `get_or_create(source.mask \ {component_id})`, with the edge cached.
    pub fn get_or_create_with_remove(
        &self,
        source_id: u32,
        component_id: ComponentId,
        infos: &[ComponentTypeInfo],
    ) -> Result<u32> {
        self.check_disposed()?;
        if let Some(target) = self.with_archetype(source_id, |a| a.cached_remove_edge(component_id)) {
            return Ok(target);
        }

        let source_mask = self.with_archetype(source_id, |a| a.mask).ok_or(EcsError::OutOfRange)?;
        let mut bit_only = BitMask::<W>::empty();
        bit_only.set(component_id as usize)?;
        let target_mask = source_mask.andnot(&bit_only);
        let target = self.get_or_create(target_mask, infos)?;

        let mut archetypes = self.archetypes.write();
        if let Some(source) = archetypes.get_mut(source_id as usize) {
            source.cache_remove_edge(component_id, target);
        }
        Ok(target)
    }

    /// Read-only access to archetype `id` via a closure (keeps the lock
    /// scoped to the call instead of leaking a guard type to callers).
    pub fn with_archetype<R>(&self, id: u32, f: impl FnOnce(&Archetype<W>) -> R) -> Option<R> {
        self.archetypes.read().get(id as usize).map(f)
    }

    /// Snapshot of every archetype's `(id, mask)` pair, in id order. Used by
    /// the query compiler to rescan archetypes created after a query's
    /// cursor.
    pub fn mask_snapshot(&self) -> Vec<(u32, BitMask<W>)> {
        self.archetypes
            .read()
            .iter()
            .map(|a| (a.id, a.mask))
            .collect()
    }
}

impl<const W: usize> Default for ArchetypeRegistry<W> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentRegistry;
    use crate::mask::Mask64;

    #[derive(Clone, Copy)]
    struct Position;
    #[derive(Clone, Copy)]
    struct Velocity;

    fn setup() -> (ComponentRegistry, ArchetypeRegistry<1>, u32, u32) {
        let components = ComponentRegistry::new(64);
        let pos = components.register::<Position>().unwrap();
        let vel = components.register::<Velocity>().unwrap();
        (components, ArchetypeRegistry::new(), pos, vel)
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let (components, registry, pos, _vel) = setup();
        let infos = components.infos();
        let mut mask = Mask64::empty();
        mask.set(pos as usize).unwrap();
        let a = registry.get_or_create(mask, &infos).unwrap();
        let b = registry.get_or_create(mask, &infos).unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn add_edge_reaches_union_mask() {
        let (components, registry, pos, vel) = setup();
        let infos = components.infos();
        let mut mask = Mask64::empty();
        mask.set(pos as usize).unwrap();
        let empty_id = registry.get_or_create(Mask64::empty(), &infos).unwrap();
        let with_pos = registry.get_or_create_with_add(empty_id, pos, &infos).unwrap();
        assert_eq!(with_pos, registry.get_or_create(mask, &infos).unwrap());

        let with_both = registry
            .get_or_create_with_add(with_pos, vel, &infos)
            .unwrap();
        let mut both_mask = mask;
        both_mask.set(vel as usize).unwrap();
        assert_eq!(with_both, registry.get_or_create(both_mask, &infos).unwrap());

        // Cached edge returns the same answer without re-deriving.
        assert_eq!(
            with_pos,
            registry.get_or_create_with_add(empty_id, pos, &infos).unwrap()
        );
    }

    #[test]
    fn remove_edge_inverts_add() {
        let (components, registry, pos, _vel) = setup();
        let infos = components.infos();
        let empty_id = registry.get_or_create(Mask64::empty(), &infos).unwrap();
        let with_pos = registry.get_or_create_with_add(empty_id, pos, &infos).unwrap();
        let back_to_empty = registry
            .get_or_create_with_remove(with_pos, pos, &infos)
            .unwrap();
        assert_eq!(back_to_empty, empty_id);
    }

    #[test]
    fn disposed_registry_rejects_new_interning() {
        let (components, registry, pos, _vel) = setup();
        let infos = components.infos();
        registry.dispose();
        let mut mask = Mask64::empty();
        mask.set(pos as usize).unwrap();
        assert_eq!(registry.get_or_create(mask, &infos), Err(EcsError::Disposed));
    }
}
