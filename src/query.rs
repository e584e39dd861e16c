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

//! Mask-constraint query compiler.
//!
//! A [`QueryDescription`] compiles against the
//! [`ArchetypeRegistry`] into a [`Query`] that caches its matching
//! archetype ids and lazily extends that list as new archetypes are
//! interned. Iteration yields chunk-level views rather than typed
//! component fetches — typed fetch is source-generated/reflective
//! plumbing that lives outside this storage core.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::archetype::Archetype;
use crate::chunk::{ChunkAllocator, ChunkHandle};
use crate::mask::BitMask;
use crate::registry::ArchetypeRegistry;

/// The `{all, none, any}` constraint triple a query compiles from.
///
/// A mask `M` matches iff `M ⊇ all ∧ M ∩ none = ∅ ∧ (any.is_empty() ∨ M ∩ any ≠ ∅)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryDescription<const W: usize> {
    pub all: BitMask<W>,
    pub none: BitMask<W>,
    pub any: BitMask<W>,
}

impl<const W: usize> QueryDescription<W> {
    pub fn builder() -> QueryBuilder<W> {
        QueryBuilder::new()
    }

    /// True iff `mask` satisfies this description's predicate.
    pub fn matches(&self, mask: BitMask<W>) -> bool {
        if !mask.contains_all(&self.all) {
            return false;
        }
        if mask.contains_any(&self.none) {
            return false;
        }
        if !self.any.is_empty() && !mask.contains_any(&self.any) {
            return false;
        }
        true
    }

    /// An `all ∩ none` overlap can never match anything; such a query
    /// compiles to an always-empty result.
    pub fn is_degenerate(&self) -> bool {
        self.all.contains_any(&self.none)
    }
}

/// Fluent builder for a [`QueryDescription`]. Repeated calls with the same
/// bit are idempotent (`BitMask::set` is itself idempotent).
#[derive(Clone, Copy, Debug)]
pub struct QueryBuilder<const W: usize> {
    all: BitMask<W>,
    none: BitMask<W>,
    any: BitMask<W>,
}

impl<const W: usize> QueryBuilder<W> {
    pub fn new() -> Self {
        Self {
            all: BitMask::empty(),
            none: BitMask::empty(),
            any: BitMask::empty(),
        }
    }

    pub fn all(mut self, mask: BitMask<W>) -> Self {
        self.all = self.all.or(&mask);
        self
    }

    pub fn none(mut self, mask: BitMask<W>) -> Self {
        self.none = self.none.or(&mask);
        self
    }

    pub fn any(mut self, mask: BitMask<W>) -> Self {
        self.any = self.any.or(&mask);
        self
    }

    pub fn build(self) -> QueryDescription<W> {
        QueryDescription {
            all: self.all,
            none: self.none,
            any: self.any,
        }
    }
}

impl<const W: usize> Default for QueryBuilder<W> {
    fn default() -> Self {
        Self::new()
    }
}

/// One chunk's worth of a matched archetype: enough to locate its bytes
/// through the allocator and to know how many of its slots are live.
#[derive(Debug, Clone, Copy)]
pub struct ChunkView {
    pub archetype_id: u32,
    pub chunk_index: usize,
    pub handle: ChunkHandle,
    /// Number of live entities in this chunk (the trailing chunk of an
    /// archetype may be partially filled).
    pub len: usize,
}

/// A compiled query: the description plus a monotone-growing cache of
/// matching archetype ids. New archetypes created after `build` are
/// observed lazily the next time the query is iterated.
pub struct Query<'a, const W: usize> {
    description: QueryDescription<W>,
    registry: &'a ArchetypeRegistry<W>,
    matched: RwLock<Vec<u32>>,
    cursor: AtomicUsize,
}

impl<'a, const W: usize> Query<'a, W> {
    pub fn compile(description: QueryDescription<W>, registry: &'a ArchetypeRegistry<W>) -> Self {
        let query = Self {
            description,
            registry,
            matched: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        };
        query.rescan();
        query
    }

    /// Extend the matched-archetype cache over any archetypes interned
    /// since the last scan.
    fn rescan(&self) {
        if self.description.is_degenerate() {
            self.cursor.store(self.registry.len(), Ordering::Release);
            return;
        }

        let snapshot = self.registry.mask_snapshot();
        let start = self.cursor.load(Ordering::Acquire);
        if start >= snapshot.len() {
            return;
        }

        let mut fresh = Vec::new();
        for (id, mask) in &snapshot[start..] {
            if self.description.matches(*mask) {
                fresh.push(*id);
            }
        }
        if !fresh.is_empty() {
            self.matched.write().unwrap().extend(fresh);
        }
        self.cursor.store(snapshot.len(), Ordering::Release);
    }

    /// Ids of every archetype this query currently matches, including any
    /// created since the last call (rescans first).
    pub fn matched_archetypes(&self) -> Vec<u32> {
        self.rescan();
        self.matched.read().unwrap().clone()
    }

    /// Visit each matched archetype's chunks as [`ChunkView`]s.
    pub fn iter_chunks(&self, allocator: &ChunkAllocator) -> Vec<ChunkView> {
        let mut views = Vec::new();
        for archetype_id in self.matched_archetypes() {
            self.registry.with_archetype(archetype_id, |archetype| {
                views.extend(chunk_views_for(archetype, allocator));
            });
        }
        views
    }
}

fn chunk_views_for<const W: usize>(
    archetype: &Archetype<W>,
    _allocator: &ChunkAllocator,
) -> Vec<ChunkView> {
    let live = archetype.live_count() as usize;
    let epc = archetype.layout.entities_per_chunk();
    if live == 0 {
        return Vec::new();
    }
    let chunk_count = live.div_ceil(epc);
    let mut views = Vec::with_capacity(chunk_count);
    for chunk_index in 0..chunk_count {
        let Some(handle) = archetype.chunk_handle(chunk_index) else {
            continue;
        };
        let start = chunk_index * epc;
        let len = live.saturating_sub(start).min(epc);
        views.push(ChunkView {
            archetype_id: archetype.id,
            chunk_index,
            handle,
            len,
        });
    }
    views
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentRegistry;
    use crate::entity::EntityHandle;
    use crate::mask::Mask64;

    #[derive(Clone, Copy)]
    struct P;
    #[derive(Clone, Copy)]
    struct V;
    #[derive(Clone, Copy)]
    struct H;

    fn spawn_in<const W: usize>(
        registry: &ArchetypeRegistry<W>,
        allocator: &ChunkAllocator,
        mask: BitMask<W>,
        infos: &[crate::component::ComponentTypeInfo],
        id: u32,
    ) {
        let archetype_id = registry.get_or_create(mask, infos).unwrap();
        registry.with_archetype(archetype_id, |a| {
            a.allocate_slot(allocator, EntityHandle { id, version: 1 })
                .unwrap();
        });
    }

    #[test]
    fn query_matches_union_of_constraints() {
        let components = ComponentRegistry::new(64);
        let p = components.register::<P>().unwrap();
        let v = components.register::<V>().unwrap();
        let h = components.register::<H>().unwrap();
        let infos = components.infos();

        let registry = ArchetypeRegistry::<1>::new();
        let allocator = ChunkAllocator::new();

        let mut mask_p = Mask64::empty();
        mask_p.set(p as usize).unwrap();
        let mut mask_pv = mask_p;
        mask_pv.set(v as usize).unwrap();
        let mut mask_ph = mask_p;
        mask_ph.set(h as usize).unwrap();
        let mut mask_vh = Mask64::empty();
        mask_vh.set(v as usize).unwrap();
        mask_vh.set(h as usize).unwrap();

        spawn_in(&registry, &allocator, mask_p, &infos, 1);
        spawn_in(&registry, &allocator, mask_pv, &infos, 2);
        spawn_in(&registry, &allocator, mask_ph, &infos, 3);
        spawn_in(&registry, &allocator, mask_vh, &infos, 4);

        let mut none_h = Mask64::empty();
        none_h.set(h as usize).unwrap();
        let desc = QueryDescription::builder().all(mask_p).none(none_h).build();
        let query = Query::compile(desc, &registry);
        let matched: Vec<u32> = query.matched_archetypes();
        assert_eq!(matched.len(), 2);

        let desc_any = QueryDescription::builder().any(mask_pv).build();
        let query_any = Query::compile(desc_any, &registry);
        assert_eq!(query_any.matched_archetypes().len(), 4);
    }

    #[test]
    fn degenerate_query_matches_nothing() {
        let components = ComponentRegistry::new(64);
        let p = components.register::<P>().unwrap();
        let infos = components.infos();
        let registry = ArchetypeRegistry::<1>::new();
        let allocator = ChunkAllocator::new();

        let mut mask_p = Mask64::empty();
        mask_p.set(p as usize).unwrap();
        spawn_in(&registry, &allocator, mask_p, &infos, 1);

        let desc = QueryDescription::builder().all(mask_p).none(mask_p).build();
        let query = Query::compile(desc, &registry);
        assert!(query.matched_archetypes().is_empty());
    }

    #[test]
    fn query_observes_archetypes_created_after_build() {
        let components = ComponentRegistry::new(64);
        let p = components.register::<P>().unwrap();
        let infos = components.infos();
        let registry = ArchetypeRegistry::<1>::new();
        let allocator = ChunkAllocator::new();

        let mut mask_p = Mask64::empty();
        mask_p.set(p as usize).unwrap();
        let desc = QueryDescription::builder().all(mask_p).build();
        let query = Query::compile(desc, &registry);
        assert!(query.matched_archetypes().is_empty());

        spawn_in(&registry, &allocator, mask_p, &infos, 1);
        assert_eq!(query.matched_archetypes().len(), 1);
    }
}
