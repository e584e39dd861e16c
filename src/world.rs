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

//! Thin pass-through façade tying the entity index, archetype registry and
//! component registry together.
//!
//! Command buffers, bundles and hot reload live outside this type as
//! external collaborators. `World` carries no policy of its own: every
//! method is a direct forward into [`EntityIndex`], [`ArchetypeRegistry`]
//! or [`ComponentRegistry`], built only so spawn/mutate/query/despawn are
//! expressible in one call chain rather than wired by hand in every test.

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::chunk::ChunkAllocator;
use crate::component::{Component, ComponentRegistry};
use crate::entity::{EntityHandle, EntityIndex};
use crate::error::{EcsError, Result};
use crate::mask::BitMask;
use crate::query::{Query, QueryDescription};
use crate::registry::ArchetypeRegistry;

/// A concurrent archetype-based ECS storage core, monomorphized over the
/// component-mask width `W` (pick the smallest of `Mask64`..`Mask1024`
/// that fits the registered component count).
pub struct World<const W: usize> {
    components: ComponentRegistry,
    archetypes: ArchetypeRegistry<W>,
    entities: EntityIndex,
    chunks: ChunkAllocator,
}

impl<const W: usize> World<W> {
    pub fn new() -> Self {
        #[cfg(feature = "profiling")]
        let _span = info_span!("world_new").entered();
        Self {
            components: ComponentRegistry::new(BitMask::<W>::CAPACITY),
            archetypes: ArchetypeRegistry::new(),
            entities: EntityIndex::new(),
            chunks: ChunkAllocator::new(),
        }
    }

    /// Register `T` for use as a component. Idempotent; safe to call
    /// lazily from `add_component` the first time a type is seen.
    pub fn register_component<T: Component>(&self) -> Result<()> {
        self.components.register::<T>().map(|_| ())
    }

    /// Spawn an entity into the empty archetype (the archetype whose mask
    /// has no bits set).
    pub fn spawn(&self) -> Result<EntityHandle> {
        let handle = self.entities.spawn();
        let empty_mask = BitMask::<W>::empty();
        let infos = self.components.infos();
        let archetype_id = self.archetypes.get_or_create(empty_mask, &infos)?;
        let slot = self
            .archetypes
            .with_archetype(archetype_id, |archetype| {
                archetype.allocate_slot(&self.chunks, handle)
            })
            .ok_or(EcsError::OutOfRange)??
            .global_slot;
        self.entities.set_location(handle, archetype_id, slot);
        Ok(handle)
    }

    pub fn is_alive(&self, handle: EntityHandle) -> bool {
        self.entities.is_alive(handle)
    }

    /// Add `value` as entity `handle`'s `T` component, migrating it to the
    /// archetype one edge over. Fails with
    /// `StaleEntity` if the handle is no longer live, `DuplicateComponent`
    /// if the entity's archetype already includes `T`.
    pub fn add_component<T: Component>(&self, handle: EntityHandle, value: T) -> Result<()> {
        let component_id = self.components.register::<T>()?;
        let (source_archetype_id, source_slot) =
            self.entities.location(handle).ok_or(EcsError::StaleEntity)?;

        let already_present = self
            .archetypes
            .with_archetype(source_archetype_id, |a| a.layout.has_component(component_id))
            .ok_or(EcsError::StaleEntity)?;
        if already_present {
            return Err(EcsError::DuplicateComponent);
        }

        let infos = self.components.infos();
        let target_archetype_id =
            self.archetypes
                .get_or_create_with_add(source_archetype_id, component_id, &infos)?;

        let target_slot = self.migrate(
            source_archetype_id,
            source_slot,
            target_archetype_id,
            handle,
        )?;

        self.archetypes
            .with_archetype(target_archetype_id, |target| {
                let (bytes, offset, size) = target
                    .component_bytes_mut(&self.chunks, target_slot, component_id)
                    .expect("component_id was just added to this archetype's layout");
                if size > 0 {
                    let src = unsafe {
                        std::slice::from_raw_parts(&value as *const T as *const u8, size)
                    };
                    bytes[offset..offset + size].copy_from_slice(src);
                }
            });

        Ok(())
    }

    /// Remove entity `handle`'s `T` component, migrating it back one edge.
    /// Fails with `MissingComponent` if the entity's archetype does not
    /// include `T`.
    pub fn remove_component<T: Component>(&self, handle: EntityHandle) -> Result<()> {
        let component_id = self
            .components
            .id_of::<T>()
            .ok_or(EcsError::MissingComponent)?;
        let (source_archetype_id, source_slot) =
            self.entities.location(handle).ok_or(EcsError::StaleEntity)?;

        let present = self
            .archetypes
            .with_archetype(source_archetype_id, |a| a.layout.has_component(component_id))
            .ok_or(EcsError::StaleEntity)?;
        if !present {
            return Err(EcsError::MissingComponent);
        }

        let infos = self.components.infos();
        let target_archetype_id = self.archetypes.get_or_create_with_remove(
            source_archetype_id,
            component_id,
            &infos,
        )?;

        self.migrate(source_archetype_id, source_slot, target_archetype_id, handle)?;
        Ok(())
    }

    /// Copy every shared component from `(source_archetype_id, source_slot)`
    /// into a fresh slot of `target_archetype_id`, swap-remove the source
    /// slot, and CAS the entity's location to the new home. Returns the
    /// entity's new global slot.
    fn migrate(
        &self,
        source_archetype_id: u32,
        source_slot: u32,
        target_archetype_id: u32,
        handle: EntityHandle,
    ) -> Result<u32> {
        let target_slot = self
            .archetypes
            .with_archetype(target_archetype_id, |target| {
                target.allocate_slot(&self.chunks, handle)
            })
            .ok_or(EcsError::OutOfRange)??
            .global_slot;

        // Computed from plain `Copy` snapshots (mask, component id list)
        // rather than nested `with_archetype` calls, since a thread
        // re-entering the registry's read lock while already holding it
        // can deadlock against a writer queued in between.
        let target_component_ids: Vec<_> = self
            .archetypes
            .with_archetype(target_archetype_id, |target| {
                target.layout.slots().iter().map(|s| s.component_id).collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let source_mask = self
            .archetypes
            .with_archetype(source_archetype_id, |source| source.mask)
            .ok_or(EcsError::OutOfRange)?;
        let shared_components: Vec<_> = target_component_ids
            .into_iter()
            .filter(|&id| source_mask.get(id as usize).unwrap_or(false))
            .collect();

        for component_id in shared_components {
            let (src_bytes, src_offset, size) = self
                .archetypes
                .with_archetype(source_archetype_id, |source| {
                    source.component_bytes(&self.chunks, source_slot, component_id)
                })
                .ok_or(EcsError::OutOfRange)??;
            if size == 0 {
                continue;
            }
            let mut tmp = vec![0u8; size];
            tmp.copy_from_slice(&src_bytes[src_offset..src_offset + size]);

            self.archetypes
                .with_archetype(target_archetype_id, |target| {
                    let (dst_bytes, dst_offset, _) = target
                        .component_bytes_mut(&self.chunks, target_slot, component_id)
                        .expect("component is shared, so the target layout must carry it too");
                    dst_bytes[dst_offset..dst_offset + size].copy_from_slice(&tmp);
                })
                .ok_or(EcsError::OutOfRange)?;
        }

        let moved = self
            .archetypes
            .with_archetype(source_archetype_id, |source| {
                source.remove_slot(&self.chunks, source_slot)
            })
            .ok_or(EcsError::OutOfRange)??;
        if let Some((moved_entity_id, new_slot)) = moved {
            self.retarget_moved_entity(source_archetype_id, moved_entity_id, new_slot);
        }

        self.entities
            .set_location(handle, target_archetype_id, target_slot);
        Ok(target_slot)
    }

    fn retarget_moved_entity(&self, archetype_id: u32, moved_entity_id: u32, new_slot: u32) {
        if let Some(handle) = self.entities.current_handle(moved_entity_id) {
            self.entities.set_location(handle, archetype_id, new_slot);
        }
    }

    /// Destroy `handle`. Returns `false` (not an error) if it was already
    /// stale rather than treating a double despawn as a hard error.
    pub fn despawn(&self, handle: EntityHandle) -> bool {
        let Some((archetype_id, slot)) = self.entities.location(handle) else {
            return self.entities.destroy(handle);
        };
        let moved = self
            .archetypes
            .with_archetype(archetype_id, |archetype| {
                archetype.remove_slot(&self.chunks, slot)
            })
            .and_then(|r| r.ok())
            .flatten();
        if let Some((moved_entity_id, new_slot)) = moved {
            self.retarget_moved_entity(archetype_id, moved_entity_id, new_slot);
        }
        self.entities.destroy(handle)
    }

    /// Read entity `handle`'s `T` component, or `None` if it is stale or
    /// lacks `T`.
    pub fn get<T: Component>(&self, handle: EntityHandle) -> Option<T> {
        let component_id = self.components.id_of::<T>()?;
        let (archetype_id, slot) = self.entities.location(handle)?;
        self.archetypes.with_archetype(archetype_id, |archetype| {
            let (bytes, offset, size) = archetype
                .component_bytes(&self.chunks, slot, component_id)
                .ok()?;
            if size == 0 {
                return None;
            }
            Some(unsafe { std::ptr::read(bytes[offset..offset + size].as_ptr() as *const T) })
        })?
    }

    /// Overwrite entity `handle`'s `T` component in place. Fails with
    /// `MissingComponent` if the entity's archetype doesn't carry `T`.
    pub fn set<T: Component>(&self, handle: EntityHandle, value: T) -> Result<()> {
        let component_id = self
            .components
            .id_of::<T>()
            .ok_or(EcsError::MissingComponent)?;
        let (archetype_id, slot) =
            self.entities.location(handle).ok_or(EcsError::StaleEntity)?;
        self.archetypes
            .with_archetype(archetype_id, |archetype| {
                let (bytes, offset, size) = archetype
                    .component_bytes_mut(&self.chunks, slot, component_id)
                    .map_err(|_| EcsError::MissingComponent)?;
                if size > 0 {
                    let src = unsafe {
                        std::slice::from_raw_parts(&value as *const T as *const u8, size)
                    };
                    bytes[offset..offset + size].copy_from_slice(src);
                }
                Ok(())
            })
            .ok_or(EcsError::StaleEntity)?
    }

    pub fn has_component<T: Component>(&self, handle: EntityHandle) -> bool {
        let Some(component_id) = self.components.id_of::<T>() else {
            return false;
        };
        let Some((archetype_id, _)) = self.entities.location(handle) else {
            return false;
        };
        self.archetypes
            .with_archetype(archetype_id, |a| a.layout.has_component(component_id))
            .unwrap_or(false)
    }

    /// Compile a query over the current archetype set.
    pub fn query(&self, description: QueryDescription<W>) -> Query<'_, W> {
        Query::compile(description, &self.archetypes)
    }

    pub fn chunk_allocator(&self) -> &ChunkAllocator {
        &self.chunks
    }
}

impl<const W: usize> Default for World<W> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::Mask64;

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
        z: f32,
    }

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Velocity {
        x: f32,
        y: f32,
        z: f32,
    }

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Health {
        current: u32,
        max: u32,
    }

    #[test]
    fn s1_spawn_then_add_transitions_archetype() {
        let world: World<1> = World::new();
        let e = world.spawn().unwrap();
        world
            .add_component(e, Position { x: 10.0, y: 20.0, z: 30.0 })
            .unwrap();
        world
            .add_component(e, Velocity { x: 1.0, y: 2.0, z: 3.0 })
            .unwrap();

        assert!(world.is_alive(e));
        assert!(world.has_component::<Position>(e));
        assert!(world.has_component::<Velocity>(e));
        assert_eq!(
            world.get::<Position>(e),
            Some(Position { x: 10.0, y: 20.0, z: 30.0 })
        );
    }

    #[test]
    fn s2_archetype_transitions_preserve_data() {
        let world: World<1> = World::new();
        let e = world.spawn().unwrap();
        world
            .add_component(e, Position { x: 10.0, y: 20.0, z: 30.0 })
            .unwrap();
        world
            .add_component(e, Health { current: 100, max: 100 })
            .unwrap();

        world
            .add_component(e, Velocity { x: 1.0, y: 0.0, z: 0.0 })
            .unwrap();
        world.remove_component::<Health>(e).unwrap();

        assert_eq!(
            world.get::<Position>(e),
            Some(Position { x: 10.0, y: 20.0, z: 30.0 })
        );
        assert_eq!(
            world.get::<Velocity>(e),
            Some(Velocity { x: 1.0, y: 0.0, z: 0.0 })
        );
        assert!(!world.has_component::<Health>(e));
    }

    #[test]
    fn s5_handle_staleness() {
        let world: World<1> = World::new();
        let e1 = world.spawn().unwrap();
        assert!(world.despawn(e1));
        let e2 = world.spawn().unwrap();

        assert!(!world.is_alive(e1));
        assert!(world.is_alive(e2));
        assert_ne!(e1.version, e2.version);
    }

    #[test]
    fn duplicate_add_is_an_error() {
        let world: World<1> = World::new();
        let e = world.spawn().unwrap();
        world.add_component(e, Position { x: 0.0, y: 0.0, z: 0.0 }).unwrap();
        assert_eq!(
            world.add_component(e, Position { x: 1.0, y: 1.0, z: 1.0 }),
            Err(EcsError::DuplicateComponent)
        );
    }

    #[test]
    fn query_via_world_facade() {
        let world: World<1> = World::new();
        let e1 = world.spawn().unwrap();
        world.add_component(e1, Position { x: 1.0, y: 0.0, z: 0.0 }).unwrap();
        let e2 = world.spawn().unwrap();
        world.add_component(e2, Position { x: 2.0, y: 0.0, z: 0.0 }).unwrap();
        world.add_component(e2, Velocity { x: 0.0, y: 0.0, z: 0.0 }).unwrap();

        let pos_id = world.components.id_of::<Position>().unwrap();
        let mut all = Mask64::empty();
        all.set(pos_id as usize).unwrap();
        let description = QueryDescription::builder().all(all).build();
        let query = world.query(description);
        assert_eq!(query.matched_archetypes().len(), 2);
    }
}
