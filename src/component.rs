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

//! Component registration.
//!
//! Components are plain, `Copy` data (no destructors run on archetype
//! migration or chunk reuse). Registration assigns a
//! dense [`ComponentId`] to each type the first time it is seen, producing
//! the `ComponentTypeInfo[]` the layout engine derives chunk byte offsets
//! from. The id set is closed for the life of the registry: once assigned,
//! an id is stable.

use std::any::TypeId;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::{EcsError, Result};

/// Dense component id, assigned in registration order.
pub type ComponentId = u32;

/// Marker trait for component types.
///
/// Components must be `'static` (no borrowed data) and `Copy` (the engine
/// never runs a destructor on migration or chunk reuse).
pub trait Component: 'static + Copy + Send + Sync {}

impl<T: 'static + Copy + Send + Sync> Component for T {}

/// Runtime metadata for one registered component type.
#[derive(Clone, Copy, Debug)]
pub struct ComponentTypeInfo {
    pub id: ComponentId,
    pub size: usize,
    pub align: usize,
}

/// Process-lifetime table mapping component types to dense ids.
///
/// Registration is expected at startup, ahead of any spawn; it is
/// synchronized with a `parking_lot::RwLock` (not a hot-path structure)
/// rather than the lock-free machinery the storage engine uses elsewhere.
pub struct ComponentRegistry {
    by_type: RwLock<FxHashMap<TypeId, ComponentId>>,
    infos: RwLock<Vec<ComponentTypeInfo>>,
    capacity_bits: usize,
}

impl ComponentRegistry {
    /// Create a registry whose ids must fit within `capacity_bits` (the
    /// width of the `BitMask` the host world is instantiated with).
    pub fn new(capacity_bits: usize) -> Self {
        Self {
            by_type: RwLock::new(FxHashMap::default()),
            infos: RwLock::new(Vec::new()),
            capacity_bits,
        }
    }

    /// Register `T`, returning its dense id. Calling this more than once for
    /// the same type returns the same id (idempotent).
    pub fn register<T: Component>(&self) -> Result<ComponentId> {
        let type_id = TypeId::of::<T>();
        if let Some(&id) = self.by_type.read().get(&type_id) {
            return Ok(id);
        }

        let mut by_type = self.by_type.write();
        if let Some(&id) = by_type.get(&type_id) {
            return Ok(id);
        }

        let mut infos = self.infos.write();
        let id = infos.len() as ComponentId;
        if id as usize >= self.capacity_bits {
            return Err(EcsError::MaskOverflow);
        }

        infos.push(ComponentTypeInfo {
            id,
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
        });
        by_type.insert(type_id, id);
        Ok(id)
    }

    /// Dense id for an already-registered type.
    pub fn id_of<T: Component>(&self) -> Option<ComponentId> {
        self.by_type.read().get(&TypeId::of::<T>()).copied()
    }

    /// Snapshot of the `ComponentTypeInfo[]` table, indexed by id.
    pub fn infos(&self) -> Vec<ComponentTypeInfo> {
        self.infos.read().clone()
    }

    pub fn info(&self, id: ComponentId) -> Option<ComponentTypeInfo> {
        self.infos.read().get(id as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy)]
    struct Position {
        #[allow(dead_code)]
        x: f32,
        #[allow(dead_code)]
        y: f32,
    }

    #[derive(Clone, Copy)]
    struct Velocity(#[allow(dead_code)] f32);

    #[test]
    fn register_is_idempotent() {
        let reg = ComponentRegistry::new(64);
        let a = reg.register::<Position>().unwrap();
        let b = reg.register::<Position>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_types_get_distinct_ids() {
        let reg = ComponentRegistry::new(64);
        let pos = reg.register::<Position>().unwrap();
        let vel = reg.register::<Velocity>().unwrap();
        assert_ne!(pos, vel);
        assert_eq!(reg.info(pos).unwrap().size, std::mem::size_of::<Position>());
    }

    #[test]
    fn overflow_past_capacity() {
        #[derive(Clone, Copy)]
        struct A1(u8);
        #[derive(Clone, Copy)]
        struct A2(u8);

        let reg = ComponentRegistry::new(1);
        reg.register::<A1>().unwrap();
        assert_eq!(reg.register::<A2>(), Err(EcsError::MaskOverflow));
    }
}
