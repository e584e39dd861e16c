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

//! Concurrent, archetype-based ECS storage core.
//!
//! Entities are grouped by their exact component composition into
//! archetypes; each archetype's component data lives in fixed-size (16 KiB)
//! structure-of-arrays chunks handed out by a lock-free, versioned
//! allocator. The crate exposes the chunk allocator, archetype registry and
//! graph, layout engine, entity index, append-only vector and query
//! compiler as standalone building blocks — a thin [`world::World`] façade
//! ties them together for callers that don't want to wire the pieces by
//! hand.

pub mod append_list;
pub mod archetype;
pub mod chunk;
pub mod component;
pub mod entity;
pub mod error;
pub mod layout;
pub mod mask;
pub mod query;
pub mod registry;
pub mod utils;
pub mod world;

pub use append_list::AppendList;
pub use archetype::Archetype;
pub use chunk::{ChunkAllocator, ChunkHandle, CHUNK_BYTES};
pub use component::{Component, ComponentId, ComponentRegistry, ComponentTypeInfo};
pub use entity::{EntityHandle, EntityIndex};
pub use error::{EcsError, Result};
pub use layout::ArchetypeLayout;
pub use mask::{BitMask, HashedMask, Mask1024, Mask128, Mask256, Mask512, Mask64};
pub use query::{ChunkView, Query, QueryBuilder, QueryDescription};
pub use registry::ArchetypeRegistry;
pub use world::World;
