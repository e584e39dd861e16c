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

//! Error types

use std::fmt;

/// ECS storage-core error type.
///
/// `Disposed`, `InUse`, `OutOfRange` and `MaskOverflow` mark invariant
/// violations: callers may still `?`-propagate them, but they represent
/// programmer error rather than something worth retrying. `StaleEntity`,
/// `MissingComponent` and `DuplicateComponent` are ordinary lifecycle
/// outcomes a caller is expected to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcsError {
    /// Handle's version disagrees with the entity index.
    StaleEntity,
    /// Operation requires a component the entity's archetype does not have.
    MissingComponent,
    /// Add of a component the archetype already has.
    DuplicateComponent,
    /// Component id is at or beyond the configured `BitMask` width.
    MaskOverflow,
    /// Free of a chunk (or other tracked resource) with outstanding borrows.
    InUse,
    /// Use of a subsystem after it has been disposed.
    Disposed,
    /// Index or bit position out of bounds.
    OutOfRange,
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::StaleEntity => write!(f, "entity handle is stale"),
            EcsError::MissingComponent => {
                write!(f, "entity does not have the requested component")
            }
            EcsError::DuplicateComponent => write!(f, "archetype already has this component"),
            EcsError::MaskOverflow => write!(f, "component id exceeds bitmask width"),
            EcsError::InUse => write!(f, "resource has outstanding borrows"),
            EcsError::Disposed => write!(f, "subsystem has been disposed"),
            EcsError::OutOfRange => write!(f, "index out of range"),
        }
    }
}

impl std::error::Error for EcsError {}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EcsError>;
