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

//! Lock-free append-only vector.
//!
//! A successful [`AppendList::add`] returns a stable index that never moves;
//! any thread may read a published index without further synchronization.
//! Storage grows as a vector-of-chunks so existing elements are never
//! reallocated.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use crate::error::{EcsError, Result};

const MAX_CHUNKS: usize = 1 << 20;
const MIN_CHUNK_SHIFT: u32 = 2;
const MAX_CHUNK_SHIFT: u32 = 20;
const DEFAULT_CHUNK_SHIFT: u32 = 10;

struct Chunk<T> {
    ready: Box<[AtomicU64]>,
    data: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

unsafe impl<T: Send> Sync for Chunk<T> {}

impl<T> Chunk<T> {
    fn new(size: usize) -> Self {
        let mut data = Vec::with_capacity(size);
        for _ in 0..size {
            data.push(UnsafeCell::new(MaybeUninit::uninit()));
        }
        let ready_words = size.div_ceil(64).max(1);
        let mut ready = Vec::with_capacity(ready_words);
        for _ in 0..ready_words {
            ready.push(AtomicU64::new(0));
        }
        Self {
            ready: ready.into_boxed_slice(),
            data: data.into_boxed_slice(),
        }
    }

    #[inline]
    fn mark_ready(&self, local: usize) {
        let word = local / 64;
        let bit = local % 64;
        self.ready[word].fetch_or(1u64 << bit, Ordering::Release);
    }

    #[inline]
    fn is_ready(&self, local: usize) -> bool {
        let word = local / 64;
        let bit = local % 64;
        (self.ready[word].load(Ordering::Acquire) >> bit) & 1 == 1
    }
}

/// A single-producer-safe, multi-reader, append-only vector.
///
/// `T` need not be `Copy`: each slot is written exactly once via a move, and
/// readers only ever observe a `&T` once the slot's ready bit (and the list's
/// `committed_count`) say it is safe to. Storing interior-mutable types
/// (`AtomicU64`, for instance) as `T` lets a caller update an already-published
/// slot in place — that's how [`crate::entity::EntityIndex`] retargets a
/// live entity's location without the list itself supporting removal.
pub struct AppendList<T> {
    chunk_shift: u32,
    chunk_size: usize,
    chunks: Box<[AtomicPtr<Chunk<T>>]>,
    allocated_chunks: AtomicUsize,
    reservation: AtomicUsize,
    committed: AtomicUsize,
}

impl<T: Send + Sync> AppendList<T> {
    /// Create a list with the default chunk size (`2^10` elements).
    pub fn new() -> Self {
        Self::with_chunk_shift(DEFAULT_CHUNK_SHIFT).expect("default chunk shift is valid")
    }

    /// Create a list whose chunks hold `2^chunk_shift` elements.
    /// `chunk_shift` outside `[2, 20]` is a configuration error.
    pub fn with_chunk_shift(chunk_shift: u32) -> Result<Self> {
        if !(MIN_CHUNK_SHIFT..=MAX_CHUNK_SHIFT).contains(&chunk_shift) {
            return Err(EcsError::OutOfRange);
        }
        let mut chunks = Vec::with_capacity(MAX_CHUNKS);
        for _ in 0..MAX_CHUNKS {
            chunks.push(AtomicPtr::new(std::ptr::null_mut()));
        }
        Ok(Self {
            chunk_shift,
            chunk_size: 1usize << chunk_shift,
            chunks: chunks.into_boxed_slice(),
            allocated_chunks: AtomicUsize::new(0),
            reservation: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
        })
    }

    /// Highest index, plus one, whose contents are safely visible to readers.
    pub fn committed_count(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    #[inline]
    fn split(&self, index: usize) -> (usize, usize) {
        (index >> self.chunk_shift, index & (self.chunk_size - 1))
    }

    fn ensure_chunk(&self, chunk_index: usize) -> &Chunk<T> {
        let slot = &self.chunks[chunk_index];
        let existing = slot.load(Ordering::Acquire);
        if !existing.is_null() {
            return unsafe { &*existing };
        }

        let candidate = Box::into_raw(Box::new(Chunk::new(self.chunk_size)));
        match slot.compare_exchange(
            std::ptr::null_mut(),
            candidate,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.allocated_chunks.fetch_add(1, Ordering::AcqRel);
                unsafe { &*candidate }
            }
            Err(winner) => {
                // Lose the race: free our candidate, use the winner's chunk.
                unsafe {
                    drop(Box::from_raw(candidate));
                }
                unsafe { &*winner }
            }
        }
    }

    /// Reserve one slot, write `value` into it, publish it, then return its
    /// index: reserve, allocate the backing chunk if needed, write, mark the
    /// ready bit, then spin the commit counter forward to this index.
    pub fn add(&self, value: T) -> usize {
        let index = self.reservation.fetch_add(1, Ordering::AcqRel);
        let (chunk_index, local) = self.split(index);
        let chunk = self.ensure_chunk(chunk_index);

        unsafe {
            (*chunk.data[local].get()).write(value);
        }
        chunk.mark_ready(local);

        loop {
            let observed = self.committed.load(Ordering::Acquire);
            if observed == index {
                if self
                    .committed
                    .compare_exchange(index, index + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            } else {
                std::hint::spin_loop();
            }
        }

        index
    }

    /// Read the element at `index`, or `None` if `index >= committed_count()`.
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.committed_count() {
            return None;
        }
        let (chunk_index, local) = self.split(index);
        let ptr = self.chunks[chunk_index].load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        let chunk = unsafe { &*ptr };
        if !chunk.is_ready(local) {
            return None;
        }
        Some(unsafe { &*(chunk.data[local].get() as *const MaybeUninit<T> as *const T) })
    }

    /// Like [`get`](Self::get), but returns `OutOfRange` instead of `None`.
    pub fn try_get(&self, index: usize) -> Result<&T> {
        self.get(index).ok_or(EcsError::OutOfRange)
    }

    pub fn len(&self) -> usize {
        self.committed_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + Sync> Default for AppendList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for AppendList<T> {
    fn drop(&mut self) {
        let committed = *self.committed.get_mut();
        let allocated = *self.allocated_chunks.get_mut();
        for chunk_index in 0..allocated {
            let ptr = *self.chunks[chunk_index].get_mut();
            if ptr.is_null() {
                continue;
            }
            let chunk = unsafe { Box::from_raw(ptr) };
            let base = chunk_index << self.chunk_shift;
            if base < committed {
                let live_in_chunk = (committed - base).min(self.chunk_size);
                for local in 0..live_in_chunk {
                    if chunk.is_ready(local) {
                        unsafe {
                            (*chunk.data[local].get()).assume_init_drop();
                        }
                    }
                }
            }
        }
    }
}
