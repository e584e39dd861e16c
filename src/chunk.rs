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

//! Versioned slot table handing out fixed-size 16 KiB chunks.
//!
//! A [`ChunkHandle`] is the only reference form past the
//! allocator; raw pointers never escape it. A handle's version is live iff
//! odd, so `free` need only bump it to the next even number to revoke every
//! outstanding copy in one step.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use crossbeam::queue::SegQueue;
use parking_lot::Mutex;

use crate::error::{EcsError, Result};

/// Size of every chunk the allocator hands out, fixed at build time.
pub const CHUNK_BYTES: usize = 16 * 1024;

const SLOTS_PER_META_BLOCK: usize = 4096;
const MAX_META_BLOCKS: usize = 1 << 16;

type ChunkData = [u8; CHUNK_BYTES];

/// Token referencing one chunk: a slot id paired with the version observed
/// at allocation time. Version 0 is never issued and marks an invalid
/// handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkHandle {
    pub slot_id: u32,
    pub version: u32,
}

impl ChunkHandle {
    pub const INVALID: ChunkHandle = ChunkHandle {
        slot_id: 0,
        version: 0,
    };

    pub fn is_valid(&self) -> bool {
        self.version != 0
    }
}

struct Slot {
    data: AtomicPtr<ChunkData>,
    version: AtomicU32,
    share_count: AtomicU32,
    mut_borrowed: AtomicBool,
}

impl Slot {
    fn new() -> Self {
        Self {
            data: AtomicPtr::new(std::ptr::null_mut()),
            version: AtomicU32::new(0),
            share_count: AtomicU32::new(0),
            mut_borrowed: AtomicBool::new(false),
        }
    }
}

struct MetaBlock {
    slots: Box<[Slot]>,
}

impl MetaBlock {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(SLOTS_PER_META_BLOCK);
        for _ in 0..SLOTS_PER_META_BLOCK {
            slots.push(Slot::new());
        }
        Self {
            slots: slots.into_boxed_slice(),
        }
    }
}

/// A versioned, lock-free slot table of 16 KiB blocks with reference
/// counting.
pub struct ChunkAllocator {
    meta_blocks: Box<[AtomicPtr<MetaBlock>]>,
    allocated_meta_blocks: std::sync::atomic::AtomicUsize,
    growth_lock: Mutex<()>,
    watermark: std::sync::atomic::AtomicU32,
    free_stack: SegQueue<u32>,
    disposed: AtomicBool,
}

impl ChunkAllocator {
    pub fn new() -> Self {
        let mut meta_blocks = Vec::with_capacity(MAX_META_BLOCKS);
        for _ in 0..MAX_META_BLOCKS {
            meta_blocks.push(AtomicPtr::new(std::ptr::null_mut()));
        }
        Self {
            meta_blocks: meta_blocks.into_boxed_slice(),
            allocated_meta_blocks: std::sync::atomic::AtomicUsize::new(0),
            growth_lock: Mutex::new(()),
            watermark: std::sync::atomic::AtomicU32::new(0),
            free_stack: SegQueue::new(),
            disposed: AtomicBool::new(false),
        }
    }

    #[inline]
    fn split(slot_id: u32) -> (usize, usize) {
        let slot_id = slot_id as usize;
        (slot_id / SLOTS_PER_META_BLOCK, slot_id % SLOTS_PER_META_BLOCK)
    }

    fn slot(&self, slot_id: u32) -> Option<&Slot> {
        let (block_index, local) = Self::split(slot_id);
        if block_index >= self.meta_blocks.len() {
            return None;
        }
        let ptr = self.meta_blocks[block_index].load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        Some(&unsafe { &*ptr }.slots[local])
    }

    fn ensure_meta_block(&self, block_index: usize) -> &MetaBlock {
        let cell = &self.meta_blocks[block_index];
        let existing = cell.load(Ordering::Acquire);
        if !existing.is_null() {
            return unsafe { &*existing };
        }

        let _guard = self.growth_lock.lock();
        // Double-checked: a racing grower may have already installed one.
        let existing = cell.load(Ordering::Acquire);
        if !existing.is_null() {
            return unsafe { &*existing };
        }

        let fresh = Box::into_raw(Box::new(MetaBlock::new()));
        cell.store(fresh, Ordering::Release);
        self.allocated_meta_blocks.fetch_add(1, Ordering::AcqRel);
        unsafe { &*fresh }
    }

    /// Hand out a fresh, zeroed chunk. Fails with `Disposed` after [`dispose`](Self::dispose).
    pub fn allocate(&self) -> Result<ChunkHandle> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(EcsError::Disposed);
        }

        let slot_id = match self.free_stack.pop() {
            Some(id) => id,
            None => self.watermark.fetch_add(1, Ordering::AcqRel),
        };

        let (block_index, local) = Self::split(slot_id);
        let block = self.ensure_meta_block(block_index);
        let slot = &block.slots[local];

        let existing_ptr = slot.data.load(Ordering::Acquire);
        if existing_ptr.is_null() {
            let boxed: Box<ChunkData> = Box::new([0u8; CHUNK_BYTES]);
            let raw = Box::into_raw(boxed);
            if slot
                .data
                .compare_exchange(
                    std::ptr::null_mut(),
                    raw,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                unsafe {
                    drop(Box::from_raw(raw));
                }
            }
        } else {
            unsafe {
                std::ptr::write_bytes(existing_ptr, 0, 1);
            }
        }

        // Slot ownership here is exclusive (fresh watermark bump or a unique
        // free-stack pop), so a plain fetch-add cannot race: the prior
        // version is 0 (never used) or even (revoked by `free`), and adding
        // one always lands on the next odd value.
        let version = slot.version.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert_eq!(version % 2, 1);
        slot.share_count.store(0, Ordering::Release);
        slot.mut_borrowed.store(false, Ordering::Release);

        Ok(ChunkHandle { slot_id, version })
    }

    /// Read-only view of a chunk's bytes, or `None` if `handle` is stale.
    /// This is an optimistic borrow: callers must `acquire` before mutating.
    pub fn get_bytes(&self, handle: ChunkHandle) -> Option<&[u8; CHUNK_BYTES]> {
        let slot = self.slot(handle.slot_id)?;
        if slot.version.load(Ordering::Acquire) != handle.version {
            return None;
        }
        let ptr = slot.data.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        Some(unsafe { &*ptr })
    }

    /// Mutable view of a chunk's bytes, valid only while the matching
    /// `acquire` has not yet been `release`d.
    ///
    /// # Safety
    /// Caller must hold a successful `acquire` on `handle` and must not
    /// alias this with any other live borrow of the same chunk.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_bytes_mut(&self, handle: ChunkHandle) -> Option<&mut [u8; CHUNK_BYTES]> {
        let slot = self.slot(handle.slot_id)?;
        if slot.version.load(Ordering::Acquire) != handle.version {
            return None;
        }
        let ptr = slot.data.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        Some(&mut *ptr)
    }

    /// Increment share-count iff `handle`'s version still matches. Every
    /// successful `acquire` must be paired with exactly one [`release`](Self::release).
    pub fn acquire(&self, handle: ChunkHandle) -> bool {
        let Some(slot) = self.slot(handle.slot_id) else {
            return false;
        };
        if slot.version.load(Ordering::Acquire) != handle.version {
            return false;
        }
        slot.share_count.fetch_add(1, Ordering::AcqRel);
        if slot.version.load(Ordering::Acquire) != handle.version {
            slot.share_count.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Decrement share-count. Must only be called to match a successful `acquire`.
    pub fn release(&self, handle: ChunkHandle) {
        if let Some(slot) = self.slot(handle.slot_id) {
            slot.share_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Revoke `handle` and return its slot to the free list. Fails with
    /// `InUse` if share-count is nonzero; a stale or invalid handle is a
    /// silent no-op.
    pub fn free(&self, handle: ChunkHandle) -> Result<()> {
        let Some(slot) = self.slot(handle.slot_id) else {
            return Ok(());
        };
        if slot.version.load(Ordering::Acquire) != handle.version {
            return Ok(());
        }
        if slot.share_count.load(Ordering::Acquire) != 0 {
            return Err(EcsError::InUse);
        }

        let next = handle.version.wrapping_add(1);
        match slot.version.compare_exchange(
            handle.version,
            next,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.free_stack.push(handle.slot_id);
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }

    /// Mark the allocator disposed; future `allocate` calls fail with `Disposed`.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

impl Default for ChunkAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ChunkAllocator {
    fn drop(&mut self) {
        let allocated = *self.allocated_meta_blocks.get_mut();
        for block_index in 0..allocated {
            let ptr = *self.meta_blocks[block_index].get_mut();
            if ptr.is_null() {
                continue;
            }
            let block = unsafe { Box::from_raw(ptr) };
            for slot in block.slots.iter() {
                let data_ptr = slot.data.load(Ordering::Relaxed);
                if !data_ptr.is_null() {
                    unsafe {
                        drop(Box::from_raw(data_ptr));
                    }
                }
            }
        }
    }
}

/// RAII guard pairing one `acquire` with its `release`.
pub struct ChunkGuard<'a> {
    allocator: &'a ChunkAllocator,
    handle: ChunkHandle,
}

impl<'a> ChunkGuard<'a> {
    /// Acquire `handle` against `allocator`, returning `None` if stale.
    pub fn new(allocator: &'a ChunkAllocator, handle: ChunkHandle) -> Option<Self> {
        if allocator.acquire(handle) {
            Some(Self { allocator, handle })
        } else {
            None
        }
    }

    pub fn bytes(&self) -> &[u8; CHUNK_BYTES] {
        self.allocator
            .get_bytes(self.handle)
            .expect("acquired handle must stay valid until release")
    }
}

impl Drop for ChunkGuard<'_> {
    fn drop(&mut self) {
        self.allocator.release(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn allocate_returns_zeroed_odd_version() {
        let alloc = ChunkAllocator::new();
        let h = alloc.allocate().unwrap();
        assert_eq!(h.version % 2, 1);
        assert!(alloc.get_bytes(h).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn chunk_reuse_after_free_zeroes_and_bumps_version() {
        let alloc = ChunkAllocator::new();
        let h = alloc.allocate().unwrap();
        unsafe {
            alloc.get_bytes_mut(h).unwrap()[0] = 123;
        }
        assert_eq!(alloc.get_bytes(h).unwrap()[0], 123);

        alloc.free(h).unwrap();
        assert!(alloc.get_bytes(h).is_none());

        let h2 = alloc.allocate().unwrap();
        assert_eq!(h2.slot_id, h.slot_id);
        assert_ne!(h2.version, h.version);
        assert_eq!(alloc.get_bytes(h2).unwrap()[0], 0);
        assert!(alloc.get_bytes(h).is_none());
    }

    #[test]
    fn free_with_outstanding_share_fails() {
        let alloc = ChunkAllocator::new();
        let h = alloc.allocate().unwrap();
        assert!(alloc.acquire(h));
        assert_eq!(alloc.free(h), Err(EcsError::InUse));
        alloc.release(h);
        assert!(alloc.free(h).is_ok());
    }

    #[test]
    fn stale_handle_operations_are_graceful() {
        let alloc = ChunkAllocator::new();
        let h = alloc.allocate().unwrap();
        alloc.free(h).unwrap();
        assert!(alloc.get_bytes(h).is_none());
        assert!(!alloc.acquire(h));
        assert!(alloc.free(h).is_ok());
    }

    #[test]
    fn allocate_after_dispose_fails() {
        let alloc = ChunkAllocator::new();
        alloc.dispose();
        assert_eq!(alloc.allocate().err(), Some(EcsError::Disposed));
    }

    #[test]
    fn guard_releases_on_drop() {
        let alloc = ChunkAllocator::new();
        let h = alloc.allocate().unwrap();
        {
            let guard = ChunkGuard::new(&alloc, h).unwrap();
            assert_eq!(guard.bytes()[0], 0);
        }
        assert!(alloc.free(h).is_ok());
    }

    #[test]
    fn concurrent_acquire_release_never_observes_freed_chunk() {
        let alloc = Arc::new(ChunkAllocator::new());
        let h = alloc.allocate().unwrap();
        let successes = Arc::new(AtomicUsize::new(0));

        thread::scope(|scope| {
            for _ in 0..8 {
                let alloc = Arc::clone(&alloc);
                let successes = Arc::clone(&successes);
                scope.spawn(move || {
                    for _ in 0..1000 {
                        if let Some(guard) = ChunkGuard::new(&alloc, h) {
                            let _ = guard.bytes()[0];
                            successes.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert!(successes.load(Ordering::Relaxed) > 0);
        assert!(alloc.free(h).is_ok());
    }
}
