//! # Memory Arena
//!
//! Pooled byte buffers shared by every thread of a socket. Buffers are grouped
//! into power-of-two size classes, each with its own free list behind its own
//! lock, so allocation is O(1) and threads working on different sizes never
//! contend.
//!
//! Every allocation is handed out as an owned [`HeapMemory`] guard. The guard
//! returns its buffer to the pool when dropped (or when passed to
//! [`MemoryManager::dealloc`]), so a block can only be released once and a
//! forgotten block is still reclaimed. Each allocation carries a generation tag
//! from a monotonically increasing counter. Every manager keeps a lock-free
//! count of live handles, and debug builds assert it never goes negative. The
//! exact set of live generations is kept only in tests or with the
//! `track-generations` feature, since it takes a lock on every alloc and free.
//!
//! ```text
//!   physical buffer (class size, e.g. 2048)
//!   ┌───────────────────────────────────────────────────────┐
//!   │        │◀──── virtual window (offset, length) ────▶│   │
//!   └───────────────────────────────────────────────────────┘
//! ```

use serde::Serialize;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[cfg(any(test, feature = "track-generations"))]
use std::collections::HashSet;

// ─── Configuration ──────────────────────────────────────────────────────────

/// Arena sizing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Smallest size class in bytes (rounded up to a power of two).
    pub min_block_size: usize,
    /// Largest pooled size class. Larger requests bypass the free lists.
    pub max_block_size: usize,
    /// Maximum number of idle buffers retained per size class.
    pub max_pooled_per_class: usize,
    /// Maximum number of idle pointer-set vectors retained.
    pub max_pooled_pointer_sets: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            min_block_size: 64,
            max_block_size: 64 * 1024,
            max_pooled_per_class: 1024,
            max_pooled_pointer_sets: 1024,
        }
    }
}

// ─── Stats ──────────────────────────────────────────────────────────────────

/// Snapshot of arena accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    /// Blocks handed out since creation.
    pub allocations: u64,
    /// Blocks returned since creation.
    pub deallocations: u64,
    /// Blocks currently owned by someone.
    pub live_blocks: u64,
    /// Pointer sets handed out since creation.
    pub pointer_set_allocations: u64,
    /// Pointer sets returned since creation.
    pub pointer_set_deallocations: u64,
    /// Pointer sets currently owned by someone.
    pub live_pointer_sets: u64,
    /// Idle buffers sitting in the free lists.
    pub pooled_buffers: u64,
}

// ─── Pool internals ─────────────────────────────────────────────────────────

struct SizeClass {
    size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

struct MemoryInner {
    config: MemoryConfig,
    classes: Vec<SizeClass>,
    pointer_sets: Mutex<Vec<Vec<Pointer>>>,
    generation: AtomicU64,
    allocations: AtomicU64,
    deallocations: AtomicU64,
    set_allocations: AtomicU64,
    set_deallocations: AtomicU64,
    /// Blocks plus pointer sets currently handed out.
    live_handles: AtomicUsize,
    #[cfg(any(test, feature = "track-generations"))]
    live_generations: Mutex<HashSet<u64>>,
}

impl MemoryInner {
    fn class_index(&self, size: usize) -> Option<usize> {
        let min = self.config.min_block_size;
        if size > self.config.max_block_size {
            return None;
        }
        let rounded = size.max(min).next_power_of_two();
        let index = (rounded.trailing_zeros() - min.trailing_zeros()) as usize;
        (index < self.classes.len()).then_some(index)
    }

    fn next_generation(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        self.live_handles.fetch_add(1, Ordering::Relaxed);
        #[cfg(any(test, feature = "track-generations"))]
        {
            self.live_generations
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(generation);
        }
        generation
    }

    fn retire_generation(&self, generation: u64) {
        let previous = self.live_handles.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(
            previous > 0,
            "arena generation {generation} released with no live handles"
        );
        #[cfg(any(test, feature = "track-generations"))]
        {
            let was_live = self
                .live_generations
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&generation);
            debug_assert!(was_live, "arena generation {generation} released twice");
        }
    }

    fn release_block(&self, buffer: Box<[u8]>, class: Option<usize>, generation: u64) {
        self.retire_generation(generation);
        self.deallocations.fetch_add(1, Ordering::Relaxed);

        if let Some(class) = class.and_then(|c| self.classes.get(c)) {
            let mut free = class.free.lock().unwrap_or_else(|e| e.into_inner());
            if free.len() < self.config.max_pooled_per_class {
                free.push(buffer);
            }
        }
    }

    fn release_set(&self, mut entries: Vec<Pointer>, generation: u64) {
        // Drop the contents first so nested blocks go back to their classes.
        entries.clear();
        self.retire_generation(generation);
        self.set_deallocations.fetch_add(1, Ordering::Relaxed);

        let mut sets = self.pointer_sets.lock().unwrap_or_else(|e| e.into_inner());
        if sets.len() < self.config.max_pooled_pointer_sets {
            sets.push(entries);
        }
    }
}

// ─── MemoryManager ──────────────────────────────────────────────────────────

/// Handle to a shared arena. Cloning is cheap; all clones share the pools.
#[derive(Clone)]
pub struct MemoryManager {
    inner: Arc<MemoryInner>,
}

impl MemoryManager {
    pub fn new(config: MemoryConfig) -> Self {
        let min = config.min_block_size.max(8).next_power_of_two();
        let max = config.max_block_size.max(min).next_power_of_two();
        let config = MemoryConfig {
            min_block_size: min,
            max_block_size: max,
            ..config
        };

        let mut classes = Vec::new();
        let mut size = min;
        while size <= max {
            classes.push(SizeClass {
                size,
                free: Mutex::new(Vec::new()),
            });
            size <<= 1;
        }

        MemoryManager {
            inner: Arc::new(MemoryInner {
                config,
                classes,
                pointer_sets: Mutex::new(Vec::new()),
                generation: AtomicU64::new(1),
                allocations: AtomicU64::new(0),
                deallocations: AtomicU64::new(0),
                set_allocations: AtomicU64::new(0),
                set_deallocations: AtomicU64::new(0),
                live_handles: AtomicUsize::new(0),
                #[cfg(any(test, feature = "track-generations"))]
                live_generations: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Allocate a block whose virtual window is `[0, size)`.
    ///
    /// Pooled buffers are reused without clearing; callers write before they
    /// read.
    pub fn alloc(&self, size: usize) -> HeapMemory {
        let class = self.inner.class_index(size);
        let buffer = match class {
            Some(index) => {
                let class = &self.inner.classes[index];
                let reused = class
                    .free
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .pop();
                reused.unwrap_or_else(|| vec![0u8; class.size].into_boxed_slice())
            }
            None => vec![0u8; size].into_boxed_slice(),
        };

        self.inner.allocations.fetch_add(1, Ordering::Relaxed);
        HeapMemory {
            buffer: Some(buffer),
            offset: 0,
            length: size,
            class,
            generation: self.inner.next_generation(),
            pool: self.inner.clone(),
        }
    }

    /// Allocate a block and copy `data` into it.
    pub fn alloc_copy(&self, data: &[u8]) -> HeapMemory {
        let mut block = self.alloc(data.len());
        block.copy_from_slice(data);
        block
    }

    /// Return a block to the pool. Equivalent to dropping it.
    pub fn dealloc(&self, block: HeapMemory) {
        drop(block);
    }

    /// Allocate an empty pointer set able to hold `capacity` entries without
    /// reallocating.
    pub fn alloc_pointer_set(&self, capacity: usize) -> PointerSet {
        let mut entries = self
            .inner
            .pointer_sets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_default();
        entries.reserve(capacity);

        self.inner.set_allocations.fetch_add(1, Ordering::Relaxed);
        PointerSet {
            entries: Some(entries),
            generation: self.inner.next_generation(),
            pool: self.inner.clone(),
        }
    }

    /// Return a pointer set (and everything it owns) to the pool.
    pub fn dealloc_pointer_set(&self, set: PointerSet) {
        drop(set);
    }

    pub fn config(&self) -> MemoryConfig {
        self.inner.config
    }

    pub fn stats(&self) -> MemoryStats {
        let allocations = self.inner.allocations.load(Ordering::Relaxed);
        let deallocations = self.inner.deallocations.load(Ordering::Relaxed);
        let set_allocations = self.inner.set_allocations.load(Ordering::Relaxed);
        let set_deallocations = self.inner.set_deallocations.load(Ordering::Relaxed);
        let pooled_buffers = self
            .inner
            .classes
            .iter()
            .map(|c| c.free.lock().unwrap_or_else(|e| e.into_inner()).len() as u64)
            .sum();

        MemoryStats {
            allocations,
            deallocations,
            live_blocks: allocations.saturating_sub(deallocations),
            pointer_set_allocations: set_allocations,
            pointer_set_deallocations: set_deallocations,
            live_pointer_sets: set_allocations.saturating_sub(set_deallocations),
            pooled_buffers,
        }
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

// ─── HeapMemory ─────────────────────────────────────────────────────────────

/// An owned, pooled byte buffer with a movable virtual window.
///
/// Dereferences to the bytes inside the window.
pub struct HeapMemory {
    buffer: Option<Box<[u8]>>,
    offset: usize,
    length: usize,
    class: Option<usize>,
    generation: u64,
    pool: Arc<MemoryInner>,
}

impl HeapMemory {
    /// Start of the virtual window inside the physical buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Physical buffer size.
    pub fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.len())
    }

    /// Allocation generation tag.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Move the virtual window. Returns `false` (leaving the window untouched)
    /// if it would extend past the physical buffer.
    pub fn set_window(&mut self, offset: usize, length: usize) -> bool {
        match offset.checked_add(length) {
            Some(end) if end <= self.capacity() => {
                self.offset = offset;
                self.length = length;
                true
            }
            _ => false,
        }
    }

    /// Shrink the window to `length` bytes, keeping its offset.
    pub fn truncate(&mut self, length: usize) {
        self.length = self.length.min(length);
    }

    /// Drop `count` bytes from the front of the window.
    pub fn advance(&mut self, count: usize) {
        let count = count.min(self.length);
        self.offset += count;
        self.length -= count;
    }
}

impl Deref for HeapMemory {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.buffer {
            Some(buffer) => &buffer[self.offset..self.offset + self.length],
            None => &[],
        }
    }
}

impl DerefMut for HeapMemory {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.buffer {
            Some(buffer) => &mut buffer[self.offset..self.offset + self.length],
            None => &mut [],
        }
    }
}

impl AsRef<[u8]> for HeapMemory {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl fmt::Debug for HeapMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapMemory")
            .field("generation", &self.generation)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Drop for HeapMemory {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release_block(buffer, self.class, self.generation);
        }
    }
}

// ─── PointerSet ─────────────────────────────────────────────────────────────

/// One entry of a [`PointerSet`]: a block or a nested set.
#[derive(Debug)]
pub enum Pointer {
    Memory(HeapMemory),
    Set(PointerSet),
}

/// A pooled bundle of blocks handed over in a single ownership transfer,
/// e.g. a run of in-order packets released by a sequenced channel.
pub struct PointerSet {
    entries: Option<Vec<Pointer>>,
    generation: u64,
    pool: Arc<MemoryInner>,
}

impl PointerSet {
    pub fn push(&mut self, block: HeapMemory) {
        self.entries_mut().push(Pointer::Memory(block));
    }

    pub fn push_set(&mut self, set: PointerSet) {
        self.entries_mut().push(Pointer::Set(set));
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Pointer> {
        match &self.entries {
            Some(entries) => entries.iter(),
            None => [].iter(),
        }
    }

    /// Remove every entry, keeping the pooled storage.
    pub fn drain(&mut self) -> std::vec::Drain<'_, Pointer> {
        self.entries_mut().drain(..)
    }

    /// Move every block (depth-first through nested sets) into `out`.
    /// The emptied sets go back to the pool.
    pub fn flatten_into(mut self, out: &mut Vec<HeapMemory>) {
        for entry in self.drain() {
            match entry {
                Pointer::Memory(block) => out.push(block),
                Pointer::Set(set) => set.flatten_into(out),
            }
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn entries_mut(&mut self) -> &mut Vec<Pointer> {
        self.entries.get_or_insert_with(Vec::new)
    }
}

impl fmt::Debug for PointerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PointerSet")
            .field("generation", &self.generation)
            .field("entries", &self.entries)
            .finish()
    }
}

impl Drop for PointerSet {
    fn drop(&mut self) {
        if let Some(entries) = self.entries.take() {
            self.pool.release_set(entries, self.generation);
        }
    }
}
