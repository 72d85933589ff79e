//! Recycling frame arena.
//!
//! Frames are addressed by slot index plus generation. Reference counts and the
//! free list share one pool-wide lock so a frame can never be recycled while a
//! handle still points at it. Storage is reused, never freed while the pool
//! lives.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crossbeam::utils::CachePadded;
use tracing::trace;

use crate::buffer::ByteBuffer;
use crate::capture::frame::Frame;
use crate::error::{Result, SdkError};

/// Called once when the last reference to a frame is released, before the
/// frame becomes available to the next `acquire`.
pub type ReturnHook = Box<dyn FnOnce(&Frame) + Send>;

struct FrameCell {
    frame: RwLock<Frame>,
    published: AtomicBool,
}

struct Slot {
    cell: Arc<FrameCell>,
    ref_count: u32,
    generation: u32,
    hook: Option<ReturnHook>,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

#[derive(Default)]
struct Stats {
    acquired: AtomicU64,
    recycled: AtomicU64,
    allocated: AtomicU64,
}

struct PoolShared {
    state: Mutex<PoolState>,
    stats: CachePadded<Stats>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub acquired: u64,
    pub recycled: u64,
    pub allocated: u64,
}

/// Unbounded pool of reusable frames. Cloning shares the same pool.
#[derive(Clone)]
pub struct FramePool {
    shared: Arc<PoolShared>,
}

impl FramePool {
    /// Creates a pool with `preallocate` frames of `capacity` bytes each.
    pub fn new(preallocate: usize, capacity: usize) -> Self {
        let mut state = PoolState::default();
        for index in 0..preallocate {
            state.slots.push(Slot {
                cell: Arc::new(FrameCell {
                    frame: RwLock::new(Frame {
                        data: ByteBuffer::with_capacity(capacity),
                        ..Frame::default()
                    }),
                    published: AtomicBool::new(false),
                }),
                ref_count: 0,
                generation: 0,
                hook: None,
            });
            state.free.push(index);
        }
        let stats = Stats::default();
        stats.allocated.store(preallocate as u64, Ordering::Relaxed);
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(state),
                stats: CachePadded::new(stats),
            }),
        }
    }

    /// Hands out a frame with at least `size` bytes of data capacity and a
    /// reference count of 1. Grows the pool when no free frame exists.
    pub fn acquire(&self, size: usize) -> FrameHandle {
        let (index, generation, cell) = {
            let mut state = self.shared.lock();
            let index = match state.free.pop() {
                Some(index) => index,
                None => {
                    state.slots.push(Slot {
                        cell: Arc::new(FrameCell {
                            frame: RwLock::new(Frame::default()),
                            published: AtomicBool::new(false),
                        }),
                        ref_count: 0,
                        generation: 0,
                        hook: None,
                    });
                    self.shared.stats.allocated.fetch_add(1, Ordering::Relaxed);
                    state.slots.len() - 1
                }
            };
            let slot = &mut state.slots[index];
            slot.ref_count = 1;
            slot.generation = slot.generation.wrapping_add(1);
            slot.hook = None;
            slot.cell.published.store(false, Ordering::Release);
            (index, slot.generation, Arc::clone(&slot.cell))
        };

        {
            // Nobody else can reach this slot yet.
            let mut frame = cell.frame.write().unwrap_or_else(PoisonError::into_inner);
            frame.reset();
            frame.data.ensure_capacity(size);
        }

        self.shared.stats.acquired.fetch_add(1, Ordering::Relaxed);
        trace!(index, generation, "frame acquired");
        FrameHandle {
            pool: Arc::clone(&self.shared),
            index,
            generation,
            cell,
        }
    }

    /// Total frames ever allocated by this pool.
    pub fn len(&self) -> usize {
        self.shared.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames ready for reuse.
    pub fn free_count(&self) -> usize {
        self.shared.lock().free.len()
    }

    pub fn stats(&self) -> PoolStats {
        let stats = &self.shared.stats;
        PoolStats {
            acquired: stats.acquired.load(Ordering::Relaxed),
            recycled: stats.recycled.load(Ordering::Relaxed),
            allocated: stats.allocated.load(Ordering::Relaxed),
        }
    }
}

/// Reference-counted handle to a pooled frame.
///
/// `clone` adds a reference; dropping releases one.
pub struct FrameHandle {
    pool: Arc<PoolShared>,
    index: usize,
    generation: u32,
    cell: Arc<FrameCell>,
}

impl FrameHandle {
    /// Shared access to the frame.
    pub fn read(&self) -> RwLockReadGuard<'_, Frame> {
        self.cell.frame.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access, only while this is the sole reference and the frame
    /// has not been published.
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Frame>> {
        if self.is_published() || self.ref_count() != 1 {
            return Err(SdkError::FrameBusy);
        }
        Ok(self.cell.frame.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Marks the frame immutable. Called when it is handed to consumers.
    pub fn publish(&self) {
        self.cell.published.store(true, Ordering::Release);
    }

    pub fn is_published(&self) -> bool {
        self.cell.published.load(Ordering::Acquire)
    }

    pub fn ref_count(&self) -> u32 {
        let state = self.pool.lock();
        let slot = &state.slots[self.index];
        debug_assert_eq!(slot.generation, self.generation);
        slot.ref_count
    }

    /// Installs the hook fired when the frame goes back to the pool. Replaces
    /// any previous hook.
    pub fn set_return_hook(&self, hook: ReturnHook) {
        let mut state = self.pool.lock();
        state.slots[self.index].hook = Some(hook);
    }

    /// Whether both handles point at the same live frame.
    pub fn same_frame(&self, other: &FrameHandle) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell) && self.generation == other.generation
    }
}

impl Clone for FrameHandle {
    fn clone(&self) -> Self {
        {
            let mut state = self.pool.lock();
            let slot = &mut state.slots[self.index];
            debug_assert_eq!(slot.generation, self.generation);
            slot.ref_count += 1;
        }
        Self {
            pool: Arc::clone(&self.pool),
            index: self.index,
            generation: self.generation,
            cell: Arc::clone(&self.cell),
        }
    }
}

impl Drop for FrameHandle {
    fn drop(&mut self) {
        let hook = {
            let mut state = self.pool.lock();
            let slot = &mut state.slots[self.index];
            debug_assert_eq!(slot.generation, self.generation);
            slot.ref_count -= 1;
            if slot.ref_count > 0 {
                return;
            }
            match slot.hook.take() {
                Some(hook) => hook,
                None => {
                    state.free.push(self.index);
                    self.pool.stats.recycled.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        };

        // The slot is off the free list until the hook returns.
        hook(&self.read());
        self.pool.lock().free.push(self.index);
        self.pool.stats.recycled.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHandle")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("published", &self.is_published())
            .finish()
    }
}
