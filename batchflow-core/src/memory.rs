//! Process-wide memory pools for host, pinned and device memory
//!
//! Each pool owns a set of segments obtained from the system allocator.
//! Allocations are carved out of free ranges inside segments and returned
//! to the segment on drop, so steady-state iterations do not hit the
//! system allocator. Segments with no live allocation can be handed back
//! with [`MemoryPool::release_unused`], except for the capacity pinned by
//! the last preallocation request.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::MemoryKind;

/// Alignment and size granularity of every pool allocation
pub const POOL_ALIGNMENT: usize = 256;

/// Environment variable holding the number of emulated devices
const DEVICE_COUNT_ENV: &str = "BATCHFLOW_DEVICE_COUNT";

/// Memory usage statistics for a memory pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryPoolStats {
    /// Bytes currently obtained from the system
    pub reserved_bytes: usize,

    /// Bytes handed out to live allocations
    pub live_bytes: usize,

    /// Highest value `reserved_bytes` ever reached
    pub peak_reserved_bytes: usize,

    /// Capacity kept by `release_unused` because of preallocation
    pub preallocated_floor: usize,

    /// Number of allocation requests served
    pub total_allocations: usize,

    /// Number of segments obtained from the system
    pub system_allocations: usize,

    /// Number of segments returned to the system
    pub system_releases: usize,
}

impl MemoryPoolStats {
    /// Bytes reserved but not handed out
    pub fn free_bytes(&self) -> usize {
        self.reserved_bytes.saturating_sub(self.live_bytes)
    }
}

/// Free region inside a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRange {
    offset: usize,
    size: usize,
}

impl FreeRange {
    fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// One system allocation
struct Segment {
    base: NonNull<u8>,
    size: usize,
    live_bytes: usize,
    /// Sorted by offset, never adjacent
    free: Vec<FreeRange>,
}

// Segments are only touched under the pool mutex.
unsafe impl Send for Segment {}

impl Segment {
    fn allocate(size: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size, POOL_ALIGNMENT).ok()?;
        // Safety: size is non-zero (rounded up to POOL_ALIGNMENT by the caller)
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr).map(|base| Self {
            base,
            size,
            live_bytes: 0,
            free: vec![FreeRange { offset: 0, size }],
        })
    }

    fn release(self) {
        // Safety: base was allocated in `Segment::allocate` with this exact layout
        unsafe {
            dealloc(
                self.base.as_ptr(),
                Layout::from_size_align_unchecked(self.size, POOL_ALIGNMENT),
            );
        }
    }

    fn largest_free(&self) -> usize {
        self.free.iter().map(|r| r.size).max().unwrap_or(0)
    }

    /// Index of the smallest free range able to hold `size`
    fn best_fit(&self, size: usize) -> Option<(usize, usize)> {
        self.free
            .iter()
            .enumerate()
            .filter(|(_, r)| r.size >= size)
            .min_by_key(|(_, r)| r.size)
            .map(|(i, r)| (i, r.size))
    }

    fn take(&mut self, index: usize, size: usize) -> usize {
        let range = &mut self.free[index];
        let offset = range.offset;
        range.offset += size;
        range.size -= size;
        if range.size == 0 {
            self.free.remove(index);
        }
        self.live_bytes += size;
        offset
    }

    fn give_back(&mut self, offset: usize, size: usize) {
        self.live_bytes -= size;
        let pos = self.free.partition_point(|r| r.offset < offset);
        self.free.insert(pos, FreeRange { offset, size });

        // Coalesce with the following range, then with the preceding one
        if pos + 1 < self.free.len() && self.free[pos].end() == self.free[pos + 1].offset {
            self.free[pos].size += self.free[pos + 1].size;
            self.free.remove(pos + 1);
        }
        if pos > 0 && self.free[pos - 1].end() == self.free[pos].offset {
            self.free[pos - 1].size += self.free[pos].size;
            self.free.remove(pos);
        }
    }
}

struct PoolState {
    segments: BTreeMap<u64, Segment>,
    next_segment: u64,
    stats: MemoryPoolStats,
    capacity_limit: Option<usize>,
}

impl PoolState {
    fn release_segments(&mut self, keep_floor: bool) -> usize {
        let mut idle: Vec<(u64, usize)> = self
            .segments
            .iter()
            .filter(|(_, s)| s.live_bytes == 0)
            .map(|(id, s)| (*id, s.size))
            .collect();
        idle.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let floor = if keep_floor { self.stats.preallocated_floor } else { 0 };
        let mut kept = 0;
        let mut released = 0;
        for (id, size) in idle {
            if kept < floor {
                kept += size;
                continue;
            }
            if let Some(segment) = self.segments.remove(&id) {
                segment.release();
                released += size;
                self.stats.reserved_bytes -= size;
                self.stats.system_releases += 1;
            }
        }
        released
    }

    fn idle_bytes(&self) -> usize {
        self.segments
            .values()
            .filter(|s| s.live_bytes == 0)
            .map(|s| s.size)
            .sum()
    }

    /// Add a segment of `size` bytes. Idle segments are released when the
    /// capacity limit requires it or when `release_idle` is set, and only
    /// once the new segment is in hand; a failure leaves the pool untouched.
    fn grow(&mut self, size: usize, kind: MemoryKind, release_idle: bool) -> Result<u64> {
        let failed = || Error::MemoryAllocationFailed {
            requested: size,
            memory: kind.to_string(),
        };
        let over_limit = match self.capacity_limit {
            Some(limit) => {
                let busy = self.stats.reserved_bytes - self.idle_bytes();
                if busy + size > limit {
                    return Err(failed());
                }
                self.stats.reserved_bytes + size > limit
            }
            None => false,
        };

        let segment = Segment::allocate(size).ok_or_else(failed)?;
        if over_limit || release_idle {
            self.release_segments(false);
        }
        let id = self.next_segment;
        self.next_segment += 1;
        self.segments.insert(id, segment);
        self.stats.reserved_bytes += size;
        self.stats.system_allocations += 1;
        self.stats.peak_reserved_bytes =
            self.stats.peak_reserved_bytes.max(self.stats.reserved_bytes);
        debug!(memory = %kind, bytes = size, "memory pool grew");
        Ok(id)
    }
}

/// Pool for one kind of memory
pub struct MemoryPool {
    kind: MemoryKind,
    state: Mutex<PoolState>,
}

impl MemoryPool {
    /// Create an empty pool
    pub fn new(kind: MemoryKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            state: Mutex::new(PoolState {
                segments: BTreeMap::new(),
                next_segment: 0,
                stats: MemoryPoolStats::default(),
                capacity_limit: None,
            }),
        })
    }

    /// Memory kind served by this pool
    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    /// Cap the bytes this pool may reserve, emulating a finite device
    pub fn set_capacity_limit(&self, limit: Option<usize>) {
        self.state.lock().capacity_limit = limit;
    }

    /// Allocate `size` bytes; contents are unspecified
    pub fn allocate(self: &Arc<Self>, size: usize) -> Result<PoolBlock> {
        let size = round_up(size.max(1))?;
        let mut state = self.state.lock();

        let best = state
            .segments
            .iter()
            .filter_map(|(id, s)| s.best_fit(size).map(|(idx, fit)| (fit, *id, idx)))
            .min();

        let (segment_id, range_index) = match best {
            Some((_, id, idx)) => (id, idx),
            None => {
                let id = state.grow(size, self.kind, false)?;
                (id, 0)
            }
        };

        let segment = state
            .segments
            .get_mut(&segment_id)
            .ok_or_else(|| Error::Execution("memory segment vanished".into()))?;
        let offset = segment.take(range_index, size);
        // Safety: offset + size lies inside the segment
        let ptr = unsafe { NonNull::new_unchecked(segment.base.as_ptr().add(offset)) };

        state.stats.live_bytes += size;
        state.stats.total_allocations += 1;

        Ok(PoolBlock {
            pool: Arc::clone(self),
            segment: segment_id,
            offset,
            size,
            ptr,
        })
    }

    fn recycle(&self, segment_id: u64, offset: usize, size: usize) {
        let mut state = self.state.lock();
        match state.segments.get_mut(&segment_id) {
            Some(segment) => {
                segment.give_back(offset, size);
                state.stats.live_bytes -= size;
            }
            None => warn!(memory = %self.kind, segment = segment_id, "recycled block of unknown segment"),
        }
    }

    /// Make sure `bytes` can later be allocated without a system call.
    ///
    /// Allocates a segment of exactly `bytes` unless a large enough free
    /// range already exists; idle segments too small to serve the request
    /// are returned to the system in exchange. The request also becomes the
    /// floor kept by [`MemoryPool::release_unused`]. On failure the pool is
    /// unchanged.
    pub fn preallocate(&self, bytes: usize) -> Result<()> {
        let size = round_up(bytes.max(1))?;
        let mut state = self.state.lock();
        let largest = state.segments.values().map(Segment::largest_free).max().unwrap_or(0);
        if largest < size {
            state.grow(size, self.kind, true)?;
        }
        state.stats.preallocated_floor = size;
        info!(memory = %self.kind, bytes = size, "preallocated pool capacity");
        Ok(())
    }

    /// Return idle segments to the system, keeping the preallocated floor.
    /// Returns the number of bytes released.
    pub fn release_unused(&self) -> usize {
        let released = self.state.lock().release_segments(true);
        if released > 0 {
            debug!(memory = %self.kind, bytes = released, "released unused pool memory");
        }
        released
    }

    /// Current statistics
    pub fn stats(&self) -> MemoryPoolStats {
        self.state.lock().stats.clone()
    }
}

fn round_up(size: usize) -> Result<usize> {
    size.checked_add(POOL_ALIGNMENT - 1)
        .map(|s| s / POOL_ALIGNMENT * POOL_ALIGNMENT)
        .ok_or_else(|| Error::LayoutError(format!("allocation of {size} bytes overflows")))
}

/// Allocation handed out by a [`MemoryPool`], returned to it on drop
pub struct PoolBlock {
    pool: Arc<MemoryPool>,
    segment: u64,
    offset: usize,
    size: usize,
    ptr: NonNull<u8>,
}

impl PoolBlock {
    /// Start of the block
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Usable size (rounded up to [`POOL_ALIGNMENT`])
    pub fn size(&self) -> usize {
        self.size
    }

    /// Memory kind of the owning pool
    pub fn kind(&self) -> MemoryKind {
        self.pool.kind
    }
}

impl std::fmt::Debug for PoolBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBlock")
            .field("kind", &self.pool.kind)
            .field("segment", &self.segment)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for PoolBlock {
    fn drop(&mut self) {
        self.pool.recycle(self.segment, self.offset, self.size);
    }
}

// The block is exclusively owned; access is governed by `Buffer`.
unsafe impl Send for PoolBlock {}
unsafe impl Sync for PoolBlock {}

/// The process-wide set of pools
pub struct MemoryPools {
    host: Arc<MemoryPool>,
    pinned: Arc<MemoryPool>,
    devices: Mutex<HashMap<i32, Arc<MemoryPool>>>,
    device_count: i32,
}

static POOLS: Lazy<MemoryPools> = Lazy::new(|| {
    let device_count = std::env::var(DEVICE_COUNT_ENV)
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
        .filter(|n| *n >= 0)
        .unwrap_or(1);
    MemoryPools {
        host: MemoryPool::new(MemoryKind::Host),
        pinned: MemoryPool::new(MemoryKind::Pinned),
        devices: Mutex::new(HashMap::new()),
        device_count,
    }
});

/// Access the process-wide pools
pub fn pools() -> &'static MemoryPools {
    &POOLS
}

impl MemoryPools {
    /// Number of devices visible to this process
    pub fn device_count(&self) -> i32 {
        self.device_count
    }

    /// Pool serving the given memory kind
    pub fn pool(&self, kind: MemoryKind) -> Result<Arc<MemoryPool>> {
        match kind {
            MemoryKind::Host => Ok(Arc::clone(&self.host)),
            MemoryKind::Pinned => Ok(Arc::clone(&self.pinned)),
            MemoryKind::Device(id) => {
                if id < 0 || id >= self.device_count {
                    return Err(Error::InvalidArgument(format!(
                        "device {id} does not exist ({} visible)",
                        self.device_count
                    )));
                }
                let mut devices = self.devices.lock();
                Ok(Arc::clone(
                    devices.entry(id).or_insert_with(|| MemoryPool::new(kind)),
                ))
            }
        }
    }

    /// Release idle memory of every pool
    pub fn release_unused(&self) -> usize {
        let devices: Vec<Arc<MemoryPool>> = self.devices.lock().values().cloned().collect();
        let mut released = self.host.release_unused() + self.pinned.release_unused();
        for pool in devices {
            released += pool.release_unused();
        }
        released
    }
}

/// Free unused memory from all pools (host, pinned and every device)
pub fn release_unused_memory() -> usize {
    pools().release_unused()
}

/// Preallocate device memory; a negative id selects the default device
pub fn preallocate_device_memory(bytes: usize, device_id: i32) -> Result<()> {
    let device_id = device_id.max(0);
    pools().pool(MemoryKind::Device(device_id))?.preallocate(bytes)
}

/// Preallocate pinned host memory
pub fn preallocate_pinned_memory(bytes: usize) -> Result<()> {
    pools().pool(MemoryKind::Pinned)?.preallocate(bytes)
}
