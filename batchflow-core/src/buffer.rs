//! Reference-counted byte buffers with zero-copy slicing
//!
//! A [`Buffer`] is a view (`offset`, `len`) into shared storage. Storage
//! comes from a memory pool, from an owned vector, or from caller memory
//! adopted without a copy. Clones and slices share the storage; mutable
//! access is only granted while the storage is uniquely referenced.

use std::fmt;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::memory::{pools, MemoryPool, PoolBlock};
use crate::types::MemoryKind;

enum Storage {
    /// Allocation from a memory pool, recycled when the last view drops
    Pooled(PoolBlock),

    /// Plain host vector
    Owned(Vec<u8>),

    /// Caller memory adopted without a copy; read-only
    Foreign { ptr: NonNull<u8>, len: usize },
}

// Foreign memory is valid for the lifetime of the storage by contract of
// `Buffer::from_raw_parts`, and is never written through this type.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Storage {
    fn base(&self) -> *const u8 {
        match self {
            Storage::Pooled(block) => block.as_ptr(),
            Storage::Owned(vec) => vec.as_ptr(),
            Storage::Foreign { ptr, .. } => ptr.as_ptr(),
        }
    }

    fn capacity(&self) -> usize {
        match self {
            Storage::Pooled(block) => block.size(),
            Storage::Owned(vec) => vec.len(),
            Storage::Foreign { len, .. } => *len,
        }
    }
}

/// Shared view into host, pinned or device memory
#[derive(Clone)]
pub struct Buffer {
    storage: Arc<Storage>,
    offset: usize,
    len: usize,
    memory: MemoryKind,
}

impl Buffer {
    /// Allocate `len` bytes from the process-wide pool for `memory`
    pub fn allocate(memory: MemoryKind, len: usize) -> Result<Self> {
        let pool = pools().pool(memory)?;
        Self::allocate_in(&pool, len)
    }

    /// Allocate `len` bytes from a specific pool
    pub fn allocate_in(pool: &Arc<MemoryPool>, len: usize) -> Result<Self> {
        let block = pool.allocate(len)?;
        Ok(Self {
            memory: block.kind(),
            storage: Arc::new(Storage::Pooled(block)),
            offset: 0,
            len,
        })
    }

    /// Wrap a host vector without copying
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            storage: Arc::new(Storage::Owned(data)),
            offset: 0,
            len,
            memory: MemoryKind::Host,
        }
    }

    /// Copy `data` into a fresh pool allocation of the given memory kind
    pub fn copy_from_slice(memory: MemoryKind, data: &[u8]) -> Result<Self> {
        let mut buffer = Self::allocate(memory, data.len())?;
        buffer.as_mut_slice()?.copy_from_slice(data);
        Ok(buffer)
    }

    /// Adopt caller memory without copying.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `len` bytes and must stay valid and
    /// unmodified until every clone and slice of the returned buffer is
    /// dropped.
    pub unsafe fn from_raw_parts(ptr: *const u8, len: usize, memory: MemoryKind) -> Result<Self> {
        let ptr = if len == 0 {
            NonNull::dangling()
        } else {
            NonNull::new(ptr.cast_mut())
                .ok_or_else(|| Error::InvalidArgument("null data pointer".into()))?
        };
        Ok(Self {
            storage: Arc::new(Storage::Foreign { ptr, len }),
            offset: 0,
            len,
            memory,
        })
    }

    /// Number of bytes in this view
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the view is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Memory kind of the underlying storage
    pub fn memory(&self) -> MemoryKind {
        self.memory
    }

    /// Start of the view
    pub fn as_ptr(&self) -> *const u8 {
        // Safety: offset <= capacity of the storage
        unsafe { self.storage.base().add(self.offset) }
    }

    /// Bytes of the view
    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // Safety: the view lies inside the storage, which outlives `self`
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    /// Mutable bytes of the view; fails if the storage is shared or adopted
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        let (offset, len) = (self.offset, self.len);
        let storage = Arc::get_mut(&mut self.storage).ok_or_else(|| {
            Error::InvalidOperation("cannot mutate a shared buffer".into())
        })?;
        match storage {
            Storage::Owned(vec) => Ok(&mut vec[offset..offset + len]),
            Storage::Pooled(block) => {
                if len == 0 {
                    return Ok(&mut []);
                }
                // Safety: unique access to the block, view lies inside it
                Ok(unsafe { std::slice::from_raw_parts_mut(block.as_ptr().add(offset), len) })
            }
            Storage::Foreign { .. } => Err(Error::InvalidOperation(
                "buffer adopted from caller memory is read-only".into(),
            )),
        }
    }

    /// Sub-view sharing the same storage
    pub fn slice(&self, range: Range<usize>) -> Result<Self> {
        if range.start > range.end || range.end > self.len {
            return Err(Error::InvalidArgument(format!(
                "slice {}..{} out of bounds for buffer of {} bytes",
                range.start, range.end, self.len
            )));
        }
        Ok(Self {
            storage: Arc::clone(&self.storage),
            offset: self.offset + range.start,
            len: range.end - range.start,
            memory: self.memory,
        })
    }

    /// Whether both views cover exactly the same memory region
    pub fn same_region(&self, other: &Buffer) -> bool {
        self.as_ptr() == other.as_ptr() && self.len == other.len
    }

    /// Number of views sharing the storage
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.storage)
    }

    /// Bytes reserved by the underlying storage
    pub fn reserved_bytes(&self) -> usize {
        self.storage.capacity()
    }

    /// Whether the buffer adopts caller memory
    pub fn is_foreign(&self) -> bool {
        matches!(*self.storage, Storage::Foreign { .. })
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("memory", &self.memory)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("foreign", &self.is_foreign())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_shares_storage() {
        let buffer = Buffer::from_vec((0u8..16).collect());
        let tail = buffer.slice(8..16).unwrap();
        assert_eq!(tail.as_slice(), &[8, 9, 10, 11, 12, 13, 14, 15]);
        assert_eq!(buffer.ref_count(), 2);
        assert!(buffer.slice(4..20).is_err());
    }

    #[test]
    fn test_mutation_requires_unique_storage() {
        let mut buffer = Buffer::allocate(MemoryKind::Host, 4).unwrap();
        buffer.as_mut_slice().unwrap().copy_from_slice(&[1, 2, 3, 4]);
        let shared = buffer.clone();
        assert!(buffer.as_mut_slice().is_err());
        drop(shared);
        assert!(buffer.as_mut_slice().is_ok());
        assert_eq!(buffer.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_foreign_memory_is_not_copied() {
        let data = vec![7u8; 32];
        let buffer = unsafe { Buffer::from_raw_parts(data.as_ptr(), data.len(), MemoryKind::Host) }
            .unwrap();
        assert_eq!(buffer.as_ptr(), data.as_ptr());
        assert!(buffer.is_foreign());
        let mut copy = buffer.clone();
        drop(buffer);
        assert!(copy.as_mut_slice().is_err());
    }

    #[test]
    fn test_null_pointer_rejected() {
        let res = unsafe { Buffer::from_raw_parts(std::ptr::null(), 4, MemoryKind::Host) };
        assert!(res.is_err());
        let empty = unsafe { Buffer::from_raw_parts(std::ptr::null(), 0, MemoryKind::Host) };
        assert!(empty.unwrap().is_empty());
    }
}
