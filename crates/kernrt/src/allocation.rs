//! Allocation seam. Storage management itself lives outside the engine; the
//! engine only needs geometry and the current backing buffer.

use std::cell::UnsafeCell;
use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Dims {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dims {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }
}

pub trait Allocation: Send + Sync {
    /// Extents; an unallocated higher dimension is 0.
    fn dims(&self) -> Dims;

    fn element_size_bytes(&self) -> usize;

    /// Bytes between consecutive rows of the base level.
    fn row_stride_bytes(&self) -> usize;

    /// Base of the backing buffer, or null while nothing is attached (for
    /// example an I/O allocation without a surface).
    fn backing_ptr(&self) -> *mut u8;
}

/// Heap-backed allocation with a tightly packed layout.
pub struct HostAllocation {
    dims: Dims,
    element_size: usize,
    buf: Box<[UnsafeCell<u8>]>,
}

// Kernels write through the raw backing pointer; callers serialize host-side
// access against dispatch.
unsafe impl Sync for HostAllocation {}

impl HostAllocation {
    pub fn new(dims: Dims, element_size: usize) -> Self {
        let len = dims.x.max(1) as usize
            * dims.y.max(1) as usize
            * dims.z.max(1) as usize
            * element_size;
        let buf = (0..len).map(|_| UnsafeCell::new(0u8)).collect();
        Self {
            dims,
            element_size,
            buf,
        }
    }

    pub fn from_bytes(dims: Dims, element_size: usize, bytes: &[u8]) -> Self {
        let alloc = Self::new(dims, element_size);
        let n = bytes.len().min(alloc.buf.len());
        // SAFETY: the allocation was just created and is not shared yet.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), alloc.backing_ptr(), n) };
        alloc
    }

    pub fn len_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Copy of the current contents.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.buf.len()];
        // SAFETY: the buffer is `len` bytes; no launch is running per the
        // caller contract.
        unsafe { std::ptr::copy_nonoverlapping(self.backing_ptr(), out.as_mut_ptr(), out.len()) };
        out
    }
}

impl Allocation for HostAllocation {
    fn dims(&self) -> Dims {
        self.dims
    }

    fn element_size_bytes(&self) -> usize {
        self.element_size
    }

    fn row_stride_bytes(&self) -> usize {
        self.dims.x.max(1) as usize * self.element_size
    }

    fn backing_ptr(&self) -> *mut u8 {
        if self.buf.is_empty() {
            return std::ptr::null_mut();
        }
        UnsafeCell::raw_get(self.buf.as_ptr())
    }
}

impl fmt::Debug for HostAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostAllocation")
            .field("dims", &self.dims)
            .field("element_size", &self.element_size)
            .field("len", &self.buf.len())
            .finish()
    }
}
