//! Fiber stack allocation
//!
//! Allocation strategy is pluggable so fiber logic never cares where
//! stack memory comes from. Two strategies are provided:
//!
//! - [`MallocStack`]: plain heap allocation, no overflow protection.
//! - [`MmapStack`]: anonymous mapping with a PROT_NONE guard page at
//!   the low end, so overflow faults instead of corrupting the heap.
//!   This is the default.

use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use strand_core::{StrandError, StrandResult};

/// Guard page size for mmap-backed stacks (one page).
const GUARD_SIZE: usize = 4096;

const PAGE_SIZE: usize = 4096;

#[inline]
fn page_align(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Strategy providing raw memory blocks for fiber stacks.
///
/// `alloc` returns a pointer to the low end of a usable region of at
/// least `size` bytes; any bookkeeping (guard pages, rounding) is the
/// allocator's own business and must be undone by `dealloc`.
pub trait StackAllocator: Send + Sync {
    fn alloc(&self, size: usize) -> StrandResult<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must have come from `alloc` on the same allocator with
    /// the same `size`, and must not be used afterwards.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, size: usize);
}

/// Heap-backed stacks via malloc/free.
pub struct MallocStack;

impl StackAllocator for MallocStack {
    fn alloc(&self, size: usize) -> StrandResult<NonNull<u8>> {
        let ptr = unsafe { libc::malloc(size) };
        NonNull::new(ptr as *mut u8).ok_or(StrandError::StackAllocation)
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, _size: usize) {
        libc::free(ptr.as_ptr() as *mut libc::c_void);
    }
}

/// mmap-backed stacks with a guard page below the usable region.
pub struct MmapStack;

impl StackAllocator for MmapStack {
    fn alloc(&self, size: usize) -> StrandResult<NonNull<u8>> {
        let usable = page_align(size);
        let total = usable + GUARD_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StrandError::StackAllocation);
        }

        // Guard page at the low end remains unmapped-equivalent:
        // overflow past the stack bottom raises SIGSEGV.
        let ret = unsafe { libc::mprotect(base, GUARD_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            unsafe { libc::munmap(base, total) };
            return Err(StrandError::StackAllocation);
        }

        let usable_base = unsafe { (base as *mut u8).add(GUARD_SIZE) };
        // base came from a successful mmap, so usable_base is non-null
        Ok(unsafe { NonNull::new_unchecked(usable_base) })
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, size: usize) {
        let usable = page_align(size);
        let base = ptr.as_ptr().sub(GUARD_SIZE);
        libc::munmap(base as *mut libc::c_void, usable + GUARD_SIZE);
    }
}

/// The allocator used when none is supplied explicitly.
pub fn default_allocator() -> Arc<dyn StackAllocator> {
    static DEFAULT: OnceLock<Arc<dyn StackAllocator>> = OnceLock::new();
    DEFAULT.get_or_init(|| Arc::new(MmapStack)).clone()
}

/// An exclusively owned stack buffer, released on drop.
pub struct Stack {
    ptr: NonNull<u8>,
    size: usize,
    allocator: Arc<dyn StackAllocator>,
}

impl Stack {
    pub fn alloc(allocator: Arc<dyn StackAllocator>, size: usize) -> StrandResult<Self> {
        let ptr = allocator.alloc(size)?;
        Ok(Self {
            ptr,
            size,
            allocator,
        })
    }

    /// High end of the usable region (stacks grow down).
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.ptr.as_ptr().add(self.size) }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { self.allocator.dealloc(self.ptr, self.size) };
    }
}
