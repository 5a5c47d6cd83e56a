//! Best-fit memory allocator over anonymous memory mappings.
//!
//! Memory is obtained from the OS in page-aligned regions and carved into
//! chunks, each with a header right below its payload. Free chunks are kept in
//! a size-ordered tree and handed out best fit; released chunks merge with
//! their free neighbors immediately. Regions are never given back while the
//! heap lives.
//!
//! Use a [`Heap`] directly for an independent instance, or the process-wide
//! heap through the free functions ([`allocate`], [`release`], ...), through
//! [`GlobalHeap`] or, with the `c_api` feature, through `extern "C"` symbols.
//!
//! ```
//! let mut heap = bestfit::Heap::new();
//! let ptr = heap.allocate(42).unwrap();
//! assert!(heap.is_allocated(ptr.as_ptr()));
//! assert!(unsafe { heap.allocated_size(ptr.as_ptr()) } >= 42);
//! unsafe { heap.release(ptr.as_ptr()) };
//! assert_eq!(heap.total_allocated(), 0);
//! ```

#![allow(clippy::missing_safety_doc)]

use core::{
  alloc::{GlobalAlloc, Layout},
  ptr::null_mut,
};

mod arena;
mod chunk;
mod config;
mod error;
mod heap;
mod os;
mod registry;
mod sync;
mod tree;

pub use chunk::{ALIGNMENT, HEADER_SIZE};
pub use config::HeapConfig;
pub use error::{AllocError, InvariantViolation, Violation};
pub use heap::{Heap, HeapStats};
pub use os::{Mmap, RegionSource};

use sync::Locked;

// =============================================================================
// Process-wide heap
// =============================================================================

// Quiet: a logger that allocates must never re-enter this heap.
static GLOBAL: Locked<Heap> = Locked::new(Heap::with_config(HeapConfig::quiet()));

/// Allocates `size` bytes from the process-wide heap. Null on failure.
pub fn allocate(size: usize) -> *mut u8 {
  GLOBAL
    .lock()
    .allocate(size)
    .map_or(null_mut(), |ptr| ptr.as_ptr())
}

/// Resizes an allocation of the process-wide heap. Null on failure, in which
/// case `ptr` stays valid.
pub unsafe fn reallocate(ptr: *mut u8, size: usize) -> *mut u8 {
  unsafe { GLOBAL.lock().reallocate(ptr, size) }.map_or(null_mut(), |ptr| ptr.as_ptr())
}

/// Returns an allocation to the process-wide heap. Null is a no-op.
pub unsafe fn release(ptr: *mut u8) {
  unsafe { GLOBAL.lock().release(ptr) }
}

/// Usable size of a process-wide allocation, 0 for null.
pub unsafe fn allocated_size(ptr: *const u8) -> usize {
  unsafe { GLOBAL.lock().allocated_size(ptr) }
}

/// Whether `ptr` is the start of a live process-wide allocation.
pub fn is_allocated(ptr: *const u8) -> bool {
  GLOBAL.lock().is_allocated(ptr)
}

/// Usable bytes currently allocated from the process-wide heap.
pub fn total_allocated() -> usize {
  GLOBAL.lock().total_allocated()
}

pub fn stats() -> HeapStats {
  GLOBAL.lock().stats()
}

/// Runs [`Heap::check`] on the process-wide heap.
pub fn check() -> Result<(), InvariantViolation> {
  GLOBAL.lock().check()
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// [`GlobalAlloc`] front end of the process-wide heap.
///
/// Alignments above [`ALIGNMENT`] are not supported and fail with null.
pub struct GlobalHeap;

unsafe impl GlobalAlloc for GlobalHeap {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return null_mut();
    }
    allocate(layout.size())
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { release(ptr) }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return null_mut();
    }
    unsafe { reallocate(ptr, new_size) }
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return null_mut();
    }
    GLOBAL
      .lock()
      .allocate_zeroed(layout.size())
      .map_or(null_mut(), |ptr| ptr.as_ptr())
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bestfit_malloc(size: usize) -> *mut u8 {
  allocate(size)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bestfit_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  unsafe { reallocate(ptr, size) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bestfit_free(ptr: *mut u8) {
  unsafe { release(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bestfit_alloc_size(ptr: *mut u8) -> usize {
  unsafe { allocated_size(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn bestfit_allocated(ptr: *mut u8) -> bool {
  is_allocated(ptr)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn bestfit_total_allocated() -> usize {
  total_allocated()
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bestfit_calloc(nmemb: usize, size: usize) -> *mut u8 {
  let Some(total) = nmemb.checked_mul(size) else {
    return null_mut();
  };
  let ptr = allocate(total);
  if !ptr.is_null() {
    unsafe { core::ptr::write_bytes(ptr, 0, total) }
  }
  ptr
}
