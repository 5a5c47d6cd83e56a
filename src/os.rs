use core::ptr::{NonNull, null_mut};
use std::io;

/// Source of fresh address space for a heap.
///
/// # Safety
///
/// `map` must return a region of at least `len` bytes that is aligned to
/// `page_size()`, readable, writable, zero-filled and not aliased by anything
/// else until it is passed back to `unmap`. `page_size()` must be a power of
/// two that is a multiple of [`ALIGNMENT`](crate::ALIGNMENT) and must not change.
pub unsafe trait RegionSource {
  /// Granularity of mapped regions.
  fn page_size(&self) -> usize;

  /// Reserves `len` bytes, a multiple of `page_size()`.
  fn map(&mut self, len: usize) -> io::Result<NonNull<u8>>;

  /// Gives back a region previously returned by `map` with the same `len`.
  ///
  /// # Safety
  ///
  /// Nothing may access the region afterwards.
  unsafe fn unmap(&mut self, base: NonNull<u8>, len: usize) -> io::Result<()>;
}

/// Anonymous private memory mappings from the kernel.
#[derive(Clone, Copy, Default, Debug)]
pub struct Mmap;

unsafe impl RegionSource for Mmap {
  fn page_size(&self) -> usize {
    page_size()
  }

  fn map(&mut self, len: usize) -> io::Result<NonNull<u8>> {
    let ptr = unsafe { os_mmap(len) };
    NonNull::new(ptr).ok_or_else(io::Error::last_os_error)
  }

  unsafe fn unmap(&mut self, base: NonNull<u8>, len: usize) -> io::Result<()> {
    if unsafe { libc::munmap(base.as_ptr().cast(), len) } != 0 {
      return Err(io::Error::last_os_error());
    }
    Ok(())
  }
}

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

/// OS page size, falling back to 4 KiB if `sysconf` has no answer.
fn page_size() -> usize {
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size > 0 { size as usize } else { 4096 }
}
