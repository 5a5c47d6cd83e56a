use core::{mem::size_of, ptr::null_mut};

// =============================================================================
// Constants
// =============================================================================

/// Alignment granularity of every chunk size and every payload pointer.
pub const ALIGNMENT: usize = 16;

/// Bytes of header in front of each payload.
pub const HEADER_SIZE: usize = size_of::<Chunk>();

/// Smallest payload a chunk can carry. Zero-byte requests are rounded up to this.
pub(crate) const MIN_PAYLOAD: usize = ALIGNMENT;

/// Smallest leftover that `split` turns into a separate free chunk.
pub(crate) const MIN_FRAGMENT: usize = HEADER_SIZE + MIN_PAYLOAD;

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(HEADER_SIZE % ALIGNMENT == 0);
const _: () = assert!(core::mem::align_of::<Chunk>() == ALIGNMENT);

// =============================================================================
// Types
// =============================================================================

/// What the two link words of a chunk mean.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ChunkState {
  /// Children in the free-chunk tree.
  Free { left: *mut Chunk, right: *mut Chunk },
  /// Next entry in the allocation registry.
  Allocated { next: *mut Chunk },
}

impl ChunkState {
  /// A free chunk that is not linked into the tree.
  pub(crate) const DETACHED: ChunkState = ChunkState::Free {
    left: null_mut(),
    right: null_mut(),
  };

  /// An allocated chunk that is not linked into the registry.
  pub(crate) const CLAIMED: ChunkState = ChunkState::Allocated { next: null_mut() };
}

/// Chunk header. Sits immediately before the payload it describes.
///
/// ```text
///   ┌──────────────────────────────┬───────────────────────────┐
///   │ size │ prev_size │ first/last │ state (tag + 2 links)     │ payload (size bytes) ...
///   └──────────────────────────────┴───────────────────────────┘
///   ▲                                                           ▲
///   chunk                                                       Chunk::payload(chunk)
/// ```
///
/// `prev_size` together with `first` and `last` are the boundary tags: the
/// neighbor above is `chunk + HEADER_SIZE + size` unless `last`, the neighbor
/// below is `chunk - HEADER_SIZE - prev_size` unless `first`.
#[repr(C, align(16))]
pub(crate) struct Chunk {
  /// Usable payload bytes. Always a multiple of `ALIGNMENT`.
  pub(crate) size: usize,
  /// Payload size of the chunk directly below. Meaningless when `first`.
  prev_size: usize,
  /// Lowest chunk of its region.
  first: bool,
  /// Highest chunk of its region.
  last: bool,
  pub(crate) state: ChunkState,
}

impl Chunk {
  /// Writes a fresh header at `at` and returns it.
  ///
  /// `prev_size` is `None` for the first chunk of a region.
  pub(crate) unsafe fn write(
    at: *mut u8,
    size: usize,
    prev_size: Option<usize>,
    last: bool,
    state: ChunkState,
  ) -> *mut Chunk {
    debug_assert!(at as usize % ALIGNMENT == 0, "misaligned chunk at {at:p}");
    debug_assert!(size % ALIGNMENT == 0, "misaligned chunk size {size}");

    let chunk = at.cast::<Chunk>();
    unsafe {
      chunk.write(Chunk {
        size,
        prev_size: prev_size.unwrap_or(0),
        first: prev_size.is_none(),
        last,
        state,
      })
    };
    chunk
  }

  /// Start of the payload owned by `chunk`.
  #[inline]
  pub(crate) fn payload(chunk: *mut Chunk) -> *mut u8 {
    chunk.cast::<u8>().wrapping_add(HEADER_SIZE)
  }

  /// Header of the payload starting at `ptr`. The inverse of [`Chunk::payload`].
  #[inline]
  pub(crate) fn from_payload(ptr: *mut u8) -> *mut Chunk {
    ptr.wrapping_sub(HEADER_SIZE).cast::<Chunk>()
  }

  /// One past the last payload byte.
  #[inline]
  pub(crate) unsafe fn end(chunk: *mut Chunk) -> *mut u8 {
    Chunk::payload(chunk).wrapping_add(unsafe { (*chunk).size })
  }

  #[inline]
  pub(crate) unsafe fn is_free(chunk: *mut Chunk) -> bool {
    matches!(unsafe { (*chunk).state }, ChunkState::Free { .. })
  }

  #[inline]
  pub(crate) unsafe fn is_first(chunk: *mut Chunk) -> bool {
    unsafe { (*chunk).first }
  }

  #[inline]
  pub(crate) unsafe fn is_last(chunk: *mut Chunk) -> bool {
    unsafe { (*chunk).last }
  }

  /// Recorded payload size of the neighbor below, `None` at the region start.
  #[inline]
  pub(crate) unsafe fn prev_size(chunk: *mut Chunk) -> Option<usize> {
    unsafe {
      if (*chunk).first {
        None
      } else {
        Some((*chunk).prev_size)
      }
    }
  }

  /// Address-adjacent chunk above `chunk`, if it is not the last in its region.
  #[inline]
  pub(crate) unsafe fn next(chunk: *mut Chunk) -> Option<*mut Chunk> {
    unsafe {
      if (*chunk).last {
        None
      } else {
        Some(Chunk::end(chunk).cast::<Chunk>())
      }
    }
  }

  /// Address-adjacent chunk below `chunk`, if it is not the first in its region.
  #[inline]
  pub(crate) unsafe fn prev(chunk: *mut Chunk) -> Option<*mut Chunk> {
    unsafe {
      Chunk::prev_size(chunk).map(|prev_size| {
        chunk
          .cast::<u8>()
          .sub(HEADER_SIZE + prev_size)
          .cast::<Chunk>()
      })
    }
  }

  /// Shrinks `chunk` to `size` payload bytes and carves the leftover into a
  /// new detached free chunk, which is returned.
  ///
  /// A leftover smaller than [`MIN_FRAGMENT`] stays inside `chunk` and `None`
  /// is returned. The state of `chunk` is not touched.
  pub(crate) unsafe fn split(chunk: *mut Chunk, size: usize) -> Option<*mut Chunk> {
    debug_assert!(size % ALIGNMENT == 0);

    unsafe {
      let total = (*chunk).size;
      debug_assert!(size <= total, "split of {total}-byte chunk to {size}");

      let leftover = total - size;
      if leftover < MIN_FRAGMENT {
        return None;
      }

      let last = (*chunk).last;
      let rest = Chunk::write(
        Chunk::payload(chunk).add(size),
        leftover - HEADER_SIZE,
        Some(size),
        last,
        ChunkState::DETACHED,
      );

      (*chunk).size = size;
      (*chunk).last = false;
      if let Some(above) = Chunk::next(rest) {
        (*above).prev_size = (*rest).size;
      }

      Some(rest)
    }
  }

  #[cfg(test)]
  pub(crate) unsafe fn set_last(chunk: *mut Chunk, last: bool) {
    unsafe { (*chunk).last = last };
  }

  #[cfg(test)]
  pub(crate) unsafe fn set_prev_size(chunk: *mut Chunk, prev_size: usize) {
    unsafe { (*chunk).prev_size = prev_size };
  }

  /// Merges the neighbor above `chunk` into it. The neighbor must exist and
  /// must already be unlinked from whatever structure tracked it.
  pub(crate) unsafe fn absorb_next(chunk: *mut Chunk) {
    unsafe {
      let Some(next) = Chunk::next(chunk) else {
        debug_assert!(false, "absorb_next on the last chunk {chunk:p}");
        return;
      };

      (*chunk).size += HEADER_SIZE + (*next).size;
      (*chunk).last = (*next).last;
      if let Some(above) = Chunk::next(chunk) {
        (*above).prev_size = (*chunk).size;
      }
    }
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to a multiple of the power of two `align`, `None` on overflow.
#[inline]
pub(crate) const fn checked_align_up(x: usize, align: usize) -> Option<usize> {
  match x.checked_add(align - 1) {
    Some(v) => Some(v & !(align - 1)),
    None => None,
  }
}

/// Payload size handed out for a request of `requested` bytes.
#[inline]
pub(crate) const fn payload_size(requested: usize) -> Option<usize> {
  if requested <= MIN_PAYLOAD {
    return Some(MIN_PAYLOAD);
  }
  checked_align_up(requested, ALIGNMENT)
}
