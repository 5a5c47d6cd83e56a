use core::{
  mem::size_of,
  ptr::{NonNull, null_mut},
};

use crate::{
  chunk::{ALIGNMENT, Chunk, ChunkState, HEADER_SIZE, checked_align_up},
  error::AllocError,
  os::RegionSource,
};

/// Record at the base of every mapped region.
#[repr(C, align(16))]
struct Region {
  /// Region mapped before this one.
  next: *mut Region,
  /// Mapped length, including this record.
  len: usize,
}

pub(crate) const REGION_HEADER_SIZE: usize = size_of::<Region>();

const _: () = assert!(REGION_HEADER_SIZE % ALIGNMENT == 0);

/// Every region a heap has mapped, newest first.
pub(crate) struct Arenas<S> {
  source: S,
  head: *mut Region,
  count: usize,
  mapped: usize,
}

impl<S> Arenas<S> {
  pub(crate) const fn new(source: S) -> Self {
    Self {
      source,
      head: null_mut(),
      count: 0,
      mapped: 0,
    }
  }

  /// Number of regions mapped.
  #[inline]
  pub(crate) fn count(&self) -> usize {
    self.count
  }

  /// Total bytes mapped across all regions.
  #[inline]
  pub(crate) fn mapped(&self) -> usize {
    self.mapped
  }

  pub(crate) fn source(&self) -> &S {
    &self.source
  }

  /// `(first chunk, region end)` of every region.
  pub(crate) fn regions(&self) -> Regions<'_> {
    Regions {
      region: self.head,
      _arenas: core::marker::PhantomData,
    }
  }
}

impl<S: RegionSource> Arenas<S> {
  /// Region length needed to hold one chunk of `payload` bytes, at least
  /// `min_len` and rounded up to whole pages.
  pub(crate) fn region_len(&self, payload: usize, min_len: usize) -> Option<usize> {
    let need = payload.checked_add(REGION_HEADER_SIZE + HEADER_SIZE)?;
    checked_align_up(need.max(min_len), self.source.page_size())
  }

  /// Maps a new region able to hold `payload` bytes and returns the single
  /// detached free chunk covering it.
  pub(crate) fn grow(
    &mut self,
    requested: usize,
    payload: usize,
    min_len: usize,
  ) -> Result<*mut Chunk, AllocError> {
    let len = self
      .region_len(payload, min_len)
      .ok_or(AllocError::SizeOverflow { requested })?;

    let base = self
      .source
      .map(len)
      .map_err(|source| AllocError::Exhausted {
        requested,
        len,
        source,
      })?;

    let region = base.as_ptr().cast::<Region>();
    unsafe {
      region.write(Region {
        next: self.head,
        len,
      })
    };
    self.head = region;
    self.count += 1;
    self.mapped += len;

    let chunk = unsafe {
      Chunk::write(
        base.as_ptr().add(REGION_HEADER_SIZE),
        len - REGION_HEADER_SIZE - HEADER_SIZE,
        None,
        true,
        ChunkState::DETACHED,
      )
    };
    Ok(chunk)
  }

  /// Unmaps every region. Failures are reported after all regions were tried.
  ///
  /// # Safety
  ///
  /// No chunk of any region may be used afterwards.
  pub(crate) unsafe fn release_all(&mut self) -> std::io::Result<()> {
    let mut result = Ok(());
    let mut region = self.head;

    while let Some(base) = NonNull::new(region) {
      let (next, len) = unsafe { ((*region).next, (*region).len) };
      if let Err(err) = unsafe { self.source.unmap(base.cast(), len) } {
        result = Err(err);
      }
      region = next;
    }

    self.head = null_mut();
    self.count = 0;
    self.mapped = 0;
    result
  }
}

pub(crate) struct Regions<'a> {
  region: *mut Region,
  _arenas: core::marker::PhantomData<&'a ()>,
}

impl Iterator for Regions<'_> {
  type Item = (*mut Chunk, *mut u8);

  fn next(&mut self) -> Option<Self::Item> {
    if self.region.is_null() {
      return None;
    }
    let region = self.region;
    unsafe {
      self.region = (*region).next;
      let base = region.cast::<u8>();
      Some((
        base.add(REGION_HEADER_SIZE).cast::<Chunk>(),
        base.add((*region).len),
      ))
    }
  }
}
