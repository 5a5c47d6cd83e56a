use core::ptr::{self, NonNull};

use log::{debug, trace, warn};

use crate::{
  arena::{Arenas, REGION_HEADER_SIZE},
  chunk::{ALIGNMENT, Chunk, ChunkState, payload_size},
  config::HeapConfig,
  error::{AllocError, InvariantViolation, Violation},
  os::{Mmap, RegionSource},
  registry::Registry,
  tree::FreeTree,
};

/// Snapshot of a heap's bookkeeping.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct HeapStats {
  /// Regions mapped from the OS.
  pub regions: usize,
  /// Bytes mapped across all regions, overhead included.
  pub mapped_bytes: usize,
  /// Live allocations.
  pub allocated_chunks: usize,
  /// Usable bytes of all live allocations.
  pub allocated_bytes: usize,
  /// Chunks in the free index.
  pub free_chunks: usize,
  /// Usable bytes of all free chunks.
  pub free_bytes: usize,
}

/// Best-fit allocator over regions obtained from a [`RegionSource`].
///
/// Free chunks live in a size-ordered tree, live allocations in an intrusive
/// registry. Every chunk carries its header right below the payload, and
/// neighboring free chunks are merged as soon as they appear.
///
/// A `Heap` is single-threaded: every mutation takes `&mut self`. Share one
/// between threads behind a lock. Dropping a heap unmaps all of its regions.
///
/// Pointer-taking operations trust their caller: a pointer that is not a live
/// allocation of this heap is undefined behavior, unless the `checked` feature
/// is enabled, in which case it is reported through `log` and ignored.
pub struct Heap<S: RegionSource = Mmap> {
  tree: FreeTree,
  registry: Registry,
  arenas: Arenas<S>,
  config: HeapConfig,
}

// The heap exclusively owns every region it mapped.
unsafe impl<S: RegionSource + Send> Send for Heap<S> {}

impl Heap<Mmap> {
  /// Empty heap backed by `mmap`, with default configuration.
  pub const fn new() -> Self {
    Self::with_config(HeapConfig::new())
  }

  pub const fn with_config(config: HeapConfig) -> Self {
    Self::with_source(Mmap, config)
  }
}

impl Default for Heap<Mmap> {
  fn default() -> Self {
    Self::new()
  }
}

impl<S: RegionSource> Heap<S> {
  pub const fn with_source(source: S, config: HeapConfig) -> Self {
    Self {
      tree: FreeTree::new(),
      registry: Registry::new(),
      arenas: Arenas::new(source),
      config,
    }
  }

  pub fn config(&self) -> &HeapConfig {
    &self.config
  }

  pub fn source(&self) -> &S {
    self.arenas.source()
  }

  // ===========================================================================
  // Allocate / Release
  // ===========================================================================

  /// Allocates at least `size` bytes, aligned to [`ALIGNMENT`].
  ///
  /// Zero-byte requests succeed with a distinct pointer. On failure the heap
  /// is left exactly as it was.
  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let payload = payload_size(size).ok_or(AllocError::SizeOverflow { requested: size })?;

    let chunk = self.take_fit(size, payload)?;
    unsafe {
      // Claim before trimming so the leftover cannot merge back into it.
      (*chunk).state = ChunkState::CLAIMED;
      self.trim(chunk, payload);
      self.registry.push(chunk);
    }

    let ptr = Chunk::payload(chunk);
    if self.config.log_events {
      trace!("allocate({size}) -> {ptr:p} ({payload} usable)");
    }
    // Payloads sit above a header, never at address zero.
    Ok(unsafe { NonNull::new_unchecked(ptr) })
  }

  /// Like [`allocate`](Self::allocate), with the first `size` bytes zeroed.
  pub fn allocate_zeroed(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let ptr = self.allocate(size)?;
    unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
    Ok(ptr)
  }

  /// Returns the allocation at `ptr` to the heap. Null is a no-op.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation of this heap.
  pub unsafe fn release(&mut self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    if !self.verify_live(ptr, "release") {
      return;
    }

    let chunk = Chunk::from_payload(ptr);
    unsafe {
      let removed = self.registry.remove(chunk);
      debug_assert!(removed, "release({ptr:p}): not a live allocation");

      if self.config.log_events {
        trace!("release({ptr:p}) ({} usable)", (*chunk).size);
      }

      (*chunk).state = ChunkState::DETACHED;
      self.recycle(chunk);
    }
  }

  /// Resizes the allocation at `ptr` to at least `size` bytes.
  ///
  /// Shrinking happens in place and keeps the pointer. Growing moves the
  /// contents to a fresh allocation and releases the old one; the old chunk is
  /// never extended in place. A null `ptr` is a plain allocation. On failure
  /// the original allocation is untouched and still live.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation of this heap.
  pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> Result<NonNull<u8>, AllocError> {
    let Some(current) = NonNull::new(ptr) else {
      return self.allocate(size);
    };
    let payload = payload_size(size).ok_or(AllocError::SizeOverflow { requested: size })?;
    if !self.verify_live(ptr, "reallocate") {
      return Err(AllocError::NotLive {
        address: ptr as usize,
      });
    }

    let chunk = Chunk::from_payload(ptr);
    let old = unsafe { (*chunk).size };

    if payload <= old {
      unsafe { self.trim(chunk, payload) };
      let new = unsafe { (*chunk).size };
      self.registry.resized(old, new);
      if self.config.log_events {
        trace!("reallocate({ptr:p}, {size}) shrank in place {old} -> {new}");
      }
      return Ok(current);
    }

    let fresh = self.allocate(size)?;
    unsafe {
      ptr::copy_nonoverlapping(ptr, fresh.as_ptr(), old.min(size));
      self.release(ptr);
    }
    if self.config.log_events {
      trace!("reallocate({ptr:p}, {size}) moved to {fresh:p}");
    }
    Ok(fresh)
  }

  // ===========================================================================
  // Introspection
  // ===========================================================================

  /// Usable size of the allocation at `ptr`, 0 for null.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation of this heap.
  pub unsafe fn allocated_size(&self, ptr: *const u8) -> usize {
    if ptr.is_null() || !self.verify_live(ptr, "allocated_size") {
      return 0;
    }
    unsafe { (*Chunk::from_payload(ptr.cast_mut())).size }
  }

  /// Whether `ptr` is exactly the start of a live allocation. Never reads `ptr`.
  pub fn is_allocated(&self, ptr: *const u8) -> bool {
    !ptr.is_null() && self.registry.contains(ptr)
  }

  /// Usable bytes across all live allocations, overhead excluded.
  pub fn total_allocated(&self) -> usize {
    self.registry.bytes()
  }

  pub fn stats(&self) -> HeapStats {
    HeapStats {
      regions: self.arenas.count(),
      mapped_bytes: self.arenas.mapped(),
      allocated_chunks: self.registry.len(),
      allocated_bytes: self.registry.bytes(),
      free_chunks: self.tree.len(),
      free_bytes: self.tree.bytes(),
    }
  }

  /// Walks every region and validates the layout invariants: chunks tile each
  /// region exactly, boundary tags agree, no two free chunks touch, and the
  /// free index and registry account for every chunk.
  pub fn check(&self) -> Result<(), InvariantViolation> {
    let mut free = (0, 0);
    let mut allocated = (0, 0);

    for (first, end) in self.arenas.regions() {
      let fault = |chunk: *mut Chunk, kind| InvariantViolation {
        address: chunk as usize,
        kind,
      };

      let mut chunk = first;
      let mut below: Option<*mut Chunk> = None;
      loop {
        unsafe {
          let size = (*chunk).size;
          if size % ALIGNMENT != 0 {
            return Err(fault(chunk, Violation::Misaligned));
          }
          if Chunk::end(chunk) > end {
            return Err(fault(chunk, Violation::Overrun));
          }
          if Chunk::is_first(chunk) != below.is_none() {
            return Err(fault(chunk, Violation::Boundary));
          }
          if let Some(below) = below
            && Chunk::prev_size(chunk) != Some((*below).size)
          {
            return Err(fault(chunk, Violation::PrevSize));
          }
          let at_end = Chunk::end(chunk) == end;
          if Chunk::is_last(chunk) && !at_end {
            return Err(fault(chunk, Violation::Gap));
          }
          if !Chunk::is_last(chunk) && at_end {
            return Err(fault(chunk, Violation::Boundary));
          }

          if Chunk::is_free(chunk) {
            if below.is_some_and(|b| Chunk::is_free(b)) {
              return Err(fault(chunk, Violation::AdjacentFree));
            }
            if !self.tree.contains(chunk) {
              return Err(fault(chunk, Violation::Unindexed));
            }
            free = (free.0 + 1, free.1 + size);
          } else {
            if self.registry.find(Chunk::payload(chunk)) != Some(chunk) {
              return Err(fault(chunk, Violation::Unregistered));
            }
            allocated = (allocated.0 + 1, allocated.1 + size);
          }

          match Chunk::next(chunk) {
            Some(next) => {
              below = Some(chunk);
              chunk = next;
            }
            None => break,
          }
        }
      }
    }

    let region_fault = |kind| InvariantViolation {
      address: self
        .arenas
        .regions()
        .next()
        .map_or(0, |(first, _)| first as usize - REGION_HEADER_SIZE),
      kind,
    };
    if free != (self.tree.len(), self.tree.bytes()) {
      return Err(region_fault(Violation::FreeTotals));
    }
    if allocated != (self.registry.len(), self.registry.bytes()) {
      return Err(region_fault(Violation::AllocatedTotals));
    }
    Ok(())
  }

  /// Unmaps every region and forgets all chunks, leaving an empty heap.
  ///
  /// # Safety
  ///
  /// Every pointer handed out by this heap becomes dangling.
  pub unsafe fn reset(&mut self) {
    let stats = self.stats();
    if let Err(err) = unsafe { self.arenas.release_all() }
      && self.config.log_events
    {
      warn!("reset: unmapping regions failed: {err}");
    }
    self.tree.clear();
    self.registry.clear();

    if self.config.log_events {
      debug!(
        "reset: released {} regions ({} bytes), dropped {} live allocations",
        stats.regions, stats.mapped_bytes, stats.allocated_chunks
      );
    }
  }

  // ===========================================================================
  // Internals
  // ===========================================================================

  /// Best-fit free chunk for `payload`, growing the heap on a miss. The
  /// returned chunk is detached from the index.
  fn take_fit(&mut self, requested: usize, payload: usize) -> Result<*mut Chunk, AllocError> {
    if let Some(chunk) = unsafe { self.tree.take_best_fit(payload) } {
      return Ok(chunk);
    }

    // Nothing in the index fits, so the fresh region's chunk is the only fit.
    match self.arenas.grow(requested, payload, self.config.region_size) {
      Ok(chunk) => {
        if self.config.log_events {
          let stats = self.stats();
          debug!(
            "grew heap for {requested}-byte request: {} usable in new region ({} regions, {} bytes mapped)",
            unsafe { (*chunk).size },
            stats.regions,
            stats.mapped_bytes
          );
        }
        Ok(chunk)
      }
      Err(err) => {
        if self.config.log_events {
          warn!("allocate({requested}) failed: {err}");
        }
        Err(err)
      }
    }
  }

  /// Shrinks `chunk` to `payload` bytes and recycles any leftover.
  unsafe fn trim(&mut self, chunk: *mut Chunk, payload: usize) {
    if let Some(rest) = unsafe { Chunk::split(chunk, payload) } {
      unsafe { self.recycle(rest) };
    }
  }

  /// Merges a detached free chunk with its free neighbors and indexes the result.
  unsafe fn recycle(&mut self, chunk: *mut Chunk) {
    unsafe {
      let merged = self.coalesce(chunk);
      self.tree.insert(merged);
    }
  }

  /// Absorbs free neighbors on both sides into `chunk`, unlinking them from
  /// the index. Returns the header of the merged chunk.
  unsafe fn coalesce(&mut self, mut chunk: *mut Chunk) -> *mut Chunk {
    unsafe {
      while let Some(next) = Chunk::next(chunk)
        && Chunk::is_free(next)
      {
        let removed = self.tree.remove(next);
        debug_assert!(removed, "free neighbor {next:p} missing from the index");
        Chunk::absorb_next(chunk);
      }

      while let Some(prev) = Chunk::prev(chunk)
        && Chunk::is_free(prev)
      {
        let removed = self.tree.remove(prev);
        debug_assert!(removed, "free neighbor {prev:p} missing from the index");
        Chunk::absorb_next(prev);
        chunk = prev;
      }
    }
    chunk
  }

  /// Whether `ptr` may be passed on as a live allocation. Always true unless
  /// the `checked` feature is enabled.
  #[inline]
  fn verify_live(&self, ptr: *const u8, op: &str) -> bool {
    #[cfg(feature = "checked")]
    {
      if !self.is_allocated(ptr) {
        if self.config.log_events {
          log::error!("{op}({ptr:p}): not a live allocation, ignored");
        }
        return false;
      }
    }
    #[cfg(not(feature = "checked"))]
    let _ = (ptr, op);
    true
  }
}

impl<S: RegionSource> Drop for Heap<S> {
  fn drop(&mut self) {
    unsafe { self.reset() };
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arena::tests::Limited;
  use crate::chunk::HEADER_SIZE;

  fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
  }

  fn heap() -> Heap {
    init_logger();
    Heap::new()
  }

  #[test]
  fn test_allocate_reports_size() {
    let mut heap = heap();
    for size in [0, 1, 8, 15, 16, 17, 100, 4096, 70_000] {
      let ptr = heap.allocate(size).unwrap();
      unsafe {
        assert!(heap.allocated_size(ptr.as_ptr()) >= size);
      }
      assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
      assert!(heap.is_allocated(ptr.as_ptr()));
    }
    heap.check().unwrap();
  }

  #[test]
  fn test_basic_allocation() {
    let mut heap = heap();
    let ptr = heap.allocate(8).unwrap().as_ptr();
    assert!(heap.is_allocated(ptr));
    unsafe {
      ptr.cast::<u64>().write(0xDEAD_BEEF);
      assert_eq!(ptr.cast::<u64>().read(), 0xDEAD_BEEF);
      heap.release(ptr);
    }
    assert!(!heap.is_allocated(ptr));
    assert_eq!(heap.total_allocated(), 0);
  }

  #[test]
  fn test_null() {
    let mut heap = heap();
    heap.allocate(32).unwrap();
    let before = heap.total_allocated();

    assert!(!heap.is_allocated(ptr::null()));
    unsafe {
      heap.release(ptr::null_mut());
      assert_eq!(heap.allocated_size(ptr::null()), 0);
    }
    assert_eq!(heap.total_allocated(), before);
  }

  #[test]
  fn test_zero_size_is_distinct() {
    let mut heap = heap();
    let a = heap.allocate(0).unwrap();
    let b = heap.allocate(0).unwrap();
    assert_ne!(a, b);
    assert!(heap.is_allocated(a.as_ptr()));
    unsafe {
      assert_eq!(heap.allocated_size(a.as_ptr()), 16);
      heap.release(a.as_ptr());
      heap.release(b.as_ptr());
    }
    assert_eq!(heap.total_allocated(), 0);
    heap.check().unwrap();
  }

  #[test]
  fn test_multiple_allocations_total() {
    let mut heap = heap();
    let before = heap.total_allocated();
    let mut pointers = Vec::new();
    let mut sum = 0;

    for size in [1, 2, 17, 42, 1049, 50] {
      let ptr = heap.allocate(size).unwrap().as_ptr();
      let reported = unsafe { heap.allocated_size(ptr) };
      assert!(reported >= size, "requested {size}, got {reported}");
      sum += reported;
      pointers.push(ptr);
    }
    assert_eq!(heap.total_allocated() - before, sum);

    for &ptr in &pointers {
      unsafe { heap.release(ptr) };
    }
    for &ptr in &pointers {
      assert!(!heap.is_allocated(ptr));
    }
    assert_eq!(heap.total_allocated(), 0);
    heap.check().unwrap();
  }

  #[test]
  fn test_interior_pointer_is_not_allocated() {
    let mut heap = heap();
    let ptr = heap.allocate(64).unwrap().as_ptr();
    assert!(!heap.is_allocated(ptr.wrapping_add(1)));
    assert!(!heap.is_allocated(ptr.wrapping_add(16)));
    assert!(!heap.is_allocated(ptr.wrapping_sub(HEADER_SIZE)));
  }

  #[test]
  fn test_release_then_reuse() {
    let mut heap = heap();
    let first = heap.allocate(100).unwrap();
    unsafe { heap.release(first.as_ptr()) };

    let second = heap.allocate(100).unwrap();
    assert_eq!(first, second);
    assert!(unsafe { heap.allocated_size(second.as_ptr()) } >= 100);
  }

  #[test]
  fn test_best_fit_choice() {
    let mut heap = heap();
    // Free holes of 256 and 128 bytes, fenced by live allocations.
    let a = heap.allocate(256).unwrap().as_ptr();
    let _fence_a = heap.allocate(16).unwrap();
    let b = heap.allocate(128).unwrap().as_ptr();
    let _fence_b = heap.allocate(16).unwrap();

    unsafe {
      heap.release(a);
      heap.release(b);
    }

    assert_eq!(heap.allocate(120).unwrap().as_ptr(), b);
    assert_eq!(heap.allocate(200).unwrap().as_ptr(), a);
    heap.check().unwrap();
  }

  #[test]
  fn test_coalesce_adjacent() {
    let mut heap = heap();
    let (s1, s2) = (200, 300);
    let a = heap.allocate(s1).unwrap().as_ptr();
    let b = heap.allocate(s2).unwrap().as_ptr();
    let _fence = heap.allocate(16).unwrap();
    assert_eq!(b as usize, a as usize + heap_size(&heap, a) + HEADER_SIZE);

    let regions = heap.stats().regions;
    unsafe {
      heap.release(a);
      heap.release(b);
    }
    heap.check().unwrap();

    let merged = heap.allocate(s1 + s2 + HEADER_SIZE).unwrap().as_ptr();
    assert_eq!(merged, a);
    assert_eq!(heap.stats().regions, regions);
  }

  #[test]
  fn test_coalesce_on_both_sides() {
    let mut heap = heap();
    let a = heap.allocate(64).unwrap().as_ptr();
    let b = heap.allocate(64).unwrap().as_ptr();
    let c = heap.allocate(64).unwrap().as_ptr();
    let _fence = heap.allocate(16).unwrap();

    unsafe {
      heap.release(a);
      heap.release(c);
      assert_eq!(heap.stats().free_chunks, 3);
      heap.release(b);
    }
    heap.check().unwrap();
    // a+b+c merged; the tail beyond the fence is the other free chunk.
    assert_eq!(heap.stats().free_chunks, 2);
    assert_eq!(heap.allocate(3 * 64 + 2 * HEADER_SIZE).unwrap().as_ptr(), a);
  }

  #[test]
  fn test_release_everything_merges_region() {
    let mut heap = heap();
    let pointers: Vec<_> = (0..50)
      .map(|i| heap.allocate(i * 7).unwrap().as_ptr())
      .collect();
    for &ptr in pointers.iter().rev().step_by(2) {
      unsafe { heap.release(ptr) };
    }
    heap.check().unwrap();
    for &ptr in pointers.iter().rev().skip(1).step_by(2) {
      unsafe { heap.release(ptr) };
    }
    heap.check().unwrap();

    let stats = heap.stats();
    assert_eq!(stats.allocated_chunks, 0);
    assert_eq!(stats.free_chunks, stats.regions);
  }

  #[test]
  fn test_reallocate_shrink_in_place() {
    let mut heap = heap();
    let ptr = heap.allocate(1024).unwrap().as_ptr();
    unsafe {
      for i in 0..1024 {
        ptr.add(i).write(i as u8);
      }

      let same = heap.reallocate(ptr, 100).unwrap().as_ptr();
      assert_eq!(same, ptr);
      assert_eq!(heap.allocated_size(ptr), 112);
      assert_eq!(heap.total_allocated(), 112);
      for i in 0..100 {
        assert_eq!(ptr.add(i).read(), i as u8);
      }
    }
    heap.check().unwrap();
  }

  #[test]
  fn test_reallocate_shrink_keeps_small_leftover() {
    let mut heap = heap();
    let ptr = heap.allocate(128).unwrap().as_ptr();
    let stats = heap.stats();

    // 16 spare bytes cannot hold a header, so the chunk keeps them.
    let same = unsafe { heap.reallocate(ptr, 100) }.unwrap().as_ptr();
    assert_eq!(same, ptr);
    assert_eq!(unsafe { heap.allocated_size(ptr) }, 128);
    assert_eq!(heap.total_allocated(), 128);
    assert_eq!(heap.stats(), stats);
    heap.check().unwrap();
  }

  #[test]
  fn test_reallocate_shrink_merges_with_free_chunk_above() {
    let mut heap = heap();
    let a = heap.allocate(1024).unwrap().as_ptr();
    let b = heap.allocate(64).unwrap().as_ptr();
    let _fence = heap.allocate(16).unwrap();
    unsafe { heap.release(b) };
    let stats = heap.stats();

    let same = unsafe { heap.reallocate(a, 100) }.unwrap().as_ptr();
    assert_eq!(same, a);
    assert_eq!(unsafe { heap.allocated_size(a) }, 112);
    heap.check().unwrap();
    assert_eq!(heap.stats().free_chunks, stats.free_chunks);

    // Leftover of a (864) + header of b + b (64).
    let merged = heap.allocate(864 + HEADER_SIZE + 64).unwrap().as_ptr();
    assert_eq!(merged, a.wrapping_add(112 + HEADER_SIZE));
    assert_eq!(heap.stats().regions, stats.regions);
    heap.check().unwrap();
  }

  #[test]
  fn test_reallocate_grow_copies() {
    let mut heap = heap();
    let ptr = heap.allocate(32).unwrap().as_ptr();
    let _fence = heap.allocate(16).unwrap();
    unsafe {
      for i in 0..32 {
        ptr.add(i).write(0xA0 + i as u8);
      }

      let moved = heap.reallocate(ptr, 5000).unwrap().as_ptr();
      assert_ne!(moved, ptr);
      assert!(!heap.is_allocated(ptr));
      assert!(heap.allocated_size(moved) >= 5000);
      for i in 0..32 {
        assert_eq!(moved.add(i).read(), 0xA0 + i as u8);
      }
    }
    heap.check().unwrap();
  }

  #[test]
  fn test_reallocate_null_allocates() {
    let mut heap = heap();
    let ptr = unsafe { heap.reallocate(ptr::null_mut(), 40) }.unwrap();
    assert!(heap.is_allocated(ptr.as_ptr()));
    assert_eq!(heap.total_allocated(), 48);
  }

  #[test]
  fn test_reallocate_failure_keeps_original() {
    init_logger();
    let config = HeapConfig::new().with_region_size(0);
    let mut heap = Heap::with_source(Limited::new(1), config);

    let ptr = heap.allocate(64).unwrap().as_ptr();
    unsafe { ptr.write_bytes(0x5A, 64) };
    let before = heap.stats();

    let err = unsafe { heap.reallocate(ptr, 1 << 20) }.unwrap_err();
    assert!(matches!(err, AllocError::Exhausted { requested, .. } if requested == 1 << 20));

    assert!(heap.is_allocated(ptr));
    assert_eq!(heap.stats(), before);
    unsafe {
      assert_eq!(heap.allocated_size(ptr), 64);
      assert!(core::slice::from_raw_parts(ptr, 64).iter().all(|&b| b == 0x5A));
    }
    heap.check().unwrap();
  }

  #[test]
  fn test_allocate_failure_leaves_state() {
    init_logger();
    let mut heap = Heap::with_source(Limited::new(0), HeapConfig::new());

    assert!(matches!(
      heap.allocate(10),
      Err(AllocError::Exhausted { requested: 10, .. })
    ));
    assert!(matches!(
      heap.allocate(usize::MAX),
      Err(AllocError::SizeOverflow { .. })
    ));
    assert_eq!(heap.stats(), HeapStats::default());
  }

  #[test]
  fn test_large_request_gets_own_region() {
    let mut heap = heap();
    let small = heap.allocate(16).unwrap();
    let big = heap.allocate(HeapConfig::DEFAULT_REGION_SIZE * 3).unwrap();

    let stats = heap.stats();
    assert_eq!(stats.regions, 2);
    assert!(stats.mapped_bytes >= HeapConfig::DEFAULT_REGION_SIZE * 4);
    assert!(heap.is_allocated(small.as_ptr()));
    assert!(heap.is_allocated(big.as_ptr()));
    heap.check().unwrap();
  }

  #[test]
  fn test_allocate_zeroed_after_reuse() {
    let mut heap = heap();
    let dirty = heap.allocate(256).unwrap().as_ptr();
    unsafe {
      dirty.write_bytes(0xFF, 256);
      heap.release(dirty);
    }

    let clean = heap.allocate_zeroed(256).unwrap().as_ptr();
    assert_eq!(clean, dirty);
    assert!(unsafe { core::slice::from_raw_parts(clean, 256) }.iter().all(|&b| b == 0));
  }

  #[test]
  fn test_loop_does_not_grow() {
    let mut heap = heap();
    let ptr = heap.allocate(16).unwrap();
    unsafe { heap.release(ptr.as_ptr()) };
    let mapped = heap.stats().mapped_bytes;

    for _ in 0..100_000 {
      let ptr = heap.allocate(16).unwrap();
      unsafe { heap.release(ptr.as_ptr()) };
    }

    assert_eq!(heap.stats().mapped_bytes, mapped);
    assert_eq!(heap.total_allocated(), 0);
  }

  #[test]
  fn test_mixed_workload_keeps_invariants() {
    let mut heap = Heap::with_config(HeapConfig::quiet().with_region_size(16 * 1024));
    let mut live: Vec<(*mut u8, usize)> = Vec::new();
    let mut state = 0x2545_F491_4F6C_DD1Du64;
    let mut next = || {
      state ^= state << 13;
      state ^= state >> 7;
      state ^= state << 17;
      state
    };

    for round in 0..4000 {
      let roll = next();
      match roll % 4 {
        0 | 1 => {
          let size = (next() % 3000) as usize;
          let ptr = heap.allocate(size).unwrap().as_ptr();
          unsafe { ptr.write_bytes(size as u8, size) };
          live.push((ptr, size));
        }
        2 if !live.is_empty() => {
          let (ptr, _) = live.swap_remove((next() as usize) % live.len());
          unsafe { heap.release(ptr) };
        }
        _ if !live.is_empty() => {
          let idx = (next() as usize) % live.len();
          let (ptr, size) = live[idx];
          let new_size = (next() % 4000) as usize;
          let moved = unsafe { heap.reallocate(ptr, new_size) }.unwrap().as_ptr();
          let kept = size.min(new_size);
          assert!(
            unsafe { core::slice::from_raw_parts(moved, kept) }
              .iter()
              .all(|&b| b == size as u8),
            "contents lost in round {round}"
          );
          unsafe { moved.write_bytes(new_size as u8, new_size) };
          live[idx] = (moved, new_size);
        }
        _ => {}
      }

      if round % 200 == 0 {
        heap.check().unwrap();
      }
    }

    let expected: usize = live
      .iter()
      .map(|&(ptr, _)| unsafe { heap.allocated_size(ptr) })
      .sum();
    assert_eq!(heap.total_allocated(), expected);

    for (ptr, _) in live.drain(..) {
      unsafe { heap.release(ptr) };
    }
    heap.check().unwrap();
    assert_eq!(heap.total_allocated(), 0);
    assert_eq!(heap.stats().free_chunks, heap.stats().regions);
  }

  #[test]
  fn test_check_detects_corruption() {
    let mut heap = heap();
    let a = heap.allocate(64).unwrap().as_ptr();
    let b = heap.allocate(64).unwrap();

    unsafe { (*Chunk::from_payload(a)).size = 72 };
    let err = heap.check().unwrap_err();
    assert_eq!(err.kind, Violation::Misaligned);
    assert_eq!(err.address, Chunk::from_payload(a) as usize);

    unsafe { (*Chunk::from_payload(a)).size = 64 };
    heap.check().unwrap();

    let b = Chunk::from_payload(b.as_ptr());
    unsafe { Chunk::set_prev_size(b, 48) };
    let err = heap.check().unwrap_err();
    assert_eq!(err.kind, Violation::PrevSize);
    assert_eq!(err.address, b as usize);

    unsafe { Chunk::set_prev_size(b, 64) };
    heap.check().unwrap();
  }

  #[test]
  fn test_check_detects_bad_last_flag() {
    let mut heap = heap();
    let a = Chunk::from_payload(heap.allocate(64).unwrap().as_ptr());
    let tail = unsafe { Chunk::next(a) }.unwrap();

    unsafe { Chunk::set_last(tail, false) };
    let err = heap.check().unwrap_err();
    assert_eq!(err.kind, Violation::Boundary);
    assert_eq!(err.address, tail as usize);
    unsafe { Chunk::set_last(tail, true) };

    unsafe { Chunk::set_last(a, true) };
    let err = heap.check().unwrap_err();
    assert_eq!(err.kind, Violation::Gap);
    assert_eq!(err.address, a as usize);
    unsafe { Chunk::set_last(a, false) };

    heap.check().unwrap();
  }

  #[test]
  fn test_reset() {
    let mut heap = heap();
    heap.allocate(10).unwrap();
    heap.allocate(100_000).unwrap();
    assert_eq!(heap.stats().regions, 2);

    unsafe { heap.reset() };
    assert_eq!(heap.stats(), HeapStats::default());
    heap.check().unwrap();

    let ptr = heap.allocate(10).unwrap();
    assert!(heap.is_allocated(ptr.as_ptr()));
    assert_eq!(heap.stats().regions, 1);
  }

  #[test]
  fn test_reset_unmaps_every_region() {
    let mut heap = Heap::with_source(Limited::new(3), HeapConfig::quiet().with_region_size(0));
    heap.allocate(10).unwrap();
    heap.allocate(100_000).unwrap();
    heap.allocate(200_000).unwrap();
    let regions = heap.stats().regions;
    assert!(regions >= 2);

    unsafe { heap.reset() };
    assert_eq!(heap.source().unmapped, regions);
  }

  #[cfg(feature = "checked")]
  #[test]
  fn test_checked_rejects_foreign_pointers() {
    let mut heap = heap();
    let ptr = heap.allocate(64).unwrap().as_ptr();
    let stats = heap.stats();

    unsafe {
      heap.release(ptr.wrapping_add(16));
      assert_eq!(heap.allocated_size(ptr.wrapping_add(16)), 0);
      assert!(matches!(
        heap.reallocate(ptr.wrapping_add(16), 8),
        Err(AllocError::NotLive { .. })
      ));
      heap.release(ptr);
      heap.release(ptr);
    }
    assert_eq!(heap.stats().allocated_chunks, stats.allocated_chunks - 1);
    heap.check().unwrap();
  }

  fn heap_size(heap: &Heap, ptr: *mut u8) -> usize {
    unsafe { heap.allocated_size(ptr) }
  }
}
