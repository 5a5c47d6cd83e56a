use core::ptr::null_mut;

use crate::chunk::{Chunk, ChunkState};

/// Intrusive list of allocated chunks, threaded through their `next` links.
///
/// Membership is what makes a payload pointer valid. Removal walks the list.
pub(crate) struct Registry {
  head: *mut Chunk,
  len: usize,
  bytes: usize,
}

#[inline]
unsafe fn next_slot(chunk: *mut Chunk) -> *mut *mut Chunk {
  match unsafe { &mut (*chunk).state } {
    ChunkState::Allocated { next } => next as *mut _,
    ChunkState::Free { .. } => unreachable!("free chunk {chunk:p} reached through the registry"),
  }
}

impl Registry {
  pub(crate) const fn new() -> Self {
    Self {
      head: null_mut(),
      len: 0,
      bytes: 0,
    }
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.len
  }

  /// Sum of the payload sizes of all registered chunks.
  #[inline]
  pub(crate) fn bytes(&self) -> usize {
    self.bytes
  }

  pub(crate) fn clear(&mut self) {
    *self = Self::new();
  }

  /// Marks `chunk` allocated and links it in at the head.
  pub(crate) unsafe fn push(&mut self, chunk: *mut Chunk) {
    unsafe {
      (*chunk).state = ChunkState::Allocated { next: self.head };
      self.bytes += (*chunk).size;
    }
    self.head = chunk;
    self.len += 1;
  }

  /// Unlinks `chunk`. Returns false if it is not registered. The chunk keeps
  /// its allocated state with a cleared link.
  pub(crate) unsafe fn remove(&mut self, chunk: *mut Chunk) -> bool {
    let mut slot: *mut *mut Chunk = &raw mut self.head;
    unsafe {
      while !(*slot).is_null() {
        let node = *slot;
        let next = next_slot(node);
        if node == chunk {
          *slot = *next;
          (*chunk).state = ChunkState::CLAIMED;
          self.len -= 1;
          self.bytes -= (*chunk).size;
          return true;
        }
        slot = next;
      }
    }
    false
  }

  /// The registered chunk whose payload starts exactly at `ptr`.
  ///
  /// Only compares addresses; `ptr` itself is never read.
  pub(crate) fn find(&self, ptr: *const u8) -> Option<*mut Chunk> {
    self.iter().find(|&chunk| Chunk::payload(chunk).cast_const() == ptr)
  }

  #[inline]
  pub(crate) fn contains(&self, ptr: *const u8) -> bool {
    self.find(ptr).is_some()
  }

  /// Records that a registered chunk changed size from `old` to `new` bytes.
  #[inline]
  pub(crate) fn resized(&mut self, old: usize, new: usize) {
    self.bytes = self.bytes - old + new;
  }

  pub(crate) fn iter(&self) -> Iter<'_> {
    Iter {
      node: self.head,
      _registry: core::marker::PhantomData,
    }
  }
}

pub(crate) struct Iter<'a> {
  node: *mut Chunk,
  _registry: core::marker::PhantomData<&'a Registry>,
}

impl Iterator for Iter<'_> {
  type Item = *mut Chunk;

  fn next(&mut self) -> Option<*mut Chunk> {
    if self.node.is_null() {
      return None;
    }
    let chunk = self.node;
    self.node = unsafe { *next_slot(chunk) };
    Some(chunk)
  }
}
