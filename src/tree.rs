use core::ptr::null_mut;

use crate::chunk::{Chunk, ChunkState};

/// Size-keyed binary search tree over free chunks, linked through the chunks'
/// own headers.
///
/// A chunk whose size is less than or equal to a node's size lives in that
/// node's left subtree, a larger one in the right subtree. The tree is never
/// rebalanced.
pub(crate) struct FreeTree {
  root: *mut Chunk,
  len: usize,
  bytes: usize,
}

/// Child slots of a free chunk.
#[inline]
unsafe fn links(chunk: *mut Chunk) -> (*mut *mut Chunk, *mut *mut Chunk) {
  match unsafe { &mut (*chunk).state } {
    ChunkState::Free { left, right } => (left as *mut _, right as *mut _),
    ChunkState::Allocated { .. } => {
      unreachable!("allocated chunk {chunk:p} reached through the free tree")
    }
  }
}

impl FreeTree {
  pub(crate) const fn new() -> Self {
    Self {
      root: null_mut(),
      len: 0,
      bytes: 0,
    }
  }

  /// Number of chunks in the tree.
  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.len
  }

  /// Sum of the payload sizes of all chunks in the tree.
  #[inline]
  pub(crate) fn bytes(&self) -> usize {
    self.bytes
  }

  /// Forgets every chunk without touching their headers.
  pub(crate) fn clear(&mut self) {
    *self = Self::new();
  }

  /// Links `chunk` in at the leaf position for its size. Resets the chunk to
  /// the free state with no children.
  pub(crate) unsafe fn insert(&mut self, chunk: *mut Chunk) {
    unsafe {
      (*chunk).state = ChunkState::DETACHED;
      let size = (*chunk).size;

      let mut slot: *mut *mut Chunk = &raw mut self.root;
      while !(*slot).is_null() {
        let node = *slot;
        let (left, right) = links(node);
        slot = if size <= (*node).size { left } else { right };
      }
      *slot = chunk;
    }

    self.len += 1;
    self.bytes += unsafe { (*chunk).size };
  }

  /// Unlinks `chunk`. Returns false if it is not in the tree.
  ///
  /// The chunk's size must be the one it was inserted with.
  pub(crate) unsafe fn remove(&mut self, chunk: *mut Chunk) -> bool {
    unsafe {
      let Some(slot) = self.find_slot(chunk) else {
        return false;
      };

      let (left, right) = links(chunk);
      let (l, r) = (*left, *right);

      *slot = if l.is_null() {
        r
      } else if r.is_null() {
        l
      } else {
        // Hang the left subtree under the smallest node on the right and
        // promote the right subtree.
        let mut min = r;
        loop {
          let (min_left, _) = links(min);
          if (*min_left).is_null() {
            *min_left = l;
            break;
          }
          min = *min_left;
        }
        r
      };

      (*chunk).state = ChunkState::DETACHED;
      self.len -= 1;
      self.bytes -= (*chunk).size;
    }
    true
  }

  /// Whether `chunk` is linked into the tree.
  pub(crate) unsafe fn contains(&self, chunk: *mut Chunk) -> bool {
    let mut node = self.root;
    let size = unsafe { (*chunk).size };
    while !node.is_null() {
      if node == chunk {
        return true;
      }
      unsafe {
        let (left, right) = links(node);
        node = if size <= (*node).size { *left } else { *right };
      }
    }
    false
  }

  /// Smallest chunk with at least `size` payload bytes, without removing it.
  pub(crate) unsafe fn best_fit(&self, size: usize) -> Option<*mut Chunk> {
    let mut best: *mut Chunk = null_mut();
    let mut node = self.root;

    while !node.is_null() {
      unsafe {
        let (left, right) = links(node);
        let node_size = (*node).size;
        if node_size >= size {
          if best.is_null() || node_size < (*best).size {
            best = node;
          }
          node = *left;
        } else {
          node = *right;
        }
      }
    }

    (!best.is_null()).then_some(best)
  }

  /// Removes and returns the best fit for `size`.
  pub(crate) unsafe fn take_best_fit(&mut self, size: usize) -> Option<*mut Chunk> {
    let best = unsafe { self.best_fit(size)? };
    let removed = unsafe { self.remove(best) };
    debug_assert!(removed, "best fit {best:p} could not be unlinked");
    Some(best)
  }

  /// The slot (root or a child link) that points at `chunk`.
  unsafe fn find_slot(&mut self, chunk: *mut Chunk) -> Option<*mut *mut Chunk> {
    let size = unsafe { (*chunk).size };
    let mut slot: *mut *mut Chunk = &raw mut self.root;

    loop {
      let node = unsafe { *slot };
      if node.is_null() {
        return None;
      }
      if node == chunk {
        return Some(slot);
      }
      let (left, right) = unsafe { links(node) };
      slot = if size <= unsafe { (*node).size } { left } else { right };
    }
  }
}
