use std::io;

use thiserror::Error;

/// Why an allocation could not be satisfied.
#[derive(Error, Debug)]
pub enum AllocError {
  /// The request plus chunk overhead does not fit in `usize`.
  #[error("allocation of {requested} bytes overflows the address space")]
  SizeOverflow { requested: usize },

  /// The operating system refused to map a new region.
  #[error("could not map a {len}-byte region for a {requested}-byte allocation: {source}")]
  Exhausted {
    requested: usize,
    len: usize,
    #[source]
    source: io::Error,
  },

  /// The pointer handed in is not a live allocation. Only reported with the
  /// `checked` feature; otherwise passing such a pointer is undefined behavior.
  #[error("{address:#x} is not a live allocation")]
  NotLive { address: usize },
}

/// A broken heap invariant found by [`Heap::check`](crate::Heap::check).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("heap invariant violated at {address:#x}: {kind}")]
pub struct InvariantViolation {
  /// Address of the offending chunk header (or region, for region-level faults).
  pub address: usize,
  pub kind: Violation,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
  #[error("chunk size is not a multiple of the alignment")]
  Misaligned,
  #[error("chunk runs past the end of its region")]
  Overrun,
  #[error("chunks stop short of the end of their region")]
  Gap,
  #[error("region-start flag on a chunk that is not at the region start")]
  Boundary,
  #[error("recorded size of the chunk below does not match it")]
  PrevSize,
  #[error("two free chunks are adjacent")]
  AdjacentFree,
  #[error("free chunk is not reachable in the size index")]
  Unindexed,
  #[error("allocated chunk is not in the allocation registry")]
  Unregistered,
  #[error("size index totals disagree with the free chunks found")]
  FreeTotals,
  #[error("registry totals disagree with the allocated chunks found")]
  AllocatedTotals,
}
