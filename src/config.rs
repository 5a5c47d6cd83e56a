/// Runtime knobs of a [`Heap`](crate::Heap).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HeapConfig {
  /// Lower bound on the length of each region requested from the OS. Requests
  /// larger than this get a region sized to fit them, rounded to whole pages.
  pub region_size: usize,
  /// Emit `log` records for region growth, failures and per-call tracing.
  ///
  /// Must stay off for a heap that backs the logger's own allocations.
  pub log_events: bool,
}

impl HeapConfig {
  pub const DEFAULT_REGION_SIZE: usize = 64 * 1024;

  pub const fn new() -> Self {
    Self {
      region_size: Self::DEFAULT_REGION_SIZE,
      log_events: true,
    }
  }

  /// Default settings with logging disabled.
  pub const fn quiet() -> Self {
    Self::new().with_log_events(false)
  }

  pub const fn with_region_size(mut self, region_size: usize) -> Self {
    self.region_size = region_size;
    self
  }

  pub const fn with_log_events(mut self, log_events: bool) -> Self {
    self.log_events = log_events;
    self
  }
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self::new()
  }
}
