use core::{
  cell::UnsafeCell,
  hint,
  ops::{Deref, DerefMut},
  sync::atomic::{AtomicBool, Ordering},
};

struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

/// A value guarded by a spin lock. Usable in statics and free of any
/// allocation, so it can sit underneath the global allocator.
pub(crate) struct Locked<T> {
  lock: SpinLock,
  value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Locked<T> {}
unsafe impl<T: Send> Send for Locked<T> {}

impl<T> Locked<T> {
  pub(crate) const fn new(value: T) -> Self {
    Self {
      lock: SpinLock::new(),
      value: UnsafeCell::new(value),
    }
  }

  pub(crate) fn lock(&self) -> Guard<'_, T> {
    self.lock.lock();
    Guard { locked: self }
  }
}

pub(crate) struct Guard<'a, T> {
  locked: &'a Locked<T>,
}

impl<T> Deref for Guard<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    unsafe { &*self.locked.value.get() }
  }
}

impl<T> DerefMut for Guard<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.locked.value.get() }
  }
}

impl<T> Drop for Guard<'_, T> {
  fn drop(&mut self) {
    self.locked.lock.unlock();
  }
}
