use core::ptr::null_mut;

use crate::block::{BlockHeader, payload_of};

/// Where an arena stands in its teardown.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Phase {
  /// Attached to its owner thread.
  Active,
  /// Shutdown found reserved blocks. Only holders of the queue lock may
  /// touch the arena; the free that returns its last block finalizes it.
  TeardownPending,
  /// Every page is back to the system.
  Destroyed,
}

/// Blocks freed by foreign threads, waiting for the owner to merge them.
///
/// The link is the first word of each block's payload, which is still
/// reserved and therefore unused by the free-list index.
pub(crate) struct Deferred {
  head: *mut BlockHeader,
  len: usize,
  pub phase: Phase,
}

// SAFETY: the queue only stores addresses of blocks; it is always accessed
// under the owning arena's mutex.
unsafe impl Send for Deferred {}

impl Deferred {
  pub const fn new() -> Self {
    Self {
      head: null_mut(),
      len: 0,
      phase: Phase::Active,
    }
  }

  /// Pushes a reserved block.
  pub unsafe fn push(&mut self, block: *mut BlockHeader) {
    unsafe { link_of(block).write(self.head) };
    self.head = block;
    self.len += 1;
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  /// Detaches the whole list.
  pub fn take(&mut self) -> Chain {
    let head = core::mem::replace(&mut self.head, null_mut());
    self.len = 0;
    Chain { next: head }
  }
}

/// A detached list of deferred blocks.
///
/// Each link is read before its block is handed out, so the consumer is free
/// to merge the block (and overwrite its payload) right away.
pub(crate) struct Chain {
  next: *mut BlockHeader,
}

impl Chain {
  pub fn is_empty(&self) -> bool {
    self.next.is_null()
  }
}

impl Iterator for Chain {
  type Item = *mut BlockHeader;

  fn next(&mut self) -> Option<Self::Item> {
    if self.next.is_null() {
      return None;
    }
    let block = self.next;
    self.next = unsafe { link_of(block).read() };
    Some(block)
  }
}

#[inline]
unsafe fn link_of(block: *mut BlockHeader) -> *mut *mut BlockHeader {
  unsafe { payload_of(block).cast::<*mut BlockHeader>().as_ptr() }
}
