use core::ptr::null_mut;

use crate::block::{BlockHeader, CLASS_COUNT, links_of};

/// Per-arena free-list index: one intrusive doubly-linked chain per size class.
///
/// Links live in the payload of each free block, so insertion and removal are
/// O(1) given a block pointer. `occupied` has bit `k` set iff chain `k` is
/// non-empty.
pub(crate) struct FreeIndex {
  heads: [*mut BlockHeader; CLASS_COUNT],
  occupied: u64,
}

impl FreeIndex {
  pub const fn new() -> Self {
    Self {
      heads: [null_mut(); CLASS_COUNT],
      occupied: 0,
    }
  }

  /// Pushes a free block onto chain `class`.
  pub unsafe fn insert(&mut self, block: *mut BlockHeader, class: u32) {
    let class = class as usize;
    let head = self.heads[class];
    unsafe {
      let links = links_of(block);
      (*links).next = head;
      (*links).prev = null_mut();
      if !head.is_null() {
        (*links_of(head)).prev = block;
      }
    }
    self.heads[class] = block;
    self.occupied |= 1 << class;
  }

  /// Unlinks `block` from chain `class`. The block must be on that chain.
  pub unsafe fn remove(&mut self, block: *mut BlockHeader, class: u32) {
    let class = class as usize;
    unsafe {
      let links = links_of(block);
      let (next, prev) = ((*links).next, (*links).prev);
      if prev.is_null() {
        debug_assert_eq!(self.heads[class], block);
        self.heads[class] = next;
      } else {
        (*links_of(prev)).next = next;
      }
      if !next.is_null() {
        (*links_of(next)).prev = prev;
      }
      (*links).next = null_mut();
      (*links).prev = null_mut();
    }
    if self.heads[class].is_null() {
      self.occupied &= !(1 << class);
    }
  }

  /// Smallest non-empty class `>= class`.
  #[inline]
  pub fn first_fit(&self, class: u32) -> Option<u32> {
    let candidates = self.occupied & u64::MAX.checked_shl(class).unwrap_or(0);
    (candidates != 0).then(|| candidates.trailing_zeros())
  }

  #[inline]
  pub fn head(&self, class: u32) -> *mut BlockHeader {
    self.heads[class as usize]
  }

  pub fn is_empty(&self) -> bool {
    self.occupied == 0
  }

  /// Iterates every free block of chain `class`.
  pub fn iter(&self, class: u32) -> Iter<'_> {
    Iter {
      current: self.heads[class as usize],
      _index: self,
    }
  }
}

pub(crate) struct Iter<'a> {
  current: *mut BlockHeader,
  _index: &'a FreeIndex,
}

impl Iterator for Iter<'_> {
  type Item = *mut BlockHeader;

  fn next(&mut self) -> Option<Self::Item> {
    if self.current.is_null() {
      return None;
    }
    let block = self.current;
    self.current = unsafe { (*links_of(block)).next };
    Some(block)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block::HEADER_SIZE;

  const SLOT: usize = 64;

  fn blocks<const N: usize>(storage: &mut [[u64; SLOT / 8]; N]) -> [*mut BlockHeader; N] {
    core::array::from_fn(|i| storage[i].as_mut_ptr().cast::<BlockHeader>())
  }

  #[test]
  fn slot_fits_links() {
    assert!(SLOT >= HEADER_SIZE + size_of::<crate::block::FreeLinks>());
  }

  #[test]
  fn insert_remove_tracks_occupancy() {
    let mut storage = [[0u64; SLOT / 8]; 3];
    let [a, b, c] = blocks(&mut storage);
    let mut index = FreeIndex::new();

    unsafe {
      index.insert(a, 6);
      index.insert(b, 6);
      index.insert(c, 9);
    }
    assert_eq!(index.iter(6).count(), 2);
    assert_eq!(index.first_fit(0), Some(6));
    assert_eq!(index.first_fit(7), Some(9));
    assert_eq!(index.first_fit(10), None);

    // Removing from the middle keeps the chain intact.
    unsafe { index.remove(a, 6) };
    assert_eq!(index.iter(6).collect::<Vec<_>>(), vec![b]);

    unsafe {
      index.remove(b, 6);
      index.remove(c, 9);
    }
    assert!(index.is_empty());
    assert_eq!(index.first_fit(0), None);
  }

  #[test]
  fn remove_head_promotes_next() {
    let mut storage = [[0u64; SLOT / 8]; 3];
    let [a, b, c] = blocks(&mut storage);
    let mut index = FreeIndex::new();

    unsafe {
      index.insert(a, 12);
      index.insert(b, 12);
      index.insert(c, 12);
      index.remove(c, 12);
    }
    assert_eq!(index.head(12), b);
    assert_eq!(index.iter(12).collect::<Vec<_>>(), vec![b, a]);
  }

  #[test]
  fn first_fit_top_class() {
    let mut storage = [[0u64; SLOT / 8]; 1];
    let [a] = blocks(&mut storage);
    let mut index = FreeIndex::new();

    unsafe { index.insert(a, 63) };
    assert_eq!(index.first_fit(63), Some(63));
    assert_eq!(index.first_fit(64), None);
  }
}
