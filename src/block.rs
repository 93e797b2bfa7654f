use core::{
  mem::size_of,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicU8, Ordering},
};

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Tag stamped on every free block.
pub(crate) const MAGIC_FREE: u32 = 0xF4EE_B10C;
/// Tag stamped on every reserved block.
pub(crate) const MAGIC_RESERVED: u32 = 0x1D0B_E1AE;
/// Tag stamped on a block queued for its owner by another thread.
pub(crate) const MAGIC_DEFERRED: u32 = 0xDEFE_44ED;

const STATUS_FREE: u8 = 0xF5;
const STATUS_RESERVED: u8 = 0x5E;
const STATUS_DEFERRED: u8 = 0xDF;

/// Owner of a block no arena holds (free blocks).
pub(crate) const NO_OWNER: u64 = 0;

/// Payload alignment.
pub const ALIGNMENT: usize = 16;

/// Bytes between a block's start and its payload.
pub const HEADER_SIZE: usize = align_up(size_of::<BlockHeader>(), ALIGNMENT);

/// Smallest payload: a free block must hold its list links.
pub const MIN_PAYLOAD: usize = size_of::<FreeLinks>();

/// Number of size classes (exponents 0..63).
pub(crate) const CLASS_COUNT: usize = usize::BITS as usize;

const _: () = assert!(size_of::<BlockHeader>() == 32);
const _: () = assert!(HEADER_SIZE % ALIGNMENT == 0);
const _: () = assert!(ALIGNMENT >= align_of::<usize>());

// =============================================================================
// Types
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Status {
  Free,
  Reserved,
  /// Freed by a foreign thread, waiting on the owner's queue.
  Deferred,
}

/// Logical view of a block, decoded from its header.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum BlockKind {
  /// Carved from an arena page.
  Standard {
    page: *mut u8,
    page_exp: u32,
    exp: u32,
  },
  /// Mapped straight from the system; `size` covers header and payload.
  Extra { size: usize },
}

/// Sits at offset 0 of every block, standard or extra.
#[repr(C)]
pub(crate) struct BlockHeader {
  /// Base of the owning page. Null for extra blocks.
  page: *mut u8,
  /// Total mapping size of an extra block.
  extra_size: usize,
  /// Arena that reserved the block.
  owner: u64,
  magic: u32,
  /// Raw status byte. Anything but the known values means "not a block".
  /// Atomic because a foreign free rewrites it while the owner may be
  /// reading it as a buddy.
  status: AtomicU8,
  page_exp: u8,
  exp: u8,
  _pad: u8,
}

/// Free-list links, stored in the payload of a free block.
#[repr(C)]
pub(crate) struct FreeLinks {
  pub next: *mut BlockHeader,
  pub prev: *mut BlockHeader,
}

impl BlockHeader {
  /// Writes a fresh free header for a block of `2^exp` bytes inside `page`.
  pub unsafe fn init_free(block: *mut BlockHeader, page: *mut u8, page_exp: u32, exp: u32) {
    debug_assert!(exp <= page_exp);
    unsafe {
      block.write(BlockHeader {
        page,
        extra_size: 0,
        owner: NO_OWNER,
        magic: MAGIC_FREE,
        status: AtomicU8::new(STATUS_FREE),
        page_exp: page_exp as u8,
        exp: exp as u8,
        _pad: 0,
      });
    }
  }

  /// Writes a reserved header for an extra block mapped with `size` bytes.
  pub unsafe fn init_extra(block: *mut BlockHeader, size: usize, owner: u64) {
    unsafe {
      block.write(BlockHeader {
        page: null_mut(),
        extra_size: size,
        owner,
        magic: MAGIC_RESERVED,
        status: AtomicU8::new(STATUS_RESERVED),
        page_exp: 0,
        exp: 0,
        _pad: 0,
      });
    }
  }

  /// Checks the status byte and its tag. Never trusts a header that fails.
  pub fn validate(&self) -> Result<Status> {
    let addr = self as *const Self as usize;
    let (status, expected) = match self.status.load(Ordering::Relaxed) {
      STATUS_FREE => (Status::Free, MAGIC_FREE),
      STATUS_RESERVED => (Status::Reserved, MAGIC_RESERVED),
      STATUS_DEFERRED => (Status::Deferred, MAGIC_DEFERRED),
      _ => return Err(Error::Corrupted { addr }),
    };
    if self.magic != expected {
      return Err(Error::Corrupted { addr });
    }
    if self.page.is_null() {
      if status == Status::Free || self.extra_size <= HEADER_SIZE {
        return Err(Error::Corrupted { addr });
      }
    } else if self.exp > self.page_exp || (self.page_exp as usize) >= CLASS_COUNT {
      return Err(Error::Corrupted { addr });
    }
    Ok(status)
  }

  pub fn kind(&self) -> BlockKind {
    if self.page.is_null() {
      BlockKind::Extra {
        size: self.extra_size,
      }
    } else {
      BlockKind::Standard {
        page: self.page,
        page_exp: self.page_exp as u32,
        exp: self.exp as u32,
      }
    }
  }

  #[inline]
  pub fn owner(&self) -> u64 {
    self.owner
  }

  #[inline]
  pub fn exp(&self) -> u32 {
    self.exp as u32
  }

  #[inline]
  pub fn is_free(&self) -> bool {
    self.status.load(Ordering::Relaxed) == STATUS_FREE
  }

  #[inline]
  pub fn set_exp(&mut self, exp: u32) {
    debug_assert!(exp <= self.page_exp as u32);
    self.exp = exp as u8;
  }

  pub fn mark_reserved(&mut self, owner: u64) {
    self.status.store(STATUS_RESERVED, Ordering::Relaxed);
    self.magic = MAGIC_RESERVED;
    self.owner = owner;
  }

  /// Owner is kept: the queue drains into the arena that reserved the block.
  pub fn mark_deferred(&mut self) {
    self.status.store(STATUS_DEFERRED, Ordering::Relaxed);
    self.magic = MAGIC_DEFERRED;
  }

  pub fn mark_free(&mut self) {
    self.status.store(STATUS_FREE, Ordering::Relaxed);
    self.magic = MAGIC_FREE;
    self.owner = NO_OWNER;
  }

  /// Bytes the caller may use.
  pub fn capacity(&self) -> usize {
    match self.kind() {
      BlockKind::Standard { exp, .. } => (1usize << exp) - HEADER_SIZE,
      BlockKind::Extra { size } => size - HEADER_SIZE,
    }
  }
}

// =============================================================================
// Address arithmetic
// =============================================================================

#[inline]
pub(crate) unsafe fn header_of(payload: NonNull<u8>) -> *mut BlockHeader {
  unsafe { payload.byte_sub(HEADER_SIZE).cast::<BlockHeader>().as_ptr() }
}

#[inline]
pub(crate) unsafe fn payload_of(block: *mut BlockHeader) -> NonNull<u8> {
  unsafe { NonNull::new_unchecked(block.cast::<u8>().add(HEADER_SIZE)) }
}

#[inline]
pub(crate) unsafe fn links_of(block: *mut BlockHeader) -> *mut FreeLinks {
  unsafe { block.cast::<u8>().add(HEADER_SIZE).cast::<FreeLinks>() }
}

/// The other half of the `2^(exp+1)` block `block` belongs to.
#[inline]
pub(crate) fn buddy_of(block: *mut BlockHeader, page: *mut u8, exp: u32) -> *mut BlockHeader {
  let offset = block as usize - page as usize;
  page.wrapping_add(offset ^ (1 << exp)).cast()
}

/// `ceil(log2(n))`, `None` when the result would not fit a `usize`.
#[inline]
pub(crate) fn log2_ceil(n: usize) -> Option<u32> {
  n.checked_next_power_of_two().map(usize::trailing_zeros)
}

/// Size class of the block that serves a `size`-byte request.
#[inline]
pub(crate) fn class_for(size: usize) -> Option<u32> {
  size
    .max(MIN_PAYLOAD)
    .checked_add(HEADER_SIZE)
    .and_then(log2_ceil)
    .filter(|&class| (class as usize) < CLASS_COUNT)
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn header_layout() {
    assert_eq!(HEADER_SIZE, 32);
    assert_eq!(MIN_PAYLOAD, 2 * size_of::<usize>());
  }

  #[test]
  fn smallest_class_holds_links() {
    let class = class_for(0).unwrap();

    assert_eq!(class, 6);
    assert!((1usize << class) - HEADER_SIZE >= MIN_PAYLOAD);
  }

  #[test]
  fn class_boundaries() {
    assert_eq!(class_for(4096 - HEADER_SIZE), Some(12));
    assert_eq!(class_for(4096 - HEADER_SIZE + 1), Some(13));
    assert_eq!(class_for(usize::MAX), None);
    assert_eq!(class_for(usize::MAX / 2 + 2), None);
  }

  #[test]
  fn log2_ceil_rounds_up() {
    assert_eq!(log2_ceil(1), Some(0));
    assert_eq!(log2_ceil(4096), Some(12));
    assert_eq!(log2_ceil(4097), Some(13));
    assert_eq!(log2_ceil(usize::MAX), None);
  }

  #[test]
  fn buddy_is_symmetric() {
    let page = 0x10_0000 as *mut u8;
    let left = page.wrapping_add(0x400).cast::<BlockHeader>();
    let right = buddy_of(left, page, 10);

    assert_eq!(right as usize, 0x10_0000);
    assert_eq!(buddy_of(right, page, 10), left);
  }

  #[test]
  fn validate_catches_tampering() {
    let mut storage = [0u64; 8];
    let block = storage.as_mut_ptr().cast::<BlockHeader>();
    let page = block.cast::<u8>();

    unsafe {
      BlockHeader::init_free(block, page, 6, 6);
      assert_eq!((*block).validate(), Ok(Status::Free));

      (*block).mark_reserved(7);
      assert_eq!((*block).validate(), Ok(Status::Reserved));
      assert_eq!((*block).owner(), 7);
      assert_eq!((*block).capacity(), 64 - HEADER_SIZE);

      (*block).mark_deferred();
      assert_eq!((*block).validate(), Ok(Status::Deferred));
      assert_eq!((*block).owner(), 7);
      assert!(!(*block).is_free());
      (*block).mark_reserved(7);

      (*block).magic = MAGIC_FREE;
      assert!(matches!((*block).validate(), Err(Error::Corrupted { .. })));

      (*block).status.store(0xFF, Ordering::Relaxed);
      assert!((*block).validate().is_err());
    }
  }

  #[test]
  fn extra_header_decodes() {
    let mut storage = [0u64; 4];
    let block = storage.as_mut_ptr().cast::<BlockHeader>();

    unsafe {
      BlockHeader::init_extra(block, 1 << 20, 3);
      assert_eq!((*block).kind(), BlockKind::Extra { size: 1 << 20 });
      assert_eq!((*block).capacity(), (1 << 20) - HEADER_SIZE);
      assert_eq!((*block).validate(), Ok(Status::Reserved));
    }
  }
}
