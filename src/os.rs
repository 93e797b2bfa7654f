use core::ptr::NonNull;

// =============================================================================
// Platform
// =============================================================================

/// Maps `size` bytes of zeroed, page-aligned memory.
pub(crate) fn map(size: usize) -> Option<NonNull<u8>> {
  if size == 0 {
    return None;
  }

  let ptr = unsafe {
    libc::mmap(
      core::ptr::null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    None
  } else {
    NonNull::new(ptr.cast::<u8>())
  }
}

/// Returns a mapping obtained from [`map`] to the system.
pub(crate) unsafe fn unmap(ptr: NonNull<u8>, size: usize) {
  let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
  debug_assert_eq!(rc, 0, "munmap({ptr:p}, {size}) failed");
}
