use crate::block::{HEADER_SIZE, MIN_PAYLOAD, log2_ceil};
use crate::error::{Error, Result};

/// Standard page size: 1MB = 2^20.
pub const DEFAULT_PAGE_SIZE: usize = 1 << 20;
/// Keep at least 3x the number of used pages.
pub const DEFAULT_KEEP_FACTOR: usize = 3;
/// Never shrink below 5 pages once that many exist.
pub const DEFAULT_KEEP_MINIMUM: usize = 5;

/// Largest page exponent an arena accepts.
const MAX_PAGE_EXPONENT: u32 = usize::BITS - 2;

/// Per-arena policy, fixed by `Registry::initialize`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
  /// Size of a standard page in bytes. Rounded up to the next power of two.
  pub page_size: usize,
  /// Grow by a new page when no free block is large enough.
  pub on_demand: bool,
  /// Serve requests larger than a page straight from the system.
  pub extra_alloc: bool,
  /// Let the garbage collector return empty pages to the system.
  pub release_pages: bool,
  /// Keep at least `keep_factor` x pages-in-use pages.
  pub keep_factor: usize,
  /// Never release pages while at most `keep_minimum` exist.
  pub keep_minimum: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      page_size: DEFAULT_PAGE_SIZE,
      on_demand: true,
      extra_alloc: true,
      release_pages: true,
      keep_factor: DEFAULT_KEEP_FACTOR,
      keep_minimum: DEFAULT_KEEP_MINIMUM,
    }
  }
}

impl Config {
  pub fn with_page_size(mut self, page_size: usize) -> Self {
    self.page_size = page_size;
    self
  }

  pub fn with_page_exponent(mut self, exponent: u32) -> Self {
    self.page_size = 1usize.checked_shl(exponent).unwrap_or(0);
    self
  }

  pub fn with_on_demand(mut self, enabled: bool) -> Self {
    self.on_demand = enabled;
    self
  }

  pub fn with_extra_alloc(mut self, enabled: bool) -> Self {
    self.extra_alloc = enabled;
    self
  }

  pub fn with_release_pages(mut self, enabled: bool) -> Self {
    self.release_pages = enabled;
    self
  }

  pub fn with_keep_factor(mut self, factor: usize) -> Self {
    self.keep_factor = factor;
    self
  }

  pub fn with_keep_minimum(mut self, minimum: usize) -> Self {
    self.keep_minimum = minimum;
    self
  }

  /// Validates the page size and returns its exponent.
  pub fn page_exponent(&self) -> Result<u32> {
    // A page must at least hold one header and the free-list links.
    if self.page_size <= HEADER_SIZE + MIN_PAYLOAD {
      return Err(Error::InvalidConfig {
        reason: "page size too small",
      });
    }

    match log2_ceil(self.page_size) {
      Some(exp) if exp <= MAX_PAGE_EXPONENT => Ok(exp),
      _ => Err(Error::InvalidConfig {
        reason: "page size too large",
      }),
    }
  }
}
