/// Snapshot of an arena's counters. Watermarks only ever grow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
  /// Bytes obtained from the system, standard and extra pages together.
  pub total_space: usize,
  pub total_space_watermark: usize,

  /// Bytes held as standard pages.
  pub std_space: usize,
  pub std_space_watermark: usize,
  /// Bytes of standard pages handed out as reserved blocks (whole blocks, headers included).
  pub std_used_space: usize,
  pub std_used_space_watermark: usize,
  pub std_page_size: usize,
  pub std_pages: usize,
  /// Standard pages that are not one whole free block.
  pub std_pages_used: usize,
  pub std_pages_used_watermark: usize,

  /// Bytes mapped for extra blocks.
  pub extra_space: usize,
  pub extra_space_watermark: usize,
  pub extra_pages: usize,
  pub extra_pages_watermark: usize,
  pub min_extra_page_size: usize,
  pub max_extra_page_size: usize,
}

impl Stats {
  pub(crate) fn new(page_size: usize) -> Self {
    Self {
      std_page_size: page_size,
      ..Self::default()
    }
  }

  pub(crate) fn insert_std_page(&mut self) {
    self.total_space += self.std_page_size;
    self.total_space_watermark = self.total_space_watermark.max(self.total_space);
    self.std_space += self.std_page_size;
    self.std_space_watermark = self.std_space_watermark.max(self.std_space);
    self.std_pages += 1;
  }

  pub(crate) fn remove_std_page(&mut self) {
    self.total_space -= self.std_page_size;
    self.std_space -= self.std_page_size;
    self.std_pages -= 1;
  }

  pub(crate) fn use_std_page(&mut self) {
    self.std_pages_used += 1;
    self.std_pages_used_watermark = self.std_pages_used_watermark.max(self.std_pages_used);
  }

  pub(crate) fn free_std_page(&mut self) {
    self.std_pages_used -= 1;
  }

  pub(crate) fn use_std_space(&mut self, amount: usize) {
    self.std_used_space += amount;
    self.std_used_space_watermark = self.std_used_space_watermark.max(self.std_used_space);
  }

  pub(crate) fn free_std_space(&mut self, amount: usize) {
    self.std_used_space -= amount;
  }

  pub(crate) fn add_extra_page(&mut self, size: usize) {
    self.total_space += size;
    self.total_space_watermark = self.total_space_watermark.max(self.total_space);
    self.extra_space += size;
    self.extra_space_watermark = self.extra_space_watermark.max(self.extra_space);
    if self.min_extra_page_size == 0 || self.min_extra_page_size > size {
      self.min_extra_page_size = size;
    }
    self.max_extra_page_size = self.max_extra_page_size.max(size);
    self.extra_pages += 1;
    self.extra_pages_watermark = self.extra_pages_watermark.max(self.extra_pages);
  }

  pub(crate) fn remove_extra_page(&mut self, size: usize) {
    self.total_space -= size;
    self.extra_space -= size;
    self.extra_pages -= 1;
  }

  /// Percentage of the used standard pages not handed out to callers.
  /// `None` while no standard page is in use.
  pub fn fragmentation(&self) -> Option<f64> {
    if self.std_pages_used == 0 {
      return None;
    }
    let capacity = self.std_pages_used as f64 * self.std_page_size as f64;
    Some(100.0 - 100.0 * self.std_used_space as f64 / capacity)
  }
}
