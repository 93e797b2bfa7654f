//! Allocation-site bookkeeping, compiled in with the `leak-tracking` feature.

use std::{collections::HashMap, panic::Location};

pub type Site = &'static Location<'static>;

/// Live blocks reserved from one call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeakRecord {
  pub site: Site,
  pub blocks: usize,
  /// Payload bytes those blocks can hold.
  pub bytes: usize,
}

/// Payload address -> (site, capacity) for every block an arena has reserved.
#[derive(Default)]
pub(crate) struct Sites {
  live: HashMap<usize, (Site, usize)>,
}

impl Sites {
  pub fn record(&mut self, addr: usize, site: Site, capacity: usize) {
    self.live.insert(addr, (site, capacity));
  }

  pub fn forget(&mut self, addr: usize) {
    self.live.remove(&addr);
  }

  pub fn site(&self, addr: usize) -> Option<Site> {
    self.live.get(&addr).map(|&(site, _)| site)
  }

  /// Groups live blocks by site, largest footprint first.
  pub fn report(&self) -> Vec<LeakRecord> {
    let mut by_site: HashMap<Site, LeakRecord> = HashMap::new();
    for &(site, capacity) in self.live.values() {
      let record = by_site.entry(site).or_insert(LeakRecord {
        site,
        blocks: 0,
        bytes: 0,
      });
      record.blocks += 1;
      record.bytes += capacity;
    }

    let mut records: Vec<_> = by_site.into_values().collect();
    records.sort_by(|a, b| {
      b.bytes
        .cmp(&a.bytes)
        .then_with(|| a.site.line().cmp(&b.site.line()))
    });
    records
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[track_caller]
  fn here() -> Site {
    Location::caller()
  }

  #[test]
  fn report_groups_by_site() {
    let (a, b) = (here(), here());
    let mut sites = Sites::default();

    sites.record(0x1000, a, 32);
    sites.record(0x2000, a, 32);
    sites.record(0x3000, b, 480);
    sites.forget(0x2000);

    assert_eq!(sites.site(0x1000), Some(a));
    assert_eq!(sites.site(0x2000), None);
    assert_eq!(
      sites.report(),
      vec![
        LeakRecord {
          site: b,
          blocks: 1,
          bytes: 480
        },
        LeakRecord {
          site: a,
          blocks: 1,
          bytes: 32
        },
      ]
    );
  }
}
