#![cfg(feature = "leak-tracking")]

use buddy_arena::{Config, Registry};

#[test]
fn report_groups_live_blocks_by_site() {
  let registry = Registry::new();
  registry.initialize(Config::default().with_page_size(4096)).unwrap();

  let mut small = Vec::new();
  for _ in 0..3 {
    small.push(registry.allocate(24).unwrap().unwrap());
  }
  let line = line!() + 1;
  let large = registry.allocate(10_000).unwrap().unwrap();

  let site = registry.allocation_site(large.as_ptr()).unwrap();
  assert_eq!(site.file(), file!());
  assert_eq!(site.line(), line);

  let report = registry.leak_report();
  assert_eq!(report.len(), 2);
  assert_eq!(report[0].site, site);
  assert_eq!(report[0].blocks, 1);
  assert_eq!(report[0].bytes, 10_000);
  assert_eq!(report[1].blocks, 3);

  unsafe { registry.free(large.as_ptr()) };
  assert_eq!(registry.allocation_site(large.as_ptr()), None);
  for ptr in small {
    unsafe { registry.free(ptr.as_ptr()) };
  }
  assert!(registry.leak_report().is_empty());
  registry.shutdown().unwrap();
}

#[test]
fn zeroed_and_moved_blocks_keep_caller_site() {
  let registry = Registry::new();
  registry.initialize(Config::default().with_page_size(4096)).unwrap();

  let zeroed = registry.allocate_zeroed(4, 8).unwrap().unwrap();
  assert_eq!(registry.allocation_site(zeroed.as_ptr()).unwrap().file(), file!());

  let line = line!() + 1;
  let moved = unsafe { registry.reallocate(zeroed.as_ptr(), 200) }.unwrap().unwrap();
  assert_eq!(registry.allocation_site(moved.as_ptr()).unwrap().line(), line);

  unsafe { registry.free(moved.as_ptr()) };
  registry.shutdown().unwrap();
}
