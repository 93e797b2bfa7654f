use buddy_arena::{Config, Error, Registry};
use rand::prelude::*;
use std::{
  ptr::NonNull,
  sync::{Arc, Barrier, mpsc},
  thread,
};

const PAGE: usize = 4096;

/// A block address handed between threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Addr(usize);

impl Addr {
  fn of(ptr: NonNull<u8>) -> Self {
    Self(ptr.as_ptr() as usize)
  }

  fn ptr(self) -> *mut u8 {
    self.0 as *mut u8
  }
}

fn small() -> Config {
  Config::default().with_page_size(PAGE)
}

#[test]
fn foreign_free_is_reused_after_drain() {
  let registry = Registry::new();
  registry.initialize(small()).unwrap();

  let ptr = registry.allocate(100).unwrap().unwrap();
  let used = registry.stats().std_used_space;
  assert_eq!(used, 256);

  let addr = Addr::of(ptr);
  let freer = registry.clone();
  thread::spawn(move || {
    unsafe { freer.free(addr.ptr()) };
    // Freeing never hands the foreign thread an arena of its own.
    assert_eq!(freer.current_arena(), None);
  })
  .join()
  .unwrap();

  // Still counted until the owner drains its queue, but no longer live.
  assert_eq!(registry.stats().std_used_space, used);
  assert!(!unsafe { registry.check_block(ptr.as_ptr()) });
  assert_eq!(unsafe { registry.usable_size(ptr.as_ptr()) }, None);

  assert_eq!(registry.allocate(0), Ok(None));
  assert_eq!(registry.stats().std_used_space, 0);
  assert_eq!(registry.free_blocks().len(), 1);

  let again = registry.allocate(100).unwrap().unwrap();
  assert_eq!(again, ptr);
  unsafe { registry.free(again.as_ptr()) };
  registry.shutdown().unwrap();
}

#[test]
fn foreign_double_free_is_ignored() {
  let registry = Registry::new();
  registry.initialize(small()).unwrap();

  // Buddies: a wrongly repeated release of `a` would merge across `b`.
  let a = registry.allocate(100).unwrap().unwrap();
  let b = registry.allocate(100).unwrap().unwrap();
  assert_eq!(registry.stats().std_used_space, 512);

  let addr = Addr::of(a);
  let freer = registry.clone();
  thread::spawn(move || unsafe {
    freer.free(addr.ptr());
    freer.free(addr.ptr());
  })
  .join()
  .unwrap();

  assert_eq!(registry.allocate(0), Ok(None));
  let stats = registry.stats();
  assert_eq!(stats.std_used_space, 256);
  assert!(unsafe { registry.check_block(b.as_ptr()) });

  let free = registry.free_blocks();
  let mut addrs: Vec<_> = free.iter().map(|block| block.addr).collect();
  addrs.sort_unstable();
  addrs.dedup();
  assert_eq!(addrs.len(), free.len());
  assert_eq!(
    free.iter().map(|block| 1usize << block.exponent).sum::<usize>() + stats.std_used_space,
    stats.std_space
  );

  let x = registry.allocate(200).unwrap().unwrap();
  let y = registry.allocate(200).unwrap().unwrap();
  assert_ne!(x, y);
  assert_ne!(x, b);
  assert_ne!(y, b);

  unsafe {
    registry.free(x.as_ptr());
    registry.free(y.as_ptr());
    registry.free(b.as_ptr());
  }
  assert_eq!(registry.stats().std_used_space, 0);
  registry.shutdown().unwrap();
}

#[test]
fn owner_free_of_queued_block_is_ignored() {
  let registry = Registry::new();
  registry.initialize(small()).unwrap();
  let ptr = registry.allocate(100).unwrap().unwrap();

  let addr = Addr::of(ptr);
  let freer = registry.clone();
  thread::spawn(move || unsafe { freer.free(addr.ptr()) })
    .join()
    .unwrap();

  // Already on the queue: neither a local free nor a reallocate may touch it.
  unsafe { registry.free(ptr.as_ptr()) };
  assert_eq!(
    unsafe { registry.reallocate(ptr.as_ptr(), 10) },
    Err(Error::NotReserved { addr: addr.0 })
  );
  assert_eq!(registry.stats().std_used_space, 256);

  assert_eq!(registry.allocate(0), Ok(None));
  assert_eq!(registry.stats().std_used_space, 0);
  assert_eq!(registry.free_blocks().len(), 1);
  registry.shutdown().unwrap();
}

#[test]
fn foreign_extra_block_is_queued() {
  let registry = Registry::new();
  registry.initialize(small()).unwrap();
  let extra = Addr::of(registry.allocate(PAGE * 2).unwrap().unwrap());

  let freer = registry.clone();
  thread::spawn(move || unsafe { freer.free(extra.ptr()) })
    .join()
    .unwrap();
  assert_eq!(registry.stats().extra_pages, 1);

  registry.shutdown().unwrap();
  assert_eq!(registry.arena_count(), 0);
}

#[test]
fn last_foreign_free_completes_teardown() {
  let registry = Registry::new();
  registry.initialize(small()).unwrap();
  let id = registry.current_arena().unwrap();
  let held: Vec<_> = (0..3)
    .map(|_| Addr::of(registry.allocate(500).unwrap().unwrap()))
    .collect();

  assert_eq!(registry.shutdown(), Err(Error::InUse));
  assert!(registry.contains_arena(id));
  assert_eq!(registry.current_arena(), None);

  let (tx, rx) = mpsc::channel::<Addr>();
  let (done_tx, done_rx) = mpsc::channel::<()>();
  let freer = {
    let registry = registry.clone();
    thread::spawn(move || {
      for addr in rx {
        unsafe { registry.free(addr.ptr()) };
        done_tx.send(()).unwrap();
      }
    })
  };

  for (i, &addr) in held.iter().enumerate() {
    tx.send(addr).unwrap();
    done_rx.recv().unwrap();
    let last = i + 1 == held.len();
    assert_eq!(registry.contains_arena(id), !last);
  }

  drop(tx);
  freer.join().unwrap();
  assert_eq!(registry.arena_count(), 0);
}

#[test]
fn thread_exit_reclaims_arena() {
  let registry = Registry::new();

  let worker = registry.clone();
  let id = thread::spawn(move || {
    worker.initialize(small()).unwrap();
    let ptr = worker.allocate(64).unwrap().unwrap();
    unsafe { worker.free(ptr.as_ptr()) };
    worker.current_arena().unwrap()
  })
  .join()
  .unwrap();

  assert!(!registry.contains_arena(id));
  assert_eq!(registry.arena_count(), 0);
}

#[test]
fn thread_exit_with_outstanding_block_defers_teardown() {
  let registry = Registry::new();

  let worker = registry.clone();
  let (id, addr) = thread::spawn(move || {
    worker.initialize(small()).unwrap();
    let ptr = worker.allocate(64).unwrap().unwrap();
    unsafe { ptr.as_ptr().write_bytes(0x5A, 64) };
    (worker.current_arena().unwrap(), Addr::of(ptr))
  })
  .join()
  .unwrap();

  // The exited thread's arena waits for its last block.
  assert!(registry.contains_arena(id));
  let bytes = unsafe { core::slice::from_raw_parts(addr.ptr(), 64) };
  assert!(bytes.iter().all(|&b| b == 0x5A));

  unsafe { registry.free(addr.ptr()) };
  assert!(!registry.contains_arena(id));
}

#[test]
fn ring_of_threads_frees_each_others_blocks() {
  const THREADS: usize = 6;
  const ROUNDS: usize = 50;
  const PER_ROUND: usize = 40;

  let registry = Registry::new();
  let barrier = Arc::new(Barrier::new(THREADS));
  let (senders, receivers): (Vec<_>, Vec<_>) =
    (0..THREADS).map(|_| mpsc::channel::<Vec<(Addr, usize, u8)>>()).unzip();

  let handles: Vec<_> = receivers
    .into_iter()
    .enumerate()
    .map(|(i, rx)| {
      let registry = registry.clone();
      let next = senders[(i + 1) % THREADS].clone();
      let barrier = barrier.clone();
      thread::spawn(move || {
        registry.initialize(small().with_keep_minimum(1)).unwrap();
        let mut rng = rand::thread_rng();

        for _ in 0..ROUNDS {
          let batch: Vec<_> = (0..PER_ROUND)
            .map(|_| {
              let size = rng.gen_range(1..=PAGE * 2);
              let seed = rng.r#gen::<u8>();
              let ptr = registry.allocate(size).unwrap().unwrap();
              unsafe { ptr.as_ptr().write_bytes(seed, size) };
              (Addr::of(ptr), size, seed)
            })
            .collect();
          next.send(batch).unwrap();

          for (addr, size, seed) in rx.recv().unwrap() {
            let bytes = unsafe { core::slice::from_raw_parts(addr.ptr(), size) };
            assert!(bytes.iter().all(|&b| b == seed));
            unsafe { registry.free(addr.ptr()) };
          }
        }

        // Past the barrier every block is freed, some still queued on their owner.
        barrier.wait();
        registry.shutdown().unwrap();
      })
    })
    .collect();

  drop(senders);
  for handle in handles {
    handle.join().unwrap();
  }

  assert_eq!(registry.arena_count(), 0);
}
