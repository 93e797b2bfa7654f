use core::{
  cell::UnsafeCell,
  fmt,
  ptr::NonNull,
  sync::atomic::{AtomicU64, Ordering},
};
use std::{io, panic::Location};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::{
  block::{BlockHeader, BlockKind, CLASS_COUNT, HEADER_SIZE, Status, buddy_of, class_for, payload_of},
  config::Config,
  deferred::{Deferred, Phase},
  error::{Error, Result},
  free_list::FreeIndex,
  os,
  stats::Stats,
};

#[cfg(feature = "leak-tracking")]
use crate::labels::Sites;

// =============================================================================
// Identity
// =============================================================================

/// Identifies an arena for the lifetime of the process. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaId(u64);

impl ArenaId {
  fn next() -> Self {
    // Start at 1; 0 marks blocks no arena holds.
    static NEXT: AtomicU64 = AtomicU64::new(1);
    Self(NEXT.fetch_add(1, Ordering::Relaxed))
  }

  pub(crate) const fn from_raw(raw: u64) -> Self {
    Self(raw)
  }

  pub const fn get(self) -> u64 {
    self.0
  }
}

impl fmt::Display for ArenaId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "arena#{}", self.0)
  }
}

/// One entry of an arena's free-list census.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeBlock {
  /// Address of the block header.
  pub addr: usize,
  /// The block spans `2^exponent` bytes.
  pub exponent: u32,
  /// Base of the page the block was carved from.
  pub page: usize,
  pub page_exponent: u32,
}

// =============================================================================
// Arena state (owner-local)
// =============================================================================

/// Everything an arena mutates without locking: the free-list index, the
/// statistics record and the reserved-block count.
pub(crate) struct ArenaState {
  id: ArenaId,
  config: Option<Config>,
  page_exp: u32,
  free: FreeIndex,
  stats: Stats,
  /// Reserved standard blocks. Teardown completes when it reaches zero.
  outstanding: usize,
  #[cfg(feature = "leak-tracking")]
  sites: Sites,
}

impl ArenaState {
  fn new(id: ArenaId) -> Self {
    Self {
      id,
      config: None,
      page_exp: 0,
      free: FreeIndex::new(),
      stats: Stats::default(),
      outstanding: 0,
      #[cfg(feature = "leak-tracking")]
      sites: Sites::default(),
    }
  }

  #[inline]
  pub fn is_initialized(&self) -> bool {
    self.config.is_some()
  }

  #[inline]
  pub fn page_exp(&self) -> u32 {
    self.page_exp
  }

  #[inline]
  pub fn stats(&self) -> Stats {
    self.stats
  }

  #[inline]
  pub fn outstanding(&self) -> usize {
    self.outstanding
  }

  /// Fixes the policy and maps the first page.
  ///
  /// A failure to map the page is reported, but the arena stays initialized
  /// and will try again on the next allocation.
  pub fn initialize(&mut self, config: Config) -> Result<()> {
    if self.is_initialized() {
      return Err(Error::AlreadyInitialized);
    }
    let page_exp = config.page_exponent()?;

    self.config = Some(config);
    self.page_exp = page_exp;
    self.stats = Stats::new(1 << page_exp);
    debug!(arena = %self.id, page_exp, ?config, "arena initialized");

    self.new_page().map(|_| ())
  }

  // ---------------------------------------------------------------------------
  // Page lifecycle
  // ---------------------------------------------------------------------------

  /// Maps a page and files it as one free block of the page's own class.
  fn new_page(&mut self) -> Result<*mut BlockHeader> {
    let size = 1usize << self.page_exp;
    let Some(page) = os::map(size) else {
      warn!(arena = %self.id, size, "system refused a new page");
      return Err(Error::OutOfMemory);
    };

    let page = page.as_ptr();
    let block = page.cast::<BlockHeader>();
    unsafe {
      BlockHeader::init_free(block, page, self.page_exp, self.page_exp);
      self.free.insert(block, self.page_exp);
    }
    self.stats.insert_std_page();
    debug!(arena = %self.id, ?page, pages = self.stats.std_pages, "page created");

    Ok(block)
  }

  /// Returns a whole free page to the system if the policy allows it.
  unsafe fn collect_page(&mut self, block: *mut BlockHeader) {
    let Some(config) = self.config else {
      return;
    };
    if !config.release_pages {
      return;
    }

    // Keep at least `keep_minimum` pages, and at least `keep_factor` x used.
    let pages = self.stats.std_pages;
    if pages <= config.keep_minimum {
      return;
    }
    if pages <= config.keep_factor.saturating_mul(self.stats.std_pages_used) {
      return;
    }

    unsafe {
      self.free.remove(block, self.page_exp);
      os::unmap(NonNull::new_unchecked(block.cast()), 1 << self.page_exp);
    }
    self.stats.remove_std_page();
    debug!(arena = %self.id, page = ?block, pages = self.stats.std_pages, "page released");
  }

  /// Releases every whole free page, regardless of the keep policy.
  ///
  /// Fails with [`Error::InUse`] while any standard block is reserved.
  pub fn release_free_pages(&mut self) -> Result<()> {
    loop {
      let block = self.free.head(self.page_exp);
      if block.is_null() {
        break;
      }

      match unsafe { (*block).kind() } {
        BlockKind::Standard { page, page_exp, exp }
          if page == block.cast::<u8>() && page_exp == self.page_exp && exp == page_exp => {}
        kind => {
          error!(arena = %self.id, addr = ?block, ?kind, "largest free block is not a root page");
          return Err(Error::Corrupted {
            addr: block as usize,
          });
        }
      }

      unsafe {
        self.free.remove(block, self.page_exp);
        os::unmap(NonNull::new_unchecked(block.cast()), 1 << self.page_exp);
      }
      self.stats.remove_std_page();
      debug!(arena = %self.id, page = ?block, "page released on teardown");
    }

    if self.outstanding > 0 {
      return Err(Error::InUse);
    }
    debug_assert!(self.free.is_empty());
    Ok(())
  }

  // ---------------------------------------------------------------------------
  // Allocation
  // ---------------------------------------------------------------------------

  pub fn allocate(&mut self, size: usize, site: &'static Location<'static>) -> Result<Option<NonNull<u8>>> {
    let config = self.config.ok_or(Error::NotInitialized)?;
    if size == 0 {
      return Ok(None);
    }

    let class = match class_for(size) {
      Some(class) if class <= self.page_exp => class,
      _ if config.extra_alloc => return self.allocate_extra(size, site).map(Some),
      _ => return Err(Error::Invalid { size }),
    };

    let block = match self.free.first_fit(class) {
      Some(found) => self.free.head(found),
      None if config.on_demand => self.new_page()?,
      None => return Err(Error::OutOfMemory),
    };

    let payload = unsafe { self.reserve(block, class) };
    self.track(payload, site);
    trace!(arena = %self.id, size, class, addr = ?payload, "allocated");

    Ok(Some(payload))
  }

  /// Takes a free block off its chain and splits it down to `class`.
  unsafe fn reserve(&mut self, block: *mut BlockHeader, class: u32) -> NonNull<u8> {
    let BlockKind::Standard { page, page_exp, mut exp } = (unsafe { (*block).kind() }) else {
      unreachable!("extra blocks never sit on a free list");
    };

    unsafe { self.free.remove(block, exp) };
    if block.cast::<u8>() == page && exp == page_exp {
      self.stats.use_std_page();
    }

    // Keep the lower half, file the upper half one class down.
    while exp > class {
      exp -= 1;
      unsafe {
        (*block).set_exp(exp);
        let buddy = buddy_of(block, page, exp);
        BlockHeader::init_free(buddy, page, page_exp, exp);
        self.free.insert(buddy, exp);
        trace!(arena = %self.id, ?block, ?buddy, exp, "split");
      }
    }

    unsafe { (*block).mark_reserved(self.id.get()) };
    self.stats.use_std_space(1 << class);
    self.outstanding += 1;

    unsafe { payload_of(block) }
  }

  fn allocate_extra(&mut self, size: usize, site: &'static Location<'static>) -> Result<NonNull<u8>> {
    let total = size.checked_add(HEADER_SIZE).ok_or(Error::OutOfMemory)?;
    let Some(mapping) = os::map(total) else {
      warn!(arena = %self.id, total, "system refused an extra page");
      return Err(Error::OutOfMemory);
    };

    let block = mapping.as_ptr().cast::<BlockHeader>();
    unsafe { BlockHeader::init_extra(block, total, self.id.get()) };
    self.stats.add_extra_page(total);
    debug!(arena = %self.id, total, addr = ?block, "extra page created");

    let payload = unsafe { payload_of(block) };
    self.track(payload, site);
    Ok(payload)
  }

  // ---------------------------------------------------------------------------
  // Free & merge
  // ---------------------------------------------------------------------------

  /// Frees a validated, reserved block this arena owns.
  pub unsafe fn release(&mut self, block: *mut BlockHeader) {
    #[cfg(feature = "leak-tracking")]
    self.sites.forget(unsafe { payload_of(block) }.as_ptr() as usize);

    match unsafe { (*block).kind() } {
      BlockKind::Extra { size } => unsafe { self.release_extra(block, size) },
      BlockKind::Standard { page, page_exp, exp } => {
        let (addr, base) = (block as usize, page as usize);
        if addr < base || addr >= base + (1usize << page_exp) || page_exp != self.page_exp {
          error!(arena = %self.id, addr = ?block, ?page, page_exp, "block lies outside its page");
          return;
        }
        unsafe { self.release_standard(block, page, exp) }
      }
    }
  }

  /// Frees a block taken off the deferred queue.
  ///
  /// Only blocks `Arena::defer` stamped are accepted, so a block never
  /// reaches the free lists twice.
  unsafe fn release_deferred(&mut self, block: *mut BlockHeader) {
    match unsafe { (*block).validate() } {
      Ok(Status::Deferred) => unsafe { self.release(block) },
      Ok(status) => error!(arena = %self.id, addr = ?block, ?status, "queued block is not deferred"),
      Err(err) => error!(arena = %self.id, addr = ?block, %err, "queued block has been overwritten"),
    }
  }

  unsafe fn release_standard(&mut self, mut block: *mut BlockHeader, page: *mut u8, mut exp: u32) {
    unsafe { (*block).mark_free() };
    self.stats.free_std_space(1 << exp);
    self.outstanding -= 1;

    while exp < self.page_exp {
      let buddy = buddy_of(block, page, exp);
      // A reserved buddy, or one still split into smaller blocks, stops the climb.
      if unsafe { !(*buddy).is_free() || (*buddy).exp() != exp } {
        break;
      }

      unsafe { self.free.remove(buddy, exp) };
      trace!(arena = %self.id, ?block, ?buddy, exp, "merge");
      block = block.min(buddy);
      exp += 1;
      unsafe { (*block).set_exp(exp) };
    }

    unsafe { self.free.insert(block, exp) };

    if exp == self.page_exp {
      self.stats.free_std_page();
      unsafe { self.collect_page(block) };
    }
  }

  unsafe fn release_extra(&mut self, block: *mut BlockHeader, size: usize) {
    unsafe { os::unmap(NonNull::new_unchecked(block.cast()), size) };
    self.stats.remove_extra_page(size);
    debug!(arena = %self.id, size, addr = ?block, "extra page released");
  }

  // ---------------------------------------------------------------------------
  // Diagnostics
  // ---------------------------------------------------------------------------

  /// Read-only validation of a block the caller believes it holds.
  pub unsafe fn check(&self, block: *mut BlockHeader) -> bool {
    let status = match unsafe { (*block).validate() } {
      Ok(status) => status,
      Err(err) => {
        error!(arena = %self.id, addr = ?block, %err, "check failed");
        return false;
      }
    };
    match status {
      Status::Reserved => {}
      Status::Free => {
        warn!(arena = %self.id, addr = ?block, "block is already free");
        return false;
      }
      Status::Deferred => {
        warn!(arena = %self.id, addr = ?block, "block is already queued for its owner");
        return false;
      }
    }

    let owner = unsafe { (*block).owner() };
    if owner != self.id.get() {
      warn!(arena = %self.id, addr = ?block, owner, "block belongs to another arena");
      return false;
    }

    match unsafe { (*block).kind() } {
      BlockKind::Extra { .. } => true,
      BlockKind::Standard { page, page_exp, .. } => {
        let (addr, base) = (block as usize, page as usize);
        addr >= base && addr < base + (1usize << page_exp)
      }
    }
  }

  pub fn free_blocks(&self) -> Vec<FreeBlock> {
    (0..CLASS_COUNT as u32)
      .flat_map(|class| self.free.iter(class))
      .map(|block| {
        let (page, page_exponent, exponent) = match unsafe { (*block).kind() } {
          BlockKind::Standard { page, page_exp, exp } => (page as usize, page_exp, exp),
          BlockKind::Extra { .. } => (0, 0, 0),
        };
        FreeBlock {
          addr: block as usize,
          exponent,
          page,
          page_exponent,
        }
      })
      .collect()
  }

  pub fn dump(&self, out: &mut dyn io::Write) -> io::Result<()> {
    let id = self.id;
    let s = &self.stats;

    writeln!(out, "{id}: Total Space in Arena: {}  (Watermark: {})", s.total_space, s.total_space_watermark)?;
    writeln!(out)?;
    writeln!(out, "{id}: Total Space for Standard Pages: {}  (Watermark: {})", s.std_space, s.std_space_watermark)?;
    writeln!(out, "{id}:       Nb Preallocated Standard Pages: {}", s.std_pages)?;
    writeln!(out, "{id}:       Size of Std Pages: {}", s.std_page_size)?;
    writeln!(
      out,
      "{id}:       Space Used inside Std Pages: {}  (Watermark: {})",
      s.std_used_space, s.std_used_space_watermark
    )?;
    writeln!(
      out,
      "{id}:       Nb of Std Pages Used: {}  (Watermark: {})",
      s.std_pages_used, s.std_pages_used_watermark
    )?;
    if let Some(fragmentation) = s.fragmentation() {
      writeln!(out, "{id}:       Memory Fragmentation: {fragmentation:.2} %")?;
    }
    writeln!(out)?;

    let blocks = self.free_blocks();
    if blocks.is_empty() {
      writeln!(out, "{id}: No free blocks")?;
    }
    for block in blocks {
      writeln!(
        out,
        "{id}: block_size=2^{:02} | block_status=FREE   | block_addr={:#x} | page_addr={:#x} | page_size=2^{:02}",
        block.exponent, block.addr, block.page, block.page_exponent
      )?;
    }
    writeln!(out)?;

    writeln!(out, "{id}: Extra Memory Space:     {}   (Watermark: {})", s.extra_space, s.extra_space_watermark)?;
    writeln!(out, "{id}:       Nb Extra Pages:   {}   (Watermark: {})", s.extra_pages, s.extra_pages_watermark)?;
    writeln!(out, "{id}:       Min Page Size Watermark:  {}", s.min_extra_page_size)?;
    writeln!(out, "{id}:       Max Page Size Watermark:  {}", s.max_extra_page_size)?;

    #[cfg(feature = "leak-tracking")]
    for record in self.sites.report() {
      writeln!(
        out,
        "{id}: live blocks={} | bytes={} | site={}",
        record.blocks, record.bytes, record.site
      )?;
    }

    Ok(())
  }

  #[inline]
  fn track(&mut self, payload: NonNull<u8>, site: &'static Location<'static>) {
    #[cfg(feature = "leak-tracking")]
    {
      let capacity = unsafe { (*crate::block::header_of(payload)).capacity() };
      self.sites.record(payload.as_ptr() as usize, site, capacity);
    }
    #[cfg(not(feature = "leak-tracking"))]
    let _ = (payload, site);
  }

  #[cfg(feature = "leak-tracking")]
  pub fn sites(&self) -> &Sites {
    &self.sites
  }
}

// =============================================================================
// Arena (shared handle)
// =============================================================================

/// What a foreign free did with a block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Handoff {
  /// Queued for the owner to merge.
  Queued,
  /// The block was the last one a pending teardown waited for; the arena is gone.
  Finalized,
  /// The arena is already destroyed; the caller deals with the block.
  Orphaned,
  /// The block is no longer reserved: another free got there first.
  Rejected,
}

/// An arena as the registry shares it between threads.
///
/// `state` belongs to the owner thread while the arena is attached to it.
/// Once shutdown leaves it `TeardownPending`, the owner detaches and only
/// holders of the `deferred` lock touch `state`.
pub(crate) struct Arena {
  id: ArenaId,
  state: UnsafeCell<ArenaState>,
  deferred: Mutex<Deferred>,
}

// SAFETY: see the ownership protocol above. Blocks are plain memory owned by
// the arena; only their addresses cross threads.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
  pub fn new() -> Self {
    let id = ArenaId::next();
    Self {
      id,
      state: UnsafeCell::new(ArenaState::new(id)),
      deferred: Mutex::new(Deferred::new()),
    }
  }

  #[inline]
  pub fn id(&self) -> ArenaId {
    self.id
  }

  /// The owner's view of the arena.
  ///
  /// Only the thread the arena is attached to may call this.
  #[inline]
  #[allow(clippy::mut_from_ref)]
  pub unsafe fn local(&self) -> &mut ArenaState {
    unsafe { &mut *self.state.get() }
  }

  /// Merges every block foreign threads handed back. Owner only.
  pub unsafe fn drain(&self) {
    let chain = self.deferred.lock().take();
    if chain.is_empty() {
      return;
    }

    let state = unsafe { self.local() };
    let mut drained = 0usize;
    for block in chain {
      unsafe { state.release_deferred(block) };
      drained += 1;
    }
    trace!(arena = %self.id, drained, "deferred frees drained");
  }

  /// Hands a reserved block owned by this arena back from another thread.
  pub unsafe fn defer(&self, block: *mut BlockHeader) -> Handoff {
    let mut deferred = self.deferred.lock();
    if deferred.phase == Phase::Destroyed {
      return Handoff::Orphaned;
    }

    // Re-checked under the lock: two racing frees of one block both saw it
    // reserved, only the first may queue it.
    if unsafe { (*block).validate() } != Ok(Status::Reserved) {
      return Handoff::Rejected;
    }
    unsafe {
      (*block).mark_deferred();
      deferred.push(block);
    }

    if deferred.phase == Phase::Active {
      trace!(arena = %self.id, addr = ?block, queued = deferred.len(), "free deferred to owner");
      return Handoff::Queued;
    }

    // Teardown pending. The owner has detached: the lock now guards the whole arena.
    let state = unsafe { self.local() };
    for block in deferred.take() {
      unsafe { state.release_deferred(block) };
    }
    if state.outstanding() > 0 {
      return Handoff::Queued;
    }

    match state.release_free_pages() {
      Ok(()) => {
        deferred.phase = Phase::Destroyed;
        Handoff::Finalized
      }
      Err(err) => {
        error!(arena = %self.id, %err, "pending teardown could not complete");
        Handoff::Queued
      }
    }
  }

  /// Releases every page. Owner only.
  ///
  /// On [`Error::InUse`] the arena turns `TeardownPending` and the caller must
  /// detach it: from then on the last foreign free completes the teardown.
  pub fn shutdown(&self) -> Result<()> {
    let mut deferred = self.deferred.lock();
    let state = unsafe { self.local() };
    if !state.is_initialized() {
      return Err(Error::NotInitialized);
    }

    for block in deferred.take() {
      unsafe { state.release_deferred(block) };
    }

    match state.release_free_pages() {
      Ok(()) => {
        deferred.phase = Phase::Destroyed;
        debug!(arena = %self.id, "arena destroyed");
        Ok(())
      }
      Err(Error::InUse) => {
        deferred.phase = Phase::TeardownPending;
        debug!(
          arena = %self.id,
          outstanding = state.outstanding(),
          "blocks still reserved, teardown deferred"
        );
        Err(Error::InUse)
      }
      Err(err) => Err(err),
    }
  }
}
