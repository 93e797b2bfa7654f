use core::{fmt, ptr::NonNull};
use std::{
  alloc::{Layout, handle_alloc_error},
  cell::RefCell,
  collections::HashMap,
  io,
  panic::Location,
  sync::Arc,
};

use parking_lot::RwLock;
use tracing::{debug, error, info, trace, warn};

use crate::{
  arena::{Arena, ArenaId, FreeBlock, Handoff},
  block::{ALIGNMENT, BlockHeader, BlockKind, HEADER_SIZE, Status, class_for, header_of},
  config::Config,
  error::{Error, Result},
  os,
  stats::Stats,
};

#[cfg(feature = "leak-tracking")]
use crate::labels::{LeakRecord, Site};

// =============================================================================
// Registry
// =============================================================================

struct Shared {
  /// Every live arena, so a foreign free can find the owner of a block.
  arenas: RwLock<HashMap<ArenaId, Arc<Arena>>>,
}

/// Hands each thread its own arena and routes frees to the arena that owns
/// the block.
///
/// A `Registry` is a cheap handle: clones share the same arenas. A thread gets
/// one arena per registry, created on first use and configured once with
/// [`Registry::initialize`]. Allocation and local frees touch only the calling
/// thread's arena; freeing a block owned by another thread queues it for that
/// thread instead.
///
/// A thread that exits without calling [`Registry::shutdown`] is shut down
/// implicitly when its thread-local storage is torn down.
#[derive(Clone)]
pub struct Registry {
  shared: Arc<Shared>,
}

impl Default for Registry {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for Registry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Registry")
      .field("arenas", &self.arena_count())
      .finish()
  }
}

// =============================================================================
// TLS
// =============================================================================

struct Attached {
  shared: Arc<Shared>,
  arena: Arc<Arena>,
}

/// Arenas the current thread owns, one per registry.
struct ThreadSlot {
  attached: Vec<Attached>,
}

impl ThreadSlot {
  fn find(&self, shared: &Arc<Shared>) -> Option<&Arc<Arena>> {
    self
      .attached
      .iter()
      .find(|entry| Arc::ptr_eq(&entry.shared, shared))
      .map(|entry| &entry.arena)
  }
}

impl Drop for ThreadSlot {
  fn drop(&mut self) {
    for Attached { shared, arena } in self.attached.drain(..) {
      debug!(arena = %arena.id(), "thread exiting, retiring arena");
      retire(&shared, &arena);
    }
  }
}

thread_local! {
  static SLOT: RefCell<ThreadSlot> = const { RefCell::new(ThreadSlot { attached: Vec::new() }) };
}

/// Shuts down a detached arena and unregisters it once nothing refers to it.
fn retire(shared: &Shared, arena: &Arena) {
  match arena.shutdown() {
    Ok(()) | Err(Error::NotInitialized) => {
      shared.arenas.write().remove(&arena.id());
    }
    Err(Error::InUse) => {}
    Err(err) => error!(arena = %arena.id(), %err, "arena teardown failed"),
  }
}

impl Registry {
  pub fn new() -> Self {
    Self {
      shared: Arc::new(Shared {
        arenas: RwLock::new(HashMap::new()),
      }),
    }
  }

  /// The calling thread's arena, if it has one.
  fn current(&self) -> Option<Arc<Arena>> {
    // TLS may already be gone while the thread exits.
    SLOT
      .try_with(|slot| slot.borrow().find(&self.shared).cloned())
      .ok()
      .flatten()
  }

  /// The calling thread's arena, created on first use.
  fn attached(&self) -> Result<Arc<Arena>> {
    SLOT
      .try_with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(arena) = slot.find(&self.shared) {
          return arena.clone();
        }

        let arena = Arc::new(Arena::new());
        self.shared.arenas.write().insert(arena.id(), arena.clone());
        slot.attached.push(Attached {
          shared: self.shared.clone(),
          arena: arena.clone(),
        });
        debug!(arena = %arena.id(), "arena created");
        arena
      })
      .map_err(|_| Error::NotInitialized)
  }

  fn detach(&self, id: ArenaId) {
    let _ = SLOT.try_with(|slot| {
      slot
        .borrow_mut()
        .attached
        .retain(|entry| !(Arc::ptr_eq(&entry.shared, &self.shared) && entry.arena.id() == id));
    });
  }

  // ---------------------------------------------------------------------------
  // Lifecycle
  // ---------------------------------------------------------------------------

  /// Returns the calling thread's arena id, creating the arena if needed.
  pub fn get_or_create_arena(&self) -> Result<ArenaId> {
    self.attached().map(|arena| arena.id())
  }

  /// Configures the calling thread's arena and maps its first page.
  pub fn initialize(&self, config: Config) -> Result<()> {
    let arena = self.attached()?;
    unsafe { arena.local() }.initialize(config)
  }

  /// Returns every page of the calling thread's arena to the system.
  ///
  /// With blocks still reserved this fails with [`Error::InUse`]: the arena
  /// is detached from the thread and the free that returns its last block
  /// completes the teardown. Either way the thread gets a fresh arena on its
  /// next call.
  pub fn shutdown(&self) -> Result<()> {
    let arena = self.current().ok_or(Error::NotInitialized)?;
    let id = arena.id();

    match arena.shutdown() {
      Ok(()) => {
        self.detach(id);
        self.shared.arenas.write().remove(&id);
        Ok(())
      }
      Err(Error::InUse) => {
        self.detach(id);
        Err(Error::InUse)
      }
      Err(err) => Err(err),
    }
  }

  // ---------------------------------------------------------------------------
  // Allocation
  // ---------------------------------------------------------------------------

  /// Allocates `size` bytes, aligned to [`ALIGNMENT`].
  ///
  /// `Ok(None)` for a zero-sized request.
  #[track_caller]
  pub fn allocate(&self, size: usize) -> Result<Option<NonNull<u8>>> {
    self.allocate_at(size, Location::caller())
  }

  fn allocate_at(&self, size: usize, site: &'static Location<'static>) -> Result<Option<NonNull<u8>>> {
    let arena = self.attached()?;
    unsafe {
      arena.drain();
      arena.local().allocate(size, site)
    }
  }

  /// Like [`Registry::allocate`], but a failure terminates the process
  /// through [`handle_alloc_error`].
  #[track_caller]
  pub fn allocate_or_abort(&self, size: usize) -> Option<NonNull<u8>> {
    match self.allocate_at(size, Location::caller()) {
      Ok(ptr) => ptr,
      Err(err) => {
        warn!(size, %err, "allocation failed, aborting");
        let layout =
          Layout::from_size_align(size, ALIGNMENT).unwrap_or_else(|_| Layout::new::<u8>());
        handle_alloc_error(layout)
      }
    }
  }

  /// Allocates a zero-filled array of `count` elements of `size` bytes.
  #[track_caller]
  pub fn allocate_zeroed(&self, count: usize, size: usize) -> Result<Option<NonNull<u8>>> {
    let total = count
      .checked_mul(size)
      .ok_or(Error::Overflow { count, size })?;
    let ptr = self.allocate_at(total, Location::caller())?;
    if let Some(ptr) = ptr {
      unsafe { ptr.write_bytes(0, total) };
    }
    Ok(ptr)
  }

  /// Moves the block at `ptr` into a block of `size` bytes.
  ///
  /// A null `ptr` allocates; a zero `size` frees and returns `Ok(None)`.
  /// On failure the old block is left untouched.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live pointer returned by this registry.
  #[track_caller]
  pub unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> Result<Option<NonNull<u8>>> {
    let site = Location::caller();
    let Some(old) = NonNull::new(ptr) else {
      return self.allocate_at(size, site);
    };
    if size == 0 {
      unsafe { self.free(ptr) };
      return Ok(None);
    }

    let block = unsafe { header_of(old) };
    match unsafe { (*block).validate() } {
      Ok(Status::Reserved) => {}
      Ok(Status::Free | Status::Deferred) => return Err(Error::NotReserved { addr: ptr as usize }),
      Err(err) => {
        error!(addr = ?ptr, %err, "reallocate of a damaged block");
        return Err(err);
      }
    }
    let capacity = unsafe { (*block).capacity() };

    let Some(new) = self.allocate_at(size, site)? else {
      return Ok(None);
    };
    unsafe {
      old.copy_to_nonoverlapping(new, capacity.min(size));
      self.free(ptr);
    }
    trace!(old = ?ptr, new = ?new, size, "reallocated");

    Ok(Some(new))
  }

  // ---------------------------------------------------------------------------
  // Free
  // ---------------------------------------------------------------------------

  /// Frees the block at `ptr`.
  ///
  /// Null is a no-op. A damaged header or a double free is logged and
  /// ignored. A block owned by another thread's arena is queued for that
  /// thread.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a pointer returned by this registry whose memory
  /// is still mapped.
  pub unsafe fn free(&self, ptr: *mut u8) {
    let Some(payload) = NonNull::new(ptr) else {
      return;
    };
    let block = unsafe { header_of(payload) };

    match unsafe { (*block).validate() } {
      Ok(Status::Reserved) => {}
      Ok(Status::Free) => {
        warn!(addr = ?ptr, "double free detected");
        return;
      }
      Ok(Status::Deferred) => {
        warn!(addr = ?ptr, "double free of a block already queued for its owner");
        return;
      }
      Err(err) => {
        error!(addr = ?ptr, %err, "block has been overwritten or is not a buddy block");
        return;
      }
    }

    let owner = ArenaId::from_raw(unsafe { (*block).owner() });
    if let Some(arena) = self.current().filter(|arena| arena.id() == owner) {
      unsafe { arena.local().release(block) };
      return;
    }

    let arena = self.shared.arenas.read().get(&owner).cloned();
    let handoff = match arena {
      Some(arena) => unsafe { arena.defer(block) },
      None => Handoff::Orphaned,
    };

    match handoff {
      Handoff::Queued => {}
      Handoff::Finalized => {
        self.shared.arenas.write().remove(&owner);
        info!(arena = %owner, "last deferred block returned, teardown completed");
      }
      Handoff::Orphaned => unsafe { release_orphan(block, owner) },
      Handoff::Rejected => warn!(arena = %owner, addr = ?ptr, "double free detected"),
    }
  }

  // ---------------------------------------------------------------------------
  // Diagnostics
  // ---------------------------------------------------------------------------

  /// Snapshot of the calling thread's statistics. All zero without an arena.
  pub fn stats(&self) -> Stats {
    self
      .current()
      .map(|arena| unsafe { arena.local() }.stats())
      .unwrap_or_default()
  }

  /// Whether `ptr` is a live block reserved by the calling thread.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or point [`HEADER_SIZE`] bytes past readable memory.
  pub unsafe fn check_block(&self, ptr: *mut u8) -> bool {
    let Some(payload) = NonNull::new(ptr) else {
      return false;
    };
    let Some(arena) = self.current() else {
      return false;
    };
    let state = unsafe { arena.local() };
    state.is_initialized() && unsafe { state.check(header_of(payload)) }
  }

  /// Bytes the caller may use at `ptr`, or `None` if it is not a reserved block.
  ///
  /// # Safety
  ///
  /// Same as [`Registry::check_block`].
  pub unsafe fn usable_size(&self, ptr: *mut u8) -> Option<usize> {
    let block = unsafe { header_of(NonNull::new(ptr)?) };
    match unsafe { (*block).validate() } {
      Ok(Status::Reserved) => Some(unsafe { (*block).capacity() }),
      _ => None,
    }
  }

  /// Every free block of the calling thread's arena.
  pub fn free_blocks(&self) -> Vec<FreeBlock> {
    self
      .current()
      .map(|arena| unsafe { arena.local() }.free_blocks())
      .unwrap_or_default()
  }

  /// Writes statistics and the free-list census of the calling thread's arena.
  pub fn dump_memory<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
    match self.current() {
      Some(arena) => unsafe { arena.local() }.dump(out),
      None => writeln!(out, "no arena for this thread"),
    }
  }

  /// Element count that fills the block a pool of `min_count` elements of
  /// `type_size` bytes would land in.
  ///
  /// Returns `min_count` when such a pool needs an extra block, or when the
  /// calling thread has no initialized arena.
  pub fn preferred_pool_count(&self, min_count: usize, type_size: usize) -> usize {
    let page_exp = match self.current() {
      Some(arena) if unsafe { arena.local() }.is_initialized() => unsafe { arena.local() }.page_exp(),
      _ => return min_count,
    };
    if type_size == 0 {
      return min_count;
    }

    match class_for(min_count.saturating_mul(type_size)) {
      Some(class) if class <= page_exp => (((1usize << class) - HEADER_SIZE) / type_size).max(1),
      _ => min_count,
    }
  }

  /// The calling thread's arena, without creating one.
  pub fn current_arena(&self) -> Option<ArenaId> {
    self.current().map(|arena| arena.id())
  }

  /// Arenas registered and not yet destroyed, pending teardowns included.
  pub fn arena_count(&self) -> usize {
    self.shared.arenas.read().len()
  }

  pub fn contains_arena(&self, id: ArenaId) -> bool {
    self.shared.arenas.read().contains_key(&id)
  }

  /// Where the live block at `ptr` was allocated.
  #[cfg(feature = "leak-tracking")]
  pub fn allocation_site(&self, ptr: *mut u8) -> Option<Site> {
    let arena = self.current()?;
    unsafe { arena.local() }.sites().site(ptr as usize)
  }

  /// The calling thread's live blocks, grouped by allocation site.
  #[cfg(feature = "leak-tracking")]
  pub fn leak_report(&self) -> Vec<LeakRecord> {
    self
      .current()
      .map(|arena| unsafe { arena.local() }.sites().report())
      .unwrap_or_default()
  }
}

/// Frees a block whose arena no longer exists.
unsafe fn release_orphan(block: *mut BlockHeader, owner: ArenaId) {
  match unsafe { (*block).kind() } {
    BlockKind::Extra { size } => {
      unsafe { os::unmap(NonNull::new_unchecked(block.cast()), size) };
      debug!(arena = %owner, size, addr = ?block, "orphaned extra page released");
    }
    BlockKind::Standard { .. } => {
      warn!(arena = %owner, addr = ?block, "free of a block owned by an unknown arena");
    }
  }
}
