use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
  /// `initialize` was called twice on the same arena.
  #[error("arena is already initialized")]
  AlreadyInitialized,

  #[error("arena is not initialized")]
  NotInitialized,

  #[error("invalid configuration: {reason}")]
  InvalidConfig { reason: &'static str },

  /// The request cannot be satisfied under the arena's current policy.
  #[error("request for {size} bytes cannot be served under the current policy")]
  Invalid { size: usize },

  /// Growth is disabled, or the system refused to hand out more memory.
  #[error("out of memory")]
  OutOfMemory,

  #[error("{count} elements of {size} bytes overflow the address space")]
  Overflow { count: usize, size: usize },

  #[error("block {addr:#x} is not reserved")]
  NotReserved { addr: usize },

  #[error("block {addr:#x} failed its integrity check")]
  Corrupted { addr: usize },

  /// Teardown found outstanding memory; it completes when the last block comes back.
  #[error("arena still holds memory in use, teardown deferred")]
  InUse,
}
