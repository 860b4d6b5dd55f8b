//! An object recycling pool that keeps reusable values close to the thread
//! that allocated them.
//!
//! # Quick Start
//!
//! ```
//! use rebound::Recycler;
//!
//! let pool = Recycler::new(|| Vec::<u8>::with_capacity(256)).unwrap();
//! let mut buf = pool.acquire().unwrap();
//! buf.extend_from_slice(b"hello");
//! buf.clear();
//! drop(buf); // goes back to this thread's reservoir
//! let again = pool.acquire().unwrap();
//! assert_eq!(again.capacity(), 256);
//! ```
//!
//! # How It Works
//!
//! Every value handed out by a [`Recycler`] is wrapped in a durable handle
//! that remembers which thread's reservoir it came from. Recycling on the
//! owning thread is a plain push onto a thread-local stack. Recycling on any
//! other thread stages the handle in a small per-(owner, releaser) intake
//! queue; the owner pulls staged handles back in bulk the next time its own
//! stack runs dry.
//!
//! Memory stays bounded in three independent ways:
//!
//! - each thread's stack is capped (`max_capacity_per_thread`),
//! - the total data all foreign threads may stage for one stack is capped by
//!   a shared reservation counter,
//! - most values seen for the first time are simply dropped instead of
//!   pooled (one in `ratio` is admitted), which smooths out bursts.
//!
//! A release that does not fit any of these budgets is silently discarded
//! and the value is freed normally. That is admission control, not an error.
//!
//! # Supporting pieces
//!
//! The pool is built on three small subsystems that are useful on their own
//! and therefore public:
//!
//! - [`localmap`]: an indexed per-thread slot store used to find a thread's
//!   stack without hashing,
//! - [`cleaner`]: runs a callback once a watched allocation becomes
//!   unreachable, used to reclaim staging space owned by dead threads,
//! - [`promise`]: a one-shot settable result with listeners and blocking
//!   waiters, the crate's coordination primitive.

pub mod cleaner;
pub mod localmap;
pub mod pool;
pub mod promise;

pub use pool::{Config, Handle, RecycleError, Recycled, Recycler};

#[cfg(test)]
mod test;
