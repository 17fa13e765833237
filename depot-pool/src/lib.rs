//! # Endpoint pool
//!
//! Keeps a stock of delivery endpoints for chunk and manifest downloads.
//!
//! A single background task refills the stock from the content directory
//! whenever it runs low. Callers draw endpoints with [`EndpointPool::acquire`],
//! hand healthy ones back with [`EndpointPool::release`], and report failing
//! ones with [`EndpointPool::mark_broken`] so they are never handed out again.
//!
//! ```text
//!   directory ──► monitor task ──► available (FIFO, weighted) ──┐
//!                                                               ├──► acquire()
//!                         release() ──► active (LIFO) ──────────┘
//! ```
//!
//! When the directory has nothing usable to offer, or the session stays
//! disconnected after the pool was populated once, the pool declares itself
//! exhausted and every pending and future `acquire` fails fast.

pub mod errors;
pub mod pool;

pub use errors::{PoolError, Result};
pub use pool::{EndpointPool, PoolConfig, PoolStats};
