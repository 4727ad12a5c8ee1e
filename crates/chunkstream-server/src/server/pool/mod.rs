//! The shared chunk generation pool.
//!
//! - [`manager`] - [`manager::WorkerPool`], the queue and its lifecycle.
//! - [`request`] - Queue entries, tickets and outcomes.
//! - `worker` - The per-worker dispatch loop.

pub mod manager;
pub mod request;
mod worker;
