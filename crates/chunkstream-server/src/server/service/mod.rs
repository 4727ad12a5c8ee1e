//! Client-facing chunk stream service.
//!
//! This module accepts WebSocket connections, runs one protocol session per
//! connection and hands admitted requests to the shared worker pool.
//!
//! ## Structure
//!
//! - [`handler`] - HTTP routes and the per-connection driver (`ChunkService`).
//! - [`session`] - Transport-agnostic protocol state for one connection.
//! - [`ids`] - Request ids for clients that do not supply their own.

pub mod handler;
pub mod ids;
pub mod session;
