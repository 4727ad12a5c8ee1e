//! # Chunk Stream Data Model
//!
//! Plain data carried by the protocol messages. None of these types hold
//! behaviour beyond small accessors; the pool and the session layer own all
//! of the coordination logic.
//!
//! - [`ChunkCoordinates`] - integer grid position of a chunk
//! - [`GenerationConfig`] - opaque config blob forwarded to the generator
//! - [`ChunkData`] - whatever the generator produced
//! - [`PoolStats`] - point-in-time view of the shared worker pool
//! - [`GenerationTimings`] - diagnostics attached to every result

use core::fmt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation key for one request on one connection.
///
/// Either supplied by the client or allocated by the server. It is the
/// identity of a request; coordinates are not.
pub type RequestId = String;

/// Request ID used when an error cannot be attributed to a specific request.
pub const UNKNOWN_REQUEST_ID: &str = "unknown";

/// Generated chunk contents.
///
/// The pool never looks inside; it forwards the value into `CHUNK_RESULT`.
pub type ChunkData = Value;

/// Position of a chunk in the world grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkCoordinates {
    pub x: i32,
    pub y: i32,
}

impl ChunkCoordinates {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for ChunkCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Opaque generation configuration (seed, noise parameters, dimensions).
///
/// Passed through to the generator unmodified. The only check applied on the
/// way in is that it is present and not `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationConfig(Value);

impl GenerationConfig {
    pub const fn new(value: Value) -> Self {
        Self(value)
    }

    /// Looks up a top-level key when the config is a JSON object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

/// A snapshot of the shared worker pool.
///
/// Non-authoritative: by the time a caller acts on it the pool has moved on.
/// `queue_size` is the physical queue length and may include entries that
/// were cancelled but not yet reached by a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub queue_size: usize,
    pub active_workers: usize,
    pub max_workers: usize,
    pub total_completed: u64,
    pub total_failed: u64,
}

/// Timing diagnostics attached to a successful result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationTimings {
    /// Wall-clock time spent inside the generation function, excluding queue
    /// wait.
    pub generation_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pool_stats_use_camel_case() {
        let stats = PoolStats {
            queue_size: 3,
            active_workers: 2,
            max_workers: 4,
            total_completed: 10,
            total_failed: 1,
        };
        assert_eq!(
            serde_json::to_value(stats).unwrap(),
            json!({
                "queueSize": 3,
                "activeWorkers": 2,
                "maxWorkers": 4,
                "totalCompleted": 10,
                "totalFailed": 1,
            })
        );
    }

    #[test]
    fn config_is_passed_through_verbatim() {
        let raw = json!({"seed": "t", "noise": {"octaves": 4}});
        let config: GenerationConfig = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(config.get("seed"), Some(&json!("t")));
        assert_eq!(serde_json::to_value(&config).unwrap(), raw);
    }

    #[test]
    fn coordinates_display() {
        assert_eq!(ChunkCoordinates::new(-3, 4).to_string(), "(-3, 4)");
    }
}
