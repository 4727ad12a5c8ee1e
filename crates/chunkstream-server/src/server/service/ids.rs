use chunkstream_core::types::RequestId;
use ferroid::generator::{AtomicSnowflakeGenerator, IdGenStatus};
use ferroid::id::SnowflakeTwitterId;
use ferroid::time::MonotonicClock;

/// Process-wide source of request ids for clients that omit `requestId`.
///
/// Backed by a lock-free Snowflake generator, so ids are unique across every
/// connection sharing this instance and roughly ordered by creation time.
pub struct RequestIdGenerator {
    inner: AtomicSnowflakeGenerator<SnowflakeTwitterId, MonotonicClock>,
}

impl RequestIdGenerator {
    pub fn new(machine_id: u64) -> Self {
        let clock = MonotonicClock::default();
        Self {
            inner: AtomicSnowflakeGenerator::new(machine_id, clock),
        }
    }

    /// Returns the next id, spinning through the rare sequence rollover.
    pub fn next_id(&self) -> RequestId {
        loop {
            match self.inner.next_id() {
                IdGenStatus::Ready { id } => break id.to_string(),
                IdGenStatus::Pending { .. } => core::hint::spin_loop(),
            }
        }
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, sync::Arc};

    #[test]
    fn ids_are_unique() {
        let ids = RequestIdGenerator::default();
        let seen: HashSet<_> = (0..10_000).map(|_| ids.next_id()).collect();
        assert_eq!(seen.len(), 10_000);
    }

    #[test]
    fn unique_across_threads() {
        let ids = Arc::new(RequestIdGenerator::new(1));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..1_000).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 4_000);
    }
}
