use hashbrown::HashMap;

use loam::time::timestamp_secs;

use crate::message::Endpoint;

const INITIAL_ENDPOINTS: usize = 100;
const INCREMENT_ENDPOINTS: usize = 10;

struct EndpointSequence {
    id: u32,
    ts: u64,
}

/// Per-endpoint monotonically increasing outbound message ids. Owned by the
/// tunnel-reader thread, so no locking. The table is bounded by TTL
/// eviction with a slowly adapting capacity: if an eviction pass frees
/// nothing the cap grows, otherwise it shrinks back toward the initial
/// capacity.
pub struct SequencePool {
    map: HashMap<Endpoint, EndpointSequence>,
    ttl: u64,
    max_endpoints: usize,
}

impl SequencePool {
    /// `ttl` of zero disables eviction.
    pub fn new(ttl: u64) -> SequencePool {
        SequencePool {
            map: HashMap::with_capacity(INITIAL_ENDPOINTS),
            ttl,
            max_endpoints: INITIAL_ENDPOINTS,
        }
    }

    /// The next message id for this endpoint. Counters start at 1 and wrap
    /// naturally at u32::MAX.
    pub fn next_id(&mut self, endpoint: Endpoint) -> u32 {
        let entry = self
            .map
            .entry(endpoint)
            .or_insert(EndpointSequence { id: 0, ts: 0 });
        entry.id = entry.id.wrapping_add(1);
        entry.ts = timestamp_secs();
        let id = entry.id;

        if self.ttl > 0 && self.map.len() >= self.max_endpoints {
            self.evict();
        }

        id
    }

    /// Current adaptive capacity bound.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.max_endpoints
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    fn evict(&mut self) {
        let now = timestamp_secs();
        let ttl = self.ttl;
        let before = self.map.len();
        self.map.retain(|_, e| now <= e.ts + ttl);
        let deleted = before - self.map.len();

        if deleted == 0 {
            self.max_endpoints += INCREMENT_ENDPOINTS;
        } else if self.max_endpoints - deleted <= INITIAL_ENDPOINTS {
            self.max_endpoints = INITIAL_ENDPOINTS;
        } else if self.max_endpoints - INCREMENT_ENDPOINTS >= INITIAL_ENDPOINTS {
            self.max_endpoints -= INCREMENT_ENDPOINTS;
        } else {
            self.max_endpoints -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let mut pool = SequencePool::new(60);
        assert_eq!(pool.next_id(Endpoint(1)), 1);
        assert_eq!(pool.next_id(Endpoint(1)), 2);
        assert_eq!(pool.next_id(Endpoint(1)), 3);
    }

    #[test]
    fn test_endpoints_are_independent() {
        let mut pool = SequencePool::new(60);
        assert_eq!(pool.next_id(Endpoint(1)), 1);
        assert_eq!(pool.next_id(Endpoint(2)), 1);
        assert_eq!(pool.next_id(Endpoint(1)), 2);
        assert_eq!(pool.next_id(Endpoint(2)), 2);
    }

    #[test]
    fn test_capacity_grows_when_nothing_expires() {
        let mut pool = SequencePool::new(3600);
        for i in 0..INITIAL_ENDPOINTS as u64 {
            pool.next_id(Endpoint(i));
        }
        // Every entry is fresh, so the pass frees nothing and the cap grows.
        assert_eq!(pool.capacity(), INITIAL_ENDPOINTS + INCREMENT_ENDPOINTS);
        assert_eq!(pool.len(), INITIAL_ENDPOINTS);
    }

    #[test]
    fn test_zero_ttl_disables_eviction() {
        let mut pool = SequencePool::new(0);
        for i in 0..(INITIAL_ENDPOINTS as u64 + 50) {
            pool.next_id(Endpoint(i));
        }
        assert_eq!(pool.capacity(), INITIAL_ENDPOINTS);
        assert_eq!(pool.len(), INITIAL_ENDPOINTS + 50);
    }
}
