use std::sync::atomic::{AtomicU64, Ordering};

/// One increment of a session's traffic counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatDelta {
    pub incoming_bytes: u64,
    pub incoming_frames: u64,
    pub outgoing_bytes: u64,
    pub outgoing_frames: u64,
}

/// Per-session traffic counters. Lock-free so the receive loops can update
/// them without serializing on the session table.
#[derive(Debug, Default)]
pub struct Statistic {
    incoming_bytes: AtomicU64,
    incoming_frames: AtomicU64,
    outgoing_bytes: AtomicU64,
    outgoing_frames: AtomicU64,
}

impl Statistic {
    pub fn new() -> Statistic {
        Statistic::default()
    }

    pub fn add(&self, delta: &StatDelta) {
        self.incoming_bytes
            .fetch_add(delta.incoming_bytes, Ordering::Relaxed);
        self.incoming_frames
            .fetch_add(delta.incoming_frames, Ordering::Relaxed);
        self.outgoing_bytes
            .fetch_add(delta.outgoing_bytes, Ordering::Relaxed);
        self.outgoing_frames
            .fetch_add(delta.outgoing_frames, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatDelta {
        StatDelta {
            incoming_bytes: self.incoming_bytes.load(Ordering::Relaxed),
            incoming_frames: self.incoming_frames.load(Ordering::Relaxed),
            outgoing_bytes: self.outgoing_bytes.load(Ordering::Relaxed),
            outgoing_frames: self.outgoing_frames.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stat = Statistic::new();
        stat.add(&StatDelta {
            incoming_bytes: 100,
            incoming_frames: 1,
            ..Default::default()
        });
        stat.add(&StatDelta {
            incoming_bytes: 50,
            incoming_frames: 1,
            outgoing_bytes: 10,
            outgoing_frames: 1,
        });

        let snap = stat.snapshot();
        assert_eq!(snap.incoming_bytes, 150);
        assert_eq!(snap.incoming_frames, 2);
        assert_eq!(snap.outgoing_bytes, 10);
        assert_eq!(snap.outgoing_frames, 1);
    }
}
