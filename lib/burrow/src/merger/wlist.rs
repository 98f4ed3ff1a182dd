use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashSet;

use crate::conn::Connection;
use crate::message::Message;

/// A message parked in (or passing through) a waiting list, together with
/// the connection it arrived on.
pub(crate) struct Pending {
    pub msg: Message,
    pub conn: Arc<Connection>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub max_size: usize,
    pub max_ttl: Duration,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    Duplicate,
    Delivered,
    Buffered,
    Reset,
}

/// The per-(session, endpoint) reorder buffer. Entries are kept sorted by
/// modular distance from the next expected id, so the u32 wrap needs no
/// special cases in the scan. `last_id` is a tagged marker: `None` until
/// the first delivery ever.
pub(crate) struct WaitingList {
    last_id: Option<u32>,
    data: Vec<Pending>,
    data_size: usize,
    first_ts: Option<Instant>,
    ids: HashSet<u32>,
}

impl WaitingList {
    pub(crate) fn new() -> WaitingList {
        WaitingList {
            last_id: None,
            data: Vec::new(),
            data_size: 0,
            first_ts: None,
            ids: HashSet::new(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub(crate) fn byte_size(&self) -> usize {
        self.data_size
    }

    #[inline]
    pub(crate) fn last_id(&self) -> Option<u32> {
        self.last_id
    }

    /// Feeds one message through the ordering machine. Contiguous messages
    /// are delivered through `sink` immediately (draining any head run they
    /// release); out-of-order messages are parked; overflow of either bound
    /// drains the whole list in buffer order.
    pub(crate) fn push(
        &mut self,
        p: Pending,
        limits: &Limits,
        sink: &mut dyn FnMut(Pending),
    ) -> PushOutcome {
        let id = p.msg.id;

        if self.is_duplicate(id) {
            return PushOutcome::Duplicate;
        }

        // First delivery ever, or the message closes the gap.
        let expected = self.next_expected();
        if expected.is_none() || expected == Some(id) {
            self.deliver(p, sink);
            self.drain_head(sink);
            return PushOutcome::Delivered;
        }

        self.insert(p);

        let expired = self
            .first_ts
            .map(|ts| ts.elapsed() >= limits.max_ttl)
            .unwrap_or(false);
        if self.data_size > limits.max_size || expired {
            self.reset(sink);
            return PushOutcome::Reset;
        }

        PushOutcome::Buffered
    }

    /// Delivers everything currently buffered in list order. This is the
    /// deliberate one-time ordering break that releases head-of-line
    /// blocking; `last_id` advances to the final delivered id.
    pub(crate) fn reset(&mut self, sink: &mut dyn FnMut(Pending)) {
        for p in std::mem::take(&mut self.data) {
            self.last_id = Some(p.msg.id);
            sink(p);
        }
        self.ids.clear();
        self.data_size = 0;
        self.first_ts = None;
    }

    fn is_duplicate(&self, id: u32) -> bool {
        let seen = match self.last_id {
            Some(last) => id <= last && last < u32::MAX,
            None => false,
        };
        seen || self.ids.contains(&id)
    }

    #[inline]
    fn next_expected(&self) -> Option<u32> {
        self.last_id.map(|last| last.wrapping_add(1))
    }

    fn deliver(&mut self, p: Pending, sink: &mut dyn FnMut(Pending)) {
        self.last_id = Some(p.msg.id);
        sink(p);
    }

    /// Delivers the head run made contiguous by the last delivery.
    fn drain_head(&mut self, sink: &mut dyn FnMut(Pending)) {
        loop {
            match self.data.first() {
                Some(head) if Some(head.msg.id) == self.next_expected() => {}
                _ => break,
            }
            let p = self.data.remove(0);
            self.ids.remove(&p.msg.id);
            self.data_size -= p.msg.payload_length as usize;
            self.deliver(p, sink);
        }

        if self.data.is_empty() {
            self.first_ts = None;
        }
    }

    fn insert(&mut self, p: Pending) {
        // Sort key: distance from the next expected id under wrapping
        // arithmetic. Ids that wrapped past zero land after u32::MAX where
        // they belong.
        let base = self.next_expected().unwrap_or(0);
        let key = p.msg.id.wrapping_sub(base);
        let pos = self
            .data
            .binary_search_by_key(&key, |e| e.msg.id.wrapping_sub(base))
            .unwrap_or_else(|pos| pos);

        if self.data.is_empty() {
            self.first_ts = Some(Instant::now());
        }
        self.data_size += p.msg.payload_length as usize;
        self.ids.insert(p.msg.id);
        self.data.insert(pos, p);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use std::net::UdpSocket;

    fn test_conn() -> Arc<Connection> {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        Arc::new(Connection::udp_client(socket, addr, 1))
    }

    fn pending(conn: &Arc<Connection>, id: u32) -> Pending {
        let mut msg = Message::new(MessageType::Data);
        msg.id = id;
        msg.session_id = 1;
        Pending {
            msg,
            conn: conn.clone(),
        }
    }

    fn pending_sized(conn: &Arc<Connection>, id: u32, size: u16) -> Pending {
        let mut p = pending(conn, id);
        p.msg.payload_length = size;
        p
    }

    fn limits() -> Limits {
        Limits {
            max_size: 100,
            max_ttl: Duration::from_secs(10),
        }
    }

    fn run(ids: &[u32]) -> Vec<u32> {
        let conn = test_conn();
        let mut wl = WaitingList::new();
        let mut out = Vec::new();
        let limits = limits();
        for id in ids {
            let mut sink = |p: Pending| out.push(p.msg.id);
            wl.push(pending(&conn, *id), &limits, &mut sink);
        }
        out
    }

    #[test]
    fn test_reordered_burst_is_delivered_in_order() {
        let input = [
            10, 9, 5, 8, 7, 6, 4, 3, 2, 1, 11, 12, 13, 14, 15, 21, 20, 19, 18, 17, 16, 22,
        ];
        let expected: Vec<u32> = (1..=22).collect();
        assert_eq!(run(&input), expected);
    }

    #[test]
    fn test_duplicates_and_gaps() {
        let input = [
            1, 1, 1, 2, 4, 5, 6, 5, 5, 3, 8, 7, 9, 10, 11, 11, 11, 15, 17, 18, 19, 20, 1, 2, 12,
            13, 21, 22, 14, 16, 23, 0, 1, 2, 3,
        ];
        let expected: Vec<u32> = (1..=23).collect();
        assert_eq!(run(&input), expected);
    }

    #[test]
    fn test_already_ordered_passes_through() {
        let input: Vec<u32> = (1..=50).collect();
        assert_eq!(run(&input), input);
    }

    #[test]
    fn test_first_message_is_delivered_whatever_its_id() {
        assert_eq!(run(&[10, 11, 12]), vec![10, 11, 12]);
    }

    #[test]
    fn test_wraparound_delivery() {
        let conn = test_conn();
        let mut wl = WaitingList::new();
        let mut out = Vec::new();
        let limits = limits();

        for id in &[u32::MAX - 1, u32::MAX, 0, 1, 2] {
            let mut sink = |p: Pending| out.push(p.msg.id);
            let outcome = wl.push(pending(&conn, *id), &limits, &mut sink);
            assert_eq!(outcome, PushOutcome::Delivered);
        }
        assert_eq!(out, vec![u32::MAX - 1, u32::MAX, 0, 1, 2]);
    }

    #[test]
    fn test_wraparound_buffering() {
        let conn = test_conn();
        let mut wl = WaitingList::new();
        let mut out = Vec::new();
        let limits = limits();

        // Deliver up to u32::MAX, then park the post-wrap ids 1 and 2
        // while 0 is missing.
        for id in &[u32::MAX - 1, u32::MAX] {
            let mut sink = |p: Pending| out.push(p.msg.id);
            wl.push(pending(&conn, *id), &limits, &mut sink);
        }
        for id in &[2u32, 1] {
            let mut sink = |p: Pending| out.push(p.msg.id);
            assert_eq!(
                wl.push(pending(&conn, *id), &limits, &mut sink),
                PushOutcome::Buffered
            );
        }
        let mut sink = |p: Pending| out.push(p.msg.id);
        assert_eq!(
            wl.push(pending(&conn, 0), &limits, &mut sink),
            PushOutcome::Delivered
        );
        assert_eq!(out, vec![u32::MAX - 1, u32::MAX, 0, 1, 2]);
    }

    #[test]
    fn test_size_overflow_resets_in_buffer_order() {
        let conn = test_conn();
        let mut wl = WaitingList::new();
        let mut out = Vec::new();
        let limits = Limits {
            max_size: 35,
            max_ttl: Duration::from_secs(10),
        };

        {
            let mut sink = |p: Pending| out.push(p.msg.id);
            wl.push(pending(&conn, 1), &limits, &mut sink);

            // 2 is missing; park 10-byte messages until the bound trips.
            for id in &[3u32, 4, 5] {
                assert_eq!(
                    wl.push(pending_sized(&conn, *id, 10), &limits, &mut sink),
                    PushOutcome::Buffered
                );
            }
            assert_eq!(
                wl.push(pending_sized(&conn, 6, 10), &limits, &mut sink),
                PushOutcome::Reset
            );
        }

        // The gap at 2 is skipped; the buffer drains in order.
        assert_eq!(out, vec![1, 3, 4, 5, 6]);
        assert_eq!(wl.last_id(), Some(6));
        assert_eq!(wl.byte_size(), 0);
        assert_eq!(wl.len(), 0);

        // The late 2 is now a duplicate-by-order and must not appear.
        let mut sink = |p: Pending| out.push(p.msg.id);
        assert_eq!(
            wl.push(pending(&conn, 2), &limits, &mut sink),
            PushOutcome::Duplicate
        );
        assert_eq!(
            wl.push(pending(&conn, 7), &limits, &mut sink),
            PushOutcome::Delivered
        );
        assert_eq!(out, vec![1, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_ttl_overflow_resets() {
        let conn = test_conn();
        let mut wl = WaitingList::new();
        let mut out = Vec::new();
        let limits = Limits {
            max_size: 1000,
            max_ttl: Duration::from_millis(50),
        };

        let mut sink = |p: Pending| out.push(p.msg.id);
        wl.push(pending(&conn, 1), &limits, &mut sink);
        wl.push(pending(&conn, 3), &limits, &mut sink);
        wl.push(pending(&conn, 4), &limits, &mut sink);

        std::thread::sleep(Duration::from_millis(80));

        // The next buffered push notices the expired batch and drains it.
        assert_eq!(
            wl.push(pending(&conn, 5), &limits, &mut sink),
            PushOutcome::Reset
        );
        assert_eq!(out, vec![1, 3, 4, 5]);
        assert_eq!(wl.last_id(), Some(5));
    }

    #[test]
    fn test_buffered_duplicate_is_dropped() {
        let conn = test_conn();
        let mut wl = WaitingList::new();
        let mut out = Vec::new();
        let limits = limits();

        let mut sink = |p: Pending| out.push(p.msg.id);
        wl.push(pending(&conn, 1), &limits, &mut sink);
        assert_eq!(
            wl.push(pending(&conn, 5), &limits, &mut sink),
            PushOutcome::Buffered
        );
        assert_eq!(
            wl.push(pending(&conn, 5), &limits, &mut sink),
            PushOutcome::Duplicate
        );
        assert_eq!(wl.len(), 1);
    }

    #[test]
    fn test_random_permutations_deliver_in_order() {
        use rand::seq::SliceRandom;

        let conn = test_conn();
        let expected: Vec<u32> = (1..=40).collect();
        let mut rng = rand::thread_rng();

        for _ in 0..20 {
            let mut input = expected.clone();
            input.shuffle(&mut rng);

            let mut wl = WaitingList::new();
            let mut out = Vec::new();
            let limits = Limits {
                max_size: 1_000_000,
                max_ttl: Duration::from_secs(60),
            };
            for id in &input {
                let mut sink = |p: Pending| out.push(p.msg.id);
                wl.push(pending(&conn, *id), &limits, &mut sink);
            }
            assert_eq!(out, expected, "input {:?}", input);
        }
    }
}
