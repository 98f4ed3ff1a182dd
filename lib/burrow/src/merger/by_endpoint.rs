use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use loam::logging::{self, Logger};

use crate::cancel::{cancel_pair, CancelToken, Canceller};
use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::message::Message;

use super::wlist::{Limits, Pending, PushOutcome, WaitingList};
use super::{MergeSink, MergerConfig, StreamMerger};

type StreamKey = (u32, u64);

enum StreamEvent {
    Message(Pending),
    Probe,
}

struct SessionEntry {
    // Dropping the canceller on delete trips every worker of the session.
    _canceller: Canceller,
    token: CancelToken,
}

type StreamMap = Arc<Mutex<HashMap<StreamKey, Sender<StreamEvent>>>>;

/// The by-endpoint merger (V2, default): one worker per (session, endpoint)
/// pair, spawned on demand and reclaimed after `stream_ttl` of idleness.
pub struct ByEndpoint {
    log: Logger,
    cfg: MergerConfig,
    sink: RwLock<Option<Arc<dyn MergeSink>>>,
    sessions: Mutex<HashMap<u32, SessionEntry>>,
    streams: StreamMap,
    parent: CancelToken,
}

impl ByEndpoint {
    pub fn new(log: &Logger, cfg: MergerConfig, parent: CancelToken) -> ByEndpoint {
        let merger = ByEndpoint {
            log: log.new(logging::o!("layer" => "merger")),
            cfg,
            sink: RwLock::new(None),
            sessions: Mutex::new(HashMap::new()),
            streams: Arc::new(Mutex::new(HashMap::new())),
            parent,
        };
        merger.start_stream_checker();
        merger
    }

    /// Periodically probes every worker so idle streams can expire even
    /// when no traffic arrives.
    fn start_stream_checker(&self) {
        if self.cfg.stream_check_interval.is_zero() || self.cfg.stream_ttl.is_zero() {
            return;
        }

        let interval = self.cfg.stream_check_interval;
        let streams = self.streams.clone();
        let parent = self.parent.clone();

        thread::spawn(move || loop {
            select! {
                recv(parent.channel()) -> _ => return,
                default(interval) => {
                    for tx in streams.lock().values() {
                        let _ = tx.send(StreamEvent::Probe);
                    }
                }
            }
        });
    }

    fn sink(&self) -> Result<Arc<dyn MergeSink>> {
        self.sink.read().clone().ok_or(Error::HandlerNotSet)
    }

    fn spawn_worker(
        &self,
        key: StreamKey,
        rx: Receiver<StreamEvent>,
        tx: Sender<StreamEvent>,
        session_token: CancelToken,
        sink: Arc<dyn MergeSink>,
    ) {
        let log = self.log.new(logging::o!(
            "session_id" => key.0,
            "endpoint" => key.1,
        ));
        let limits = Limits {
            max_size: self.cfg.waiting_list_max_size,
            max_ttl: self.cfg.waiting_list_max_ttl,
        };
        let stream_ttl = self.cfg.stream_ttl;
        let tracing = self.cfg.tracing;
        let streams = self.streams.clone();
        let parent = self.parent.clone();

        thread::spawn(move || {
            if tracing {
                logging::debug!(log, "stream created");
            }

            let remove_self = || {
                let mut streams = streams.lock();
                let mine = streams.get(&key).map_or(false, |cur| cur.same_channel(&tx));
                if mine {
                    streams.remove(&key);
                }
            };

            let mut wl = WaitingList::new();
            let mut last_msg = Instant::now();

            loop {
                select! {
                    recv(rx) -> event => match event {
                        Ok(StreamEvent::Message(p)) => {
                            if p.msg.session_id != key.0 || p.msg.endpoint().0 != key.1 {
                                logging::error!(log, "wrong session id or endpoint received";
                                                "req_session_id" => p.msg.session_id,
                                                "req_endpoint" => p.msg.endpoint().0);
                                continue;
                            }
                            last_msg = Instant::now();

                            let id = p.msg.id;
                            let mut deliver = |p: Pending| {
                                if let Err(err) = sink.deliver(p.msg, &p.conn) {
                                    logging::error!(log, "error on streaming"; "error" => %err);
                                }
                            };
                            match wl.push(p, &limits, &mut deliver) {
                                PushOutcome::Duplicate => {
                                    if tracing {
                                        logging::debug!(log, "duplicate dropped"; "id" => id);
                                    }
                                }
                                PushOutcome::Reset => {
                                    logging::error!(log, "maximum waiting list size or TTL exceeded";
                                                    "id" => id,
                                                    "last_id" => wl.last_id().unwrap_or(0));
                                }
                                PushOutcome::Delivered | PushOutcome::Buffered => {}
                            }
                        }
                        Ok(StreamEvent::Probe) => {
                            if last_msg.elapsed() >= stream_ttl {
                                remove_self();
                                logging::debug!(log, "stream finished due timeout");
                                return;
                            }
                        }
                        Err(_) => {
                            remove_self();
                            return;
                        }
                    },
                    recv(session_token.channel()) -> _ => {
                        remove_self();
                        if tracing {
                            logging::debug!(log, "stream finished");
                        }
                        return;
                    }
                    recv(parent.channel()) -> _ => {
                        remove_self();
                        return;
                    }
                }
            }
        });
    }
}

impl StreamMerger for ByEndpoint {
    fn set_sink(&self, sink: Arc<dyn MergeSink>) {
        *self.sink.write() = Some(sink);
    }

    fn create_stream(&self, session_id: u32) -> Result<()> {
        if self.sink.read().is_none() {
            return Err(Error::HandlerNotSet);
        }

        let mut sessions = self.sessions.lock();
        sessions.entry(session_id).or_insert_with(|| {
            let (canceller, token) = cancel_pair();
            SessionEntry {
                _canceller: canceller,
                token,
            }
        });

        Ok(())
    }

    fn delete_stream(&self, session_id: u32) {
        self.sessions.lock().remove(&session_id);
    }

    fn push(&self, msg: Message, conn: Arc<Connection>) -> Result<()> {
        let sink = self.sink()?;

        if !msg.is_stream_merge() {
            return sink.deliver(msg, &conn);
        }

        let session_id = msg.session_id;
        let token = {
            let sessions = self.sessions.lock();
            sessions.get(&session_id).map(|entry| entry.token.clone())
        };
        let token = match token {
            Some(token) => token,
            None => {
                logging::error!(self.log, "session not found";
                                "id" => msg.id, "session_id" => session_id);
                sink.reset(session_id, &conn);
                return Err(Error::SessionNotExists);
            }
        };

        if self.cfg.tracing {
            logging::debug!(self.log, "push to stream merger";
                            "id" => msg.id, "endpoint" => msg.endpoint().0);
        }

        let key = (session_id, msg.endpoint().0);
        let mut event = StreamEvent::Message(Pending { msg, conn });

        // The worker may expire between the map lookup and the send; a
        // failed send forgets the stale entry and spawns a fresh stream.
        loop {
            let tx = {
                let mut streams = self.streams.lock();
                match streams.entry(key) {
                    Entry::Occupied(entry) => entry.get().clone(),
                    Entry::Vacant(entry) => {
                        let (tx, rx) = unbounded();
                        entry.insert(tx.clone());
                        self.spawn_worker(key, rx, tx.clone(), token.clone(), sink.clone());
                        tx
                    }
                }
            };

            match tx.send(event) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let mut streams = self.streams.lock();
                    let stale = streams.get(&key).map_or(false, |cur| cur.same_channel(&tx));
                    if stale {
                        streams.remove(&key);
                    }
                    event = err.0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests_support::{collecting_sink, test_conn, test_message};
    use super::super::{MergerConfig, StreamMerger, ThreadingBy};
    use super::*;
    use std::time::Duration;

    fn merger(cfg: MergerConfig) -> ByEndpoint {
        ByEndpoint::new(&logging::null(), cfg, CancelToken::detached())
    }

    fn default_cfg() -> MergerConfig {
        MergerConfig {
            threading_by: ThreadingBy::Endpoint,
            ..Default::default()
        }
    }

    #[test]
    fn test_push_requires_sink() {
        let m = merger(default_cfg());
        let msg = test_message(1, 1, 5);
        assert_eq!(
            m.push(msg, test_conn()).unwrap_err(),
            Error::HandlerNotSet
        );
    }

    #[test]
    fn test_unknown_session_resets() {
        let m = merger(default_cfg());
        let (sink, state) = collecting_sink();
        m.set_sink(sink);

        let msg = test_message(9, 1, 5);
        assert_eq!(
            m.push(msg, test_conn()).unwrap_err(),
            Error::SessionNotExists
        );
        assert_eq!(state.resets(), vec![9]);
    }

    #[test]
    fn test_reordering_per_endpoint() {
        let m = merger(default_cfg());
        let (sink, state) = collecting_sink();
        m.set_sink(sink);
        m.create_stream(1).unwrap();

        let conn = test_conn();
        // Endpoint 5 sees 1 first, then 3 out of order; 2 closes the gap.
        for id in &[1u32, 3, 2] {
            m.push(test_message(1, *id, 5), conn.clone()).unwrap();
        }
        for id in &[1u32, 2] {
            m.push(test_message(1, *id, 6), conn.clone()).unwrap();
        }

        state.wait_for(5, Duration::from_secs(2));
        assert_eq!(state.delivered_for(5), vec![1, 2, 3]);
        assert_eq!(state.delivered_for(6), vec![1, 2]);
        m.delete_stream(1);
    }

    #[test]
    fn test_ordered_delivery_with_gap_closing() {
        let m = merger(default_cfg());
        let (sink, state) = collecting_sink();
        m.set_sink(sink);
        m.create_stream(4).unwrap();

        let conn = test_conn();
        for id in &[1u32, 4, 3, 2, 5] {
            m.push(test_message(4, *id, 9), conn.clone()).unwrap();
        }

        state.wait_for(5, Duration::from_secs(2));
        assert_eq!(state.delivered_for(9), vec![1, 2, 3, 4, 5]);
        m.delete_stream(4);
    }

    #[test]
    fn test_passthrough_without_session() {
        let m = merger(default_cfg());
        let (sink, state) = collecting_sink();
        m.set_sink(sink);

        // session_id 0 is not subject to merging.
        let msg = test_message(0, 42, 5);
        m.push(msg, test_conn()).unwrap();
        assert_eq!(state.delivered_for(5), vec![42]);
    }

    #[test]
    fn test_delete_stream_stops_session() {
        let m = merger(default_cfg());
        let (sink, _state) = collecting_sink();
        m.set_sink(sink);
        m.create_stream(2).unwrap();
        m.delete_stream(2);

        let msg = test_message(2, 1, 5);
        assert_eq!(
            m.push(msg, test_conn()).unwrap_err(),
            Error::SessionNotExists
        );
    }

    #[test]
    fn test_idle_stream_expires_and_respawns() {
        let cfg = MergerConfig {
            stream_check_interval: Duration::from_millis(50),
            stream_ttl: Duration::from_millis(100),
            ..default_cfg()
        };
        let m = merger(cfg);
        let (sink, state) = collecting_sink();
        m.set_sink(sink);
        m.create_stream(1).unwrap();

        let conn = test_conn();
        m.push(test_message(1, 1, 5), conn.clone()).unwrap();
        state.wait_for(1, Duration::from_secs(2));

        // Wait for the worker to expire, then push again: a fresh worker
        // (with a fresh waiting list) takes over.
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(m.streams.lock().len(), 0);

        m.push(test_message(1, 1, 5), conn).unwrap();
        state.wait_for(2, Duration::from_secs(2));
        assert_eq!(state.delivered_for(5), vec![1, 1]);
        m.delete_stream(1);
    }
}
