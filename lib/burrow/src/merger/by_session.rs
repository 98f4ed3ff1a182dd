use std::sync::Arc;
use std::thread;

use crossbeam_channel::{select, unbounded, Sender};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use loam::logging::{self, Logger};

use crate::cancel::{cancel_pair, CancelToken, Canceller};
use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::message::Message;

use super::wlist::{Limits, Pending, PushOutcome, WaitingList};
use super::{MergeSink, MergerConfig, StreamMerger};

struct SessionWorker {
    tx: Sender<Pending>,
    // Dropped on delete; the worker exits at its next suspension point.
    _canceller: Canceller,
}

/// The by-session merger (V1): one worker per session owning an
/// endpoint-to-waiting-list map, so no per-stream locks exist at all.
pub struct BySession {
    log: Logger,
    cfg: MergerConfig,
    sink: RwLock<Option<Arc<dyn MergeSink>>>,
    sessions: Mutex<HashMap<u32, SessionWorker>>,
    parent: CancelToken,
}

impl BySession {
    pub fn new(log: &Logger, cfg: MergerConfig, parent: CancelToken) -> BySession {
        BySession {
            log: log.new(logging::o!("layer" => "merger")),
            cfg,
            sink: RwLock::new(None),
            sessions: Mutex::new(HashMap::new()),
            parent,
        }
    }

    fn sink(&self) -> Result<Arc<dyn MergeSink>> {
        self.sink.read().clone().ok_or(Error::HandlerNotSet)
    }

    fn spawn_worker(&self, session_id: u32, sink: Arc<dyn MergeSink>) -> SessionWorker {
        let (canceller, token) = cancel_pair();
        let (tx, rx) = unbounded::<Pending>();
        let log = self.log.new(logging::o!("session_id" => session_id));
        let limits = Limits {
            max_size: self.cfg.waiting_list_max_size,
            max_ttl: self.cfg.waiting_list_max_ttl,
        };
        let tracing = self.cfg.tracing;
        let parent = self.parent.clone();

        thread::spawn(move || {
            let mut lists: HashMap<u64, WaitingList> = HashMap::new();

            loop {
                select! {
                    recv(rx) -> event => match event {
                        Ok(p) => {
                            if p.msg.session_id != session_id {
                                logging::error!(log, "wrong session id received";
                                                "req_session_id" => p.msg.session_id);
                                continue;
                            }

                            let id = p.msg.id;
                            let endpoint = p.msg.endpoint().0;
                            let wl = lists.entry(endpoint).or_insert_with(WaitingList::new);

                            let mut deliver = |p: Pending| {
                                if let Err(err) = sink.deliver(p.msg, &p.conn) {
                                    logging::error!(log, "error on streaming";
                                                    "error" => %err, "endpoint" => endpoint);
                                }
                            };
                            match wl.push(p, &limits, &mut deliver) {
                                PushOutcome::Duplicate => {
                                    if tracing {
                                        logging::debug!(log, "duplicate dropped";
                                                        "id" => id, "endpoint" => endpoint);
                                    }
                                }
                                PushOutcome::Reset => {
                                    logging::error!(log, "maximum waiting list size or TTL exceeded";
                                                    "id" => id, "endpoint" => endpoint);
                                }
                                PushOutcome::Delivered | PushOutcome::Buffered => {}
                            }
                        }
                        Err(_) => return,
                    },
                    recv(token.channel()) -> _ => {
                        logging::debug!(log, "session worker finished");
                        return;
                    }
                    recv(parent.channel()) -> _ => return,
                }
            }
        });

        SessionWorker {
            tx,
            _canceller: canceller,
        }
    }
}

impl StreamMerger for BySession {
    fn set_sink(&self, sink: Arc<dyn MergeSink>) {
        *self.sink.write() = Some(sink);
    }

    fn create_stream(&self, session_id: u32) -> Result<()> {
        let sink = self.sink()?;

        let mut sessions = self.sessions.lock();
        if !sessions.contains_key(&session_id) {
            let worker = self.spawn_worker(session_id, sink);
            sessions.insert(session_id, worker);
        }

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
        let sessions = self.sessions.lock();
        match sessions.get(&session_id) {
            Some(worker) => {
                if self.cfg.tracing {
                    logging::debug!(self.log, "push to stream merger";
                                    "id" => msg.id, "endpoint" => msg.endpoint().0);
                }
                worker
                    .tx
                    .send(Pending { msg, conn })
                    .map_err(|_| Error::SessionNotExists)
            }
            None => {
                drop(sessions);
                logging::error!(self.log, "session not found";
                                "id" => msg.id, "session_id" => session_id);
                sink.reset(session_id, &conn);
                Err(Error::SessionNotExists)
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

    fn merger() -> BySession {
        let cfg = MergerConfig {
            threading_by: ThreadingBy::Session,
            ..Default::default()
        };
        BySession::new(&logging::null(), cfg, CancelToken::detached())
    }

    #[test]
    fn test_reordering_across_endpoints() {
        let m = merger();
        let (sink, state) = collecting_sink();
        m.set_sink(sink);
        m.create_stream(1).unwrap();

        let conn = test_conn();
        // Two endpoints interleaved; each must be ordered independently.
        for (id, endpoint) in &[(1u32, 5u64), (1, 6), (3, 5), (2, 6), (2, 5)] {
            m.push(test_message(1, *id, *endpoint), conn.clone()).unwrap();
        }

        state.wait_for(5, Duration::from_secs(2));
        assert_eq!(state.delivered_for(5), vec![1, 2, 3]);
        assert_eq!(state.delivered_for(6), vec![1, 2]);
        m.delete_stream(1);
    }

    #[test]
    fn test_unknown_session_resets() {
        let m = merger();
        let (sink, state) = collecting_sink();
        m.set_sink(sink);

        assert_eq!(
            m.push(test_message(3, 1, 5), test_conn()).unwrap_err(),
            Error::SessionNotExists
        );
        assert_eq!(state.resets(), vec![3]);
    }

    #[test]
    fn test_create_stream_requires_sink() {
        let m = merger();
        assert_eq!(m.create_stream(1).unwrap_err(), Error::HandlerNotSet);
    }
}
