use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::Mutex;

use loam::logging::{self, Logger};

use crate::cancel::{cancel_pair, CancelToken, Canceller};
use crate::conn::Connection;
use crate::error::Result;
use crate::message::{Acknowledgement, Endpoint, Message, MessageType, Payload};
use crate::retry::RtoHandle;

#[derive(Debug, Clone)]
pub struct AckConfig {
    /// One MTU frame's encrypted payload capacity; a batch never outgrows
    /// a single frame.
    pub max_size: usize,
    /// Fraction of the current RTO to wait before flushing a batch.
    pub waiting_time_percent: f64,
    pub tracing: bool,
}

/// Late-bound transmitter for flushed batches. The message travels the
/// normal send path of the owning transport.
pub trait AckSink: Send + Sync {
    fn send_ack(&self, msg: Message, conn: &Arc<Connection>) -> Result<()>;
}

/// Coalesces acknowledged (endpoint, id) pairs into one frame-sized batch,
/// bounded by size and by a fraction of the retry engine's RTO.
pub struct AckAccumulator {
    tx: Sender<(Endpoint, u32)>,
    canceller: Mutex<Option<Canceller>>,
}

impl AckAccumulator {
    pub fn new(
        log: &Logger,
        cfg: AckConfig,
        sink: Arc<dyn AckSink>,
        conn: Arc<Connection>,
        session_id: u32,
        rto: RtoHandle,
        parent: CancelToken,
    ) -> Arc<AckAccumulator> {
        let (canceller, token) = cancel_pair();
        let (tx, rx) = unbounded();
        let log = log.new(logging::o!("layer" => "ack"));

        thread::spawn(move || {
            accumulator_loop(log, cfg, sink, conn, session_id, rto, rx, token, parent)
        });

        Arc::new(AckAccumulator {
            tx,
            canceller: Mutex::new(Some(canceller)),
        })
    }

    /// Registers a received data frame for acknowledgement.
    #[inline]
    pub fn push(&self, endpoint: Endpoint, id: u32) {
        let _ = self.tx.send((endpoint, id));
    }

    /// Flushes pending acknowledgements best-effort and ends the worker.
    pub fn stop(&self) {
        if let Some(canceller) = self.canceller.lock().take() {
            canceller.cancel();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn accumulator_loop(
    log: Logger,
    cfg: AckConfig,
    sink: Arc<dyn AckSink>,
    conn: Arc<Connection>,
    session_id: u32,
    rto: RtoHandle,
    rx: Receiver<(Endpoint, u32)>,
    token: CancelToken,
    parent: CancelToken,
) {
    let part = cfg.waiting_time_percent / 100.0;
    let mut acc = Acknowledgement::with_max_size(cfg.max_size);
    let mut first: Option<Instant> = None;

    let flush = |acc: &mut Acknowledgement, first: &mut Option<Instant>| {
        *first = None;
        if acc.is_empty() {
            return;
        }

        let batch = std::mem::replace(acc, Acknowledgement::with_max_size(cfg.max_size));
        if cfg.tracing {
            logging::debug!(log, "sending acknowledgement";
                            "ack_size" => batch.message_count(),
                            "bytes" => batch.size(),
                            "rto" => ?rto.get());
        }

        let mut msg = Message::new(MessageType::Data);
        msg.session_id = session_id;
        msg.is_ack = true;
        msg.payload = Payload::Ack(batch);

        if let Err(err) = sink.send_ack(msg, &conn) {
            logging::error!(log, "failed to send acknowledgement"; "error" => %err);
        }
    };

    loop {
        let wait = rto.get().mul_f64(part);

        select! {
            recv(rx) -> item => match item {
                Ok((endpoint, id)) => {
                    if first.is_none() {
                        first = Some(Instant::now());
                    }
                    let added = acc.push(endpoint, id);
                    let elapsed = first.map(|ts| ts.elapsed() >= wait).unwrap_or(false);
                    if elapsed || !added {
                        flush(&mut acc, &mut first);
                        if !added {
                            acc.push(endpoint, id);
                        }
                    }
                }
                // The accumulator handle was dropped; drain and exit.
                Err(_) => {
                    flush(&mut acc, &mut first);
                    return;
                }
            },
            recv(token.channel()) -> _ => {
                flush(&mut acc, &mut first);
                return;
            }
            recv(parent.channel()) -> _ => {
                flush(&mut acc, &mut first);
                return;
            }
            default(wait) => flush(&mut acc, &mut first),
        }
    }
}
