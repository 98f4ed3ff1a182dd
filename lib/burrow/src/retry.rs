use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use hashbrown::HashMap;
use parking_lot::Mutex;

use loam::logging::{self, Logger};

use crate::cancel::{cancel_pair, CancelToken, Canceller};
use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::message::{Acknowledgement, Message};

const INIT_RTO: Duration = Duration::from_secs(1);
const SRTT_FACTOR: f64 = 1.0 / 8.0;
const RTTVAR_FACTOR: f64 = 1.0 / 4.0;
const RTO_FACTOR: f64 = 4.0;
// Grace added to every sample so queueing wobble does not starve the
// estimator of monotone inputs.
const RTT_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_timeout: Duration,
    pub backoff_factor: f64,
    pub keepalive_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_probes: u32,
    pub tracing: bool,
}

impl Default for RetryConfig {
    fn default() -> RetryConfig {
        RetryConfig {
            max_timeout: Duration::from_secs(30),
            backoff_factor: 0.2,
            keepalive_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(2),
            keepalive_probes: 20,
            tracing: false,
        }
    }
}

/// Late-bound transmission collaborators of a retry engine.
pub trait RetrySink: Send + Sync {
    /// Retransmits an already-framed message byte-for-byte.
    fn retransmit(&self, frame: &[u8], conn: &Arc<Connection>) -> Result<()>;
    /// Emits a keepalive frame; `ack` marks it as a reply to a peer probe.
    fn keepalive(&self, conn: &Arc<Connection>, ack: bool);
    /// The peer was declared dead.
    fn disconnect(&self, conn: &Arc<Connection>, err: Error);
}

/// A cheap read handle on the engine's current RTO, shared with the ack
/// accumulator so both read one atomic record.
#[derive(Clone)]
pub struct RtoHandle(Arc<AtomicU64>);

impl RtoHandle {
    pub(crate) fn fixed(rto: Duration) -> RtoHandle {
        RtoHandle(Arc::new(AtomicU64::new(rto.as_nanos() as u64)))
    }

    #[inline]
    pub fn get(&self) -> Duration {
        Duration::from_nanos(self.0.load(Ordering::Relaxed))
    }
}

type FlightKey = (u64, u32);

struct Flight {
    frame: Vec<u8>,
    start: Instant,
    attempts: u32,
    wait: Duration,
    deadline: Instant,
}

struct Estimator {
    srtt: f64,
    rttvar: f64,
    prev_rtt: f64,
}

enum KeepaliveEvent {
    AckSeen,
    PeerProbe,
}

struct Inner {
    log: Logger,
    cfg: RetryConfig,
    conn: Arc<Connection>,
    sink: Arc<dyn RetrySink>,
    flights: Mutex<HashMap<FlightKey, Flight>>,
    estimator: Mutex<Estimator>,
    rto_nanos: Arc<AtomicU64>,
    timer_tx: Sender<(FlightKey, Instant)>,
    keepalive_tx: Sender<KeepaliveEvent>,
    canceller: Mutex<Option<Canceller>>,
}

/// Per-message retransmission with RTT/SRTT/RTTVAR/RTO estimation,
/// exponential backoff and dead-peer detection. One engine per active
/// (connection, session).
pub struct Retry {
    inner: Arc<Inner>,
}

impl Retry {
    pub fn new(
        log: &Logger,
        cfg: RetryConfig,
        sink: Arc<dyn RetrySink>,
        conn: Arc<Connection>,
        parent: CancelToken,
    ) -> Arc<Retry> {
        let (canceller, token) = cancel_pair();
        let (timer_tx, timer_rx) = unbounded();
        let (keepalive_tx, keepalive_rx) = unbounded();

        let inner = Arc::new(Inner {
            log: log.new(logging::o!("layer" => "retry")),
            cfg,
            conn,
            sink,
            flights: Mutex::new(HashMap::new()),
            estimator: Mutex::new(Estimator {
                srtt: 0.0,
                rttvar: 0.0,
                prev_rtt: 0.0,
            }),
            rto_nanos: Arc::new(AtomicU64::new(INIT_RTO.as_nanos() as u64)),
            timer_tx,
            keepalive_tx,
            canceller: Mutex::new(Some(canceller)),
        });

        {
            let inner = inner.clone();
            let token = token.clone();
            let parent = parent.clone();
            thread::spawn(move || timer_loop(inner, timer_rx, token, parent));
        }
        {
            let inner = inner.clone();
            thread::spawn(move || keepalive_loop(inner, keepalive_rx, token, parent));
        }

        Arc::new(Retry { inner })
    }

    /// Registers an in-flight message. The frame is kept by value so every
    /// retransmission is byte-for-byte identical to the first send.
    pub fn push(&self, msg: &Message, frame: Vec<u8>) {
        let key = (msg.endpoint().0, msg.id);
        let rto = self.rto();
        let now = Instant::now();

        self.inner.flights.lock().insert(
            key,
            Flight {
                frame,
                start: now,
                attempts: 0,
                wait: rto,
                deadline: now + rto,
            },
        );
        let _ = self.inner.timer_tx.send((key, now + rto));
    }

    /// Cancels every acknowledged flight and feeds round-trip samples from
    /// flights that were never retransmitted (Karn's rule) to the
    /// estimator. `None` records bare liveness (a keepalive ack).
    pub fn ack(&self, ack: Option<&Acknowledgement>) {
        if let Some(ids) = ack {
            let now = Instant::now();
            for (endpoint, list) in ids.iter() {
                for id in list {
                    let removed = self.inner.flights.lock().remove(&(endpoint.0, *id));
                    if let Some(flight) = removed {
                        let rtt = (now + RTT_GRACE - flight.start).as_nanos() as f64;
                        if flight.attempts == 0 {
                            self.observe_rtt(rtt);
                        }

                        if self.inner.cfg.tracing {
                            logging::debug!(self.inner.log, "timer stopped";
                                            "id" => *id,
                                            "endpoint" => endpoint.0,
                                            "attempts" => flight.attempts,
                                            "rtt" => rtt,
                                            "rto" => ?self.rto());
                        }
                    }
                }
            }
        }
        let _ = self.inner.keepalive_tx.send(KeepaliveEvent::AckSeen);
    }

    /// A peer-originated keepalive probe was observed.
    pub fn keepalive(&self) {
        let _ = self.inner.keepalive_tx.send(KeepaliveEvent::PeerProbe);
    }

    #[inline]
    pub fn rto(&self) -> Duration {
        Duration::from_nanos(self.inner.rto_nanos.load(Ordering::Relaxed))
    }

    pub fn rto_handle(&self) -> RtoHandle {
        RtoHandle(self.inner.rto_nanos.clone())
    }

    /// Ends the engine: in-flight timers are drained without transmitting
    /// further retries.
    pub fn stop(&self) {
        if let Some(canceller) = self.inner.canceller.lock().take() {
            canceller.cancel();
        }
    }

    /// Rate-adaptive EWMA: the closer the new sample is to the previous
    /// one, the less it shifts SRTT and the more it narrows RTTVAR.
    fn observe_rtt(&self, rtt: f64) {
        let mut est = self.inner.estimator.lock();

        if est.srtt == 0.0 {
            est.srtt = rtt;
            est.rttvar = rtt / 2.0;
        } else {
            let mut rttrc = ((rtt - est.prev_rtt) / est.prev_rtt).abs();
            if rttrc > 1.0 {
                rttrc = 1.0;
            }
            let srtt_factor = SRTT_FACTOR * (1.0 + rttrc);
            let rttvar_factor = RTTVAR_FACTOR * (1.0 - rttrc);

            est.srtt = (1.0 - srtt_factor) * est.srtt + srtt_factor * rtt;
            est.rttvar =
                (1.0 - rttvar_factor) * est.rttvar + rttvar_factor * (est.srtt - rtt).abs();
        }

        est.prev_rtt = rtt;
        let rto = est.srtt + RTO_FACTOR * est.rttvar;
        self.inner.rto_nanos.store(rto as u64, Ordering::Relaxed);
    }

    #[cfg(test)]
    fn observe_rtt_for_test(&self, rtt: Duration) {
        self.observe_rtt(rtt.as_nanos() as f64);
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.inner.flights.lock().len()
    }
}

fn timer_loop(
    inner: Arc<Inner>,
    rx: Receiver<(FlightKey, Instant)>,
    token: CancelToken,
    parent: CancelToken,
) {
    let mut heap: BinaryHeap<Reverse<(Instant, FlightKey)>> = BinaryHeap::new();

    loop {
        let timeout = heap
            .peek()
            .map(|Reverse((deadline, _))| deadline.saturating_duration_since(Instant::now()));

        match timeout {
            Some(timeout) => {
                select! {
                    recv(rx) -> op => if let Ok((key, deadline)) = op {
                        heap.push(Reverse((deadline, key)));
                    },
                    recv(token.channel()) -> _ => return,
                    recv(parent.channel()) -> _ => return,
                    default(timeout) => {}
                }
            }
            None => {
                select! {
                    recv(rx) -> op => if let Ok((key, deadline)) = op {
                        heap.push(Reverse((deadline, key)));
                    },
                    recv(token.channel()) -> _ => return,
                    recv(parent.channel()) -> _ => return,
                }
            }
        }

        fire_due(&inner, &mut heap);
    }
}

enum Due {
    Gone,
    Rescheduled(Instant),
    Expired,
    Retransmit(Vec<u8>, Instant, u32),
}

fn fire_due(inner: &Arc<Inner>, heap: &mut BinaryHeap<Reverse<(Instant, FlightKey)>>) {
    loop {
        let now = Instant::now();
        match heap.peek() {
            Some(Reverse((deadline, _))) if *deadline <= now => {}
            _ => return,
        }
        let Reverse((_, key)) = heap.pop().expect("peeked entry vanished");

        // The flight may have been acked (gone) or already rearmed (stale
        // heap entry); both cases are skipped. The frame is cloned out so
        // no I/O happens under the lock.
        let due = {
            let mut flights = inner.flights.lock();
            match flights.get_mut(&key) {
                None => Due::Gone,
                Some(flight) if flight.deadline > now => Due::Rescheduled(flight.deadline),
                Some(flight) if now.duration_since(flight.start) >= inner.cfg.max_timeout => {
                    Due::Expired
                }
                Some(flight) => {
                    flight.attempts += 1;
                    flight.wait += Duration::from_secs_f64(
                        (f64::from(flight.attempts) * inner.cfg.backoff_factor).exp(),
                    );
                    flight.deadline = now + flight.wait;
                    Due::Retransmit(flight.frame.clone(), flight.deadline, flight.attempts)
                }
            }
        };

        match due {
            Due::Gone => {}
            Due::Rescheduled(deadline) => heap.push(Reverse((deadline, key))),
            Due::Expired => {
                inner.flights.lock().remove(&key);
                if inner.cfg.tracing {
                    logging::debug!(inner.log, "maximum retries time exceeded";
                                    "id" => key.1, "endpoint" => key.0);
                }
            }
            Due::Retransmit(frame, deadline, attempts) => {
                heap.push(Reverse((deadline, key)));

                if inner.cfg.tracing {
                    logging::debug!(inner.log, "waiting time increased";
                                    "id" => key.1,
                                    "endpoint" => key.0,
                                    "attempts" => attempts,
                                    "deadline" => ?deadline);
                }

                if let Err(err) = inner.sink.retransmit(&frame, &inner.conn) {
                    logging::error!(inner.log, "failed to send retry";
                                    "error" => %err, "id" => key.1, "endpoint" => key.0);
                }
            }
        }
    }
}

fn keepalive_loop(
    inner: Arc<Inner>,
    rx: Receiver<KeepaliveEvent>,
    token: CancelToken,
    parent: CancelToken,
) {
    let started = Instant::now();
    let mut last_ack: Option<Instant> = None;
    let mut probes = 0u32;

    loop {
        select! {
            recv(rx) -> event => match event {
                Ok(KeepaliveEvent::AckSeen) => {
                    last_ack = Some(Instant::now());
                    probes = 0;
                }
                Ok(KeepaliveEvent::PeerProbe) => {
                    last_ack = Some(Instant::now());
                    probes = 0;
                    inner.sink.keepalive(&inner.conn, true);
                }
                Err(_) => return,
            },
            recv(token.channel()) -> _ => return,
            recv(parent.channel()) -> _ => return,
            default(inner.cfg.keepalive_interval) => {
                let quiet = match last_ack {
                    Some(ts) => ts.elapsed() >= inner.cfg.keepalive_timeout,
                    None => true,
                };
                if !quiet || started.elapsed() < inner.cfg.keepalive_timeout {
                    continue;
                }

                if probes >= inner.cfg.keepalive_probes {
                    if let Some(canceller) = inner.canceller.lock().take() {
                        canceller.cancel();
                    }
                    inner.sink.disconnect(&inner.conn, Error::KeepaliveTimeoutExceeded);
                    return;
                }

                inner.sink.keepalive(&inner.conn, false);
                probes += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Endpoint, MessageType, PacketInfo};
    use parking_lot::Mutex as PlMutex;
    use std::net::UdpSocket;
    use std::sync::atomic::AtomicUsize;

    struct RecordingSink {
        retransmits: PlMutex<Vec<Vec<u8>>>,
        keepalives: AtomicUsize,
        keepalive_acks: AtomicUsize,
        disconnects: PlMutex<Vec<Error>>,
    }

    impl RecordingSink {
        fn new() -> Arc<RecordingSink> {
            Arc::new(RecordingSink {
                retransmits: PlMutex::new(Vec::new()),
                keepalives: AtomicUsize::new(0),
                keepalive_acks: AtomicUsize::new(0),
                disconnects: PlMutex::new(Vec::new()),
            })
        }
    }

    impl RetrySink for RecordingSink {
        fn retransmit(&self, frame: &[u8], _conn: &Arc<Connection>) -> Result<()> {
            self.retransmits.lock().push(frame.to_vec());
            Ok(())
        }

        fn keepalive(&self, _conn: &Arc<Connection>, ack: bool) {
            if ack {
                self.keepalive_acks.fetch_add(1, Ordering::SeqCst);
            } else {
                self.keepalives.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn disconnect(&self, _conn: &Arc<Connection>, err: Error) {
            self.disconnects.lock().push(err);
        }
    }

    fn test_conn() -> Arc<Connection> {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        Arc::new(Connection::udp_client(socket, addr, 1))
    }

    fn data_message(endpoint: u64, id: u32) -> Message {
        let mut m = Message::new(MessageType::Data);
        m.id = id;
        m.session_id = 1;
        m.packet = Some(PacketInfo {
            endpoint: Endpoint(endpoint),
            protocol: 6,
        });
        m
    }

    fn engine(cfg: RetryConfig, sink: Arc<RecordingSink>) -> Arc<Retry> {
        Retry::new(
            &logging::null(),
            cfg,
            sink,
            test_conn(),
            CancelToken::detached(),
        )
    }

    fn ack_of(endpoint: u64, id: u32) -> Acknowledgement {
        let mut ack = Acknowledgement::new();
        ack.push(Endpoint(endpoint), id);
        ack
    }

    #[test]
    fn test_rto_adaptation_window() {
        let sink = RecordingSink::new();
        let retry = engine(RetryConfig::default(), sink);

        for rtt_ms in &[100u64, 110, 90] {
            retry.observe_rtt_for_test(Duration::from_millis(*rtt_ms));
        }

        let rto = retry.rto();
        assert!(
            rto > Duration::from_millis(200) && rto < Duration::from_millis(400),
            "rto {:?} out of expected window",
            rto
        );
        retry.stop();
    }

    #[test]
    fn test_first_sample_initializes_estimator() {
        let sink = RecordingSink::new();
        let retry = engine(RetryConfig::default(), sink);

        retry.observe_rtt_for_test(Duration::from_millis(100));
        // SRTT + 4 * RTTVAR = 100 + 4 * 50 = 300ms.
        assert_eq!(retry.rto(), Duration::from_millis(300));
        retry.stop();
    }

    #[test]
    fn test_ack_cancels_flight() {
        let sink = RecordingSink::new();
        let retry = engine(RetryConfig::default(), sink.clone());

        let msg = data_message(5, 42);
        retry.push(&msg, vec![1, 2, 3]);
        assert_eq!(retry.in_flight(), 1);

        retry.ack(Some(&ack_of(5, 42)));
        assert_eq!(retry.in_flight(), 0);

        // Acked before the first expiry, so nothing is retransmitted.
        thread::sleep(Duration::from_millis(1200));
        assert!(sink.retransmits.lock().is_empty());
        retry.stop();
    }

    #[test]
    fn test_ack_of_unknown_id_is_noop() {
        let sink = RecordingSink::new();
        let retry = engine(RetryConfig::default(), sink);

        let before = retry.rto();
        retry.ack(Some(&ack_of(1, 999)));
        assert_eq!(retry.rto(), before);
        assert_eq!(retry.in_flight(), 0);
        retry.stop();
    }

    #[test]
    fn test_retransmission_is_byte_identical() {
        let sink = RecordingSink::new();
        let retry = engine(RetryConfig::default(), sink.clone());

        let msg = data_message(7, 1);
        let frame = vec![0xaa, 0xbb, 0xcc, 0xdd];
        retry.push(&msg, frame.clone());

        // Initial RTO is one second; wait for the first expiry.
        thread::sleep(Duration::from_millis(1400));
        let seen = sink.retransmits.lock().clone();
        assert!(!seen.is_empty(), "no retransmission happened");
        assert_eq!(seen[0], frame);
        retry.stop();
    }

    #[test]
    fn test_karns_rule_skips_retransmitted_samples() {
        let sink = RecordingSink::new();
        let retry = engine(RetryConfig::default(), sink);

        let msg = data_message(3, 8);
        retry.push(&msg, vec![9]);

        // Let the message retransmit once, then ack it. The sample must not
        // reach the estimator.
        thread::sleep(Duration::from_millis(1400));
        let before = retry.rto();
        retry.ack(Some(&ack_of(3, 8)));
        assert_eq!(retry.rto(), before);
        assert_eq!(retry.in_flight(), 0);
        retry.stop();
    }

    #[test]
    fn test_keepalive_death() {
        let sink = RecordingSink::new();
        let cfg = RetryConfig {
            keepalive_interval: Duration::from_secs(1),
            keepalive_timeout: Duration::from_secs(2),
            keepalive_probes: 3,
            ..Default::default()
        };
        let retry = engine(cfg, sink.clone());

        // 3 probes at ~2s, 3s, 4s; death on the tick after the third.
        thread::sleep(Duration::from_millis(5600));

        assert_eq!(sink.keepalives.load(Ordering::SeqCst), 3);
        let disconnects = sink.disconnects.lock();
        assert_eq!(disconnects.len(), 1);
        assert_eq!(disconnects[0], Error::KeepaliveTimeoutExceeded);
    }

    #[test]
    fn test_peer_probe_triggers_keepalive_ack() {
        let sink = RecordingSink::new();
        let retry = engine(RetryConfig::default(), sink.clone());

        retry.keepalive();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(sink.keepalive_acks.load(Ordering::SeqCst), 1);
        retry.stop();
    }

    #[test]
    fn test_stop_halts_retransmissions() {
        let sink = RecordingSink::new();
        let retry = engine(RetryConfig::default(), sink.clone());

        retry.push(&data_message(1, 1), vec![1]);
        retry.stop();

        thread::sleep(Duration::from_millis(1400));
        assert!(sink.retransmits.lock().is_empty());
    }
}
