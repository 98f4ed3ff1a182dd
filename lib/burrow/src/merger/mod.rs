//! The stream merger restores per-endpoint ordering of `Data` frames that
//! raced each other across parallel transport flows. Two structurally
//! similar variants share the waiting-list semantics and differ only in
//! threading: one worker per session, or one worker per (session, endpoint)
//! stream spawned on demand.

mod by_endpoint;
mod by_session;
mod wlist;

use std::sync::Arc;
use std::time::Duration;

use loam::logging::Logger;

use crate::cancel::CancelToken;
use crate::conn::Connection;
use crate::error::Result;
use crate::message::Message;

pub use by_endpoint::ByEndpoint;
pub use by_session::BySession;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadingBy {
    Session,
    Endpoint,
}

impl ThreadingBy {
    pub fn from_name(name: &str) -> Option<ThreadingBy> {
        match name {
            "session" => Some(ThreadingBy::Session),
            "endpoint" => Some(ThreadingBy::Endpoint),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergerConfig {
    pub threading_by: ThreadingBy,
    pub waiting_list_max_size: usize,
    pub waiting_list_max_ttl: Duration,
    /// How often idle by-endpoint workers are probed. Zero disables expiry.
    pub stream_check_interval: Duration,
    /// A by-endpoint worker idle for this long closes and frees itself.
    pub stream_ttl: Duration,
    pub tracing: bool,
}

impl Default for MergerConfig {
    fn default() -> MergerConfig {
        MergerConfig {
            threading_by: ThreadingBy::Endpoint,
            waiting_list_max_size: 1_048_576,
            waiting_list_max_ttl: Duration::from_secs(60),
            stream_check_interval: Duration::from_secs(60),
            stream_ttl: Duration::from_secs(300),
            tracing: false,
        }
    }
}

/// Late-bound consumers of merged traffic, supplied by the session layer.
pub trait MergeSink: Send + Sync {
    /// Delivers one message in order. Failures are logged by the worker and
    /// do not stop the stream.
    fn deliver(&self, msg: Message, conn: &Arc<Connection>) -> Result<()>;
    /// A frame arrived for a session this merger does not know.
    fn reset(&self, session_id: u32, conn: &Arc<Connection>);
}

pub trait StreamMerger: Send + Sync {
    fn set_sink(&self, sink: Arc<dyn MergeSink>);
    fn create_stream(&self, session_id: u32) -> Result<()>;
    fn delete_stream(&self, session_id: u32);
    /// Routes a message into its stream. Non-mergeable messages pass
    /// straight through to the sink.
    fn push(&self, msg: Message, conn: Arc<Connection>) -> Result<()>;
}

/// Builds the merger variant selected by the configuration.
pub fn create(log: &Logger, cfg: MergerConfig, parent: CancelToken) -> Arc<dyn StreamMerger> {
    match cfg.threading_by {
        ThreadingBy::Session => Arc::new(BySession::new(log, cfg, parent)),
        ThreadingBy::Endpoint => Arc::new(ByEndpoint::new(log, cfg, parent)),
    }
}
