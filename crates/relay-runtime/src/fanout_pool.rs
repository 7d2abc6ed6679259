//! Registry of open server-push stream connections.
//!
//! Each connection is an unbounded channel sink drained by the HTTP layer.
//! The pool writes a preamble and a `connected` event on registration, keeps
//! the connection alive with periodic heartbeats, and reaps sinks whose
//! receiving side has gone away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::runtime_helpers::lock_or_recover;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const STREAM_PREAMBLE: &str = "relay stream open";
const FANOUT_EVENT_CAPACITY: usize = 256;

/// One unit written to a stream sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Comment(String),
    Data(String),
}

impl StreamFrame {
    pub fn event(payload: &Value) -> Self {
        Self::Data(payload.to_string())
    }

    pub fn heartbeat() -> Self {
        Self::event(&json!({"type": "heartbeat"}))
    }
}

pub type StreamSink = mpsc::UnboundedSender<StreamFrame>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    Requested,
    SinkClosed,
    BroadcastFailed,
    HeartbeatFailed,
    Shutdown,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::SinkClosed => "sink_closed",
            Self::BroadcastFailed => "broadcast_failed",
            Self::HeartbeatFailed => "heartbeat_failed",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Observer notifications; `open_connections` is the count after the change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanOutEvent {
    ConnectionAdded {
        client_id: String,
        open_connections: usize,
    },
    ConnectionRemoved {
        client_id: String,
        open_connections: usize,
        reason: RemovalReason,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutConfig {
    pub heartbeat_interval: Duration,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

struct StreamConnection {
    generation: u64,
    sink: StreamSink,
    heartbeat: JoinHandle<()>,
}

struct FanOutInner {
    config: FanOutConfig,
    connections: Mutex<HashMap<String, StreamConnection>>,
    next_generation: AtomicU64,
    total_registered: AtomicU64,
    events: broadcast::Sender<FanOutEvent>,
}

impl FanOutInner {
    fn remove_matching(
        &self,
        client_id: &str,
        generation: Option<u64>,
        reason: RemovalReason,
    ) -> bool {
        let (removed, open_connections) = {
            let mut connections = lock_or_recover(&self.connections);
            let matches = match (connections.get(client_id), generation) {
                (Some(connection), Some(generation)) => connection.generation == generation,
                (Some(_), None) => true,
                (None, _) => false,
            };
            let removed = if matches {
                connections.remove(client_id)
            } else {
                None
            };
            (removed, connections.len())
        };
        let Some(connection) = removed else {
            return false;
        };
        connection.heartbeat.abort();
        drop(connection.sink);
        debug!(client_id, reason = reason.as_str(), open_connections, "stream connection removed");
        let _ = self.events.send(FanOutEvent::ConnectionRemoved {
            client_id: client_id.to_string(),
            open_connections,
            reason,
        });
        true
    }
}

#[derive(Clone)]
pub struct StreamFanOutPool {
    inner: Arc<FanOutInner>,
}

impl std::fmt::Debug for StreamFanOutPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamFanOutPool")
            .field("config", &self.inner.config)
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl StreamFanOutPool {
    pub fn new(config: FanOutConfig) -> Self {
        let (events, _) = broadcast::channel(FANOUT_EVENT_CAPACITY);
        Self {
            inner: Arc::new(FanOutInner {
                config,
                connections: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                total_registered: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub fn config(&self) -> &FanOutConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FanOutEvent> {
        self.inner.events.subscribe()
    }

    /// Opens a stream for `client_id`, replacing any connection already using that id.
    ///
    /// Must be called inside a Tokio runtime; the heartbeat runs as a task.
    pub fn register(&self, client_id: &str, sink: StreamSink) -> u64 {
        let generation = self
            .inner
            .next_generation
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        let _ = sink.send(StreamFrame::Comment(STREAM_PREAMBLE.to_string()));
        let _ = sink.send(StreamFrame::event(
            &json!({"type": "connected", "clientId": client_id}),
        ));
        let heartbeat = tokio::spawn(run_heartbeat(
            Arc::downgrade(&self.inner),
            client_id.to_string(),
            generation,
            sink.clone(),
            self.inner.config.heartbeat_interval,
        ));

        let (replaced, open_connections) = {
            let mut connections = lock_or_recover(&self.inner.connections);
            let replaced = connections.insert(
                client_id.to_string(),
                StreamConnection {
                    generation,
                    sink,
                    heartbeat,
                },
            );
            (replaced, connections.len())
        };
        if let Some(previous) = replaced {
            previous.heartbeat.abort();
            debug!(client_id, "stream connection replaced by a newer registration");
        }
        self.inner.total_registered.fetch_add(1, Ordering::AcqRel);
        info!(client_id, generation, open_connections, "stream connection registered");
        let _ = self.inner.events.send(FanOutEvent::ConnectionAdded {
            client_id: client_id.to_string(),
            open_connections,
        });
        generation
    }

    /// Closes and forgets the connection for `client_id`. Returns false when absent.
    pub fn remove(&self, client_id: &str) -> bool {
        self.inner
            .remove_matching(client_id, None, RemovalReason::Requested)
    }

    /// Writes `payload` as one event to every open connection, reaping dead sinks.
    pub fn broadcast(&self, payload: &Value) -> BroadcastReport {
        let frame = StreamFrame::event(payload);
        let targets = lock_or_recover(&self.inner.connections)
            .iter()
            .map(|(client_id, connection)| {
                (client_id.clone(), connection.generation, connection.sink.clone())
            })
            .collect::<Vec<_>>();

        let mut report = BroadcastReport::default();
        for (client_id, generation, sink) in targets {
            if sink.send(frame.clone()).is_ok() {
                report.delivered = report.delivered.saturating_add(1);
            } else if self.inner.remove_matching(
                client_id.as_str(),
                Some(generation),
                RemovalReason::BroadcastFailed,
            ) {
                report.removed = report.removed.saturating_add(1);
            }
        }
        report
    }

    pub fn contains(&self, client_id: &str) -> bool {
        lock_or_recover(&self.inner.connections).contains_key(client_id)
    }

    pub fn connection_count(&self) -> usize {
        lock_or_recover(&self.inner.connections).len()
    }

    /// Registrations accepted over the pool's lifetime, replacements included.
    pub fn total_registered(&self) -> u64 {
        self.inner.total_registered.load(Ordering::Acquire)
    }

    pub fn client_ids(&self) -> Vec<String> {
        let mut ids = lock_or_recover(&self.inner.connections)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Closes every connection. Safe to call more than once.
    pub fn shutdown(&self) {
        let client_ids = self.client_ids();
        if !client_ids.is_empty() {
            info!(connections = client_ids.len(), "closing stream connections");
        }
        for client_id in client_ids {
            self.inner
                .remove_matching(client_id.as_str(), None, RemovalReason::Shutdown);
        }
    }
}

async fn run_heartbeat(
    pool: Weak<FanOutInner>,
    client_id: String,
    generation: u64,
    sink: StreamSink,
    period: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    let reason = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if sink.send(StreamFrame::heartbeat()).is_err() {
                    break RemovalReason::HeartbeatFailed;
                }
            }
            _ = sink.closed() => break RemovalReason::SinkClosed,
        }
    };
    drop(sink);
    if let Some(pool) = pool.upgrade() {
        pool.remove_matching(client_id.as_str(), Some(generation), reason);
    }
}
