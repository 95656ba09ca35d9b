//! Framework event collection
//!
//! The collector is a process-wide singleton observing database and ORM
//! events for every in-flight request. All storage is partitioned by
//! [`RequestId`]; events carrying an identity that is not currently active
//! (a stale or foreign request) are silently dropped, so cross-request
//! interference cannot occur.

use crate::context::RequestId;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

/// How a SQL list entry was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueryKind {
    Query,
    Transaction,
}

/// One entry on the SQL tab. Insertion-ordered, never deduplicated.
#[derive(Debug, Clone, Serialize)]
pub struct QueryRecord {
    pub sql: String,
    pub kind: QueryKind,
    /// Milliseconds; transaction markers carry no duration.
    pub duration_ms: Option<f64>,
}

/// The twelve ORM model lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelEventKind {
    Retrieved,
    Creating,
    Created,
    Updating,
    Updated,
    Saving,
    Saved,
    Deleting,
    Deleted,
    Restoring,
    Restored,
    Replicating,
}

impl ModelEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retrieved => "retrieved",
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Updating => "updating",
            Self::Updated => "updated",
            Self::Saving => "saving",
            Self::Saved => "saved",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Restoring => "restoring",
            Self::Restored => "restored",
            Self::Replicating => "replicating",
        }
    }
}

/// Model name plus primary-key value, as carried on the event bus.
#[derive(Debug, Clone, Serialize)]
pub struct ModelRef {
    pub name: String,
    pub key: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelEvent {
    pub model: String,
    pub key: Value,
    pub kind: ModelEventKind,
}

/// Connection descriptor attached to transaction/connection events.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub name: String,
    pub driver: String,
}

/// Events the host publishes on the process-global bus.
#[derive(Debug, Clone)]
pub enum DbEvent {
    QueryExecuted {
        request_id: RequestId,
        sql: String,
        bindings: Vec<Value>,
        duration_ms: f64,
    },
    TransactionBegun {
        request_id: RequestId,
        connection: ConnectionInfo,
    },
    TransactionCommitted {
        request_id: RequestId,
        connection: ConnectionInfo,
    },
    TransactionRolledBack {
        request_id: RequestId,
        connection: ConnectionInfo,
    },
    ConnectionEstablished {
        request_id: RequestId,
        connection: ConnectionInfo,
    },
    Model {
        request_id: RequestId,
        kind: ModelEventKind,
        /// Some hosts deliver the affected model wrapped in a
        /// single-element list; only the first entry is recorded.
        models: Vec<ModelRef>,
    },
    ViewRendered {
        request_id: RequestId,
        name: String,
    },
}

/// Process-global database event bus.
///
/// Cloneable handle around a broadcast channel; the host instruments its
/// database layer to `publish` and the collector subscribes exactly once.
#[derive(Clone)]
pub struct DbEventBus {
    sender: broadcast::Sender<DbEvent>,
}

impl DbEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Dropped silently when nobody is listening.
    pub fn publish(&self, event: DbEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DbEvent> {
        self.sender.subscribe()
    }
}

impl Default for DbEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Request-partitioned event store.
pub struct EventCollector {
    /// Requests currently in flight, with their start instant. Doubles as
    /// the stale-event filter and the sweeper index.
    active: DashMap<RequestId, Instant>,
    queries: DashMap<RequestId, Vec<QueryRecord>>,
    models: DashMap<RequestId, Vec<ModelEvent>>,
    views: DashMap<RequestId, Vec<String>>,
    listeners_registered: AtomicBool,
}

impl EventCollector {
    pub fn new() -> Self {
        Self {
            active: DashMap::new(),
            queries: DashMap::new(),
            models: DashMap::new(),
            views: DashMap::new(),
            listeners_registered: AtomicBool::new(false),
        }
    }

    /// Subscribe to the event bus and forward events into the partitions.
    ///
    /// Idempotent: the underlying bus is process-global while collector
    /// handles may be passed around freely, so registration is guarded by
    /// a one-time flag. Registering twice never double-counts events.
    pub fn register_listeners(self: &Arc<Self>, bus: &DbEventBus) {
        if self.listeners_registered.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut rx = bus.subscribe();
        let collector = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => collector.dispatch(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Diagnostic data only; dropping under pressure is fine.
                        debug!(skipped, "trace event bus lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn dispatch(&self, event: DbEvent) {
        match event {
            DbEvent::QueryExecuted {
                request_id,
                sql,
                bindings,
                duration_ms,
            } => self.record_query(&request_id, &sql, &bindings, duration_ms),
            DbEvent::TransactionBegun {
                request_id,
                connection,
            } => self.record_transaction(&request_id, "Begin Transaction", &connection),
            DbEvent::TransactionCommitted {
                request_id,
                connection,
            } => self.record_transaction(&request_id, "Commit Transaction", &connection),
            DbEvent::TransactionRolledBack {
                request_id,
                connection,
            } => self.record_transaction(&request_id, "Rollback Transaction", &connection),
            DbEvent::ConnectionEstablished {
                request_id,
                connection,
            } => self.record_transaction(&request_id, "Connection Established", &connection),
            DbEvent::Model {
                request_id,
                kind,
                models,
            } => self.record_model_event(&request_id, kind, &models),
            DbEvent::ViewRendered { request_id, name } => self.record_view(&request_id, name),
        }
    }

    /// Open partitions for a new request.
    pub fn begin_request(&self, id: &RequestId) {
        self.active.insert(id.clone(), Instant::now());
    }

    /// Record an executed query with its bound parameters interpolated.
    ///
    /// Events for an identity that is not active (the request already
    /// finished, or was never traced) are dropped.
    pub fn record_query(&self, id: &RequestId, sql: &str, bindings: &[Value], duration_ms: f64) {
        if !self.active.contains_key(id) {
            return;
        }
        self.queries.entry(id.clone()).or_default().push(QueryRecord {
            sql: interpolate_bindings(sql, bindings),
            kind: QueryKind::Query,
            duration_ms: Some(duration_ms),
        });
    }

    /// Record a zero-duration transaction/connection marker.
    pub fn record_transaction(&self, id: &RequestId, event: &str, connection: &ConnectionInfo) {
        if !self.active.contains_key(id) {
            return;
        }
        self.queries.entry(id.clone()).or_default().push(QueryRecord {
            sql: format!("[{}:{}] {}", connection.name, connection.driver, event),
            kind: QueryKind::Transaction,
            duration_ms: None,
        });
    }

    /// Record a model lifecycle event. A wrapped single-element model list
    /// is unwrapped to its first entry.
    pub fn record_model_event(&self, id: &RequestId, kind: ModelEventKind, models: &[ModelRef]) {
        if !self.active.contains_key(id) {
            return;
        }
        let Some(model) = models.first() else {
            return;
        };
        self.models.entry(id.clone()).or_default().push(ModelEvent {
            model: model.name.clone(),
            key: model.key.clone(),
            kind,
        });
    }

    /// Record a rendered view template name.
    pub fn record_view(&self, id: &RequestId, name: String) {
        if !self.active.contains_key(id) {
            return;
        }
        self.views.entry(id.clone()).or_default().push(name);
    }

    /// Read and evict this request's query records.
    pub fn take_queries(&self, id: &RequestId) -> Vec<QueryRecord> {
        self.queries.remove(id).map(|(_, v)| v).unwrap_or_default()
    }

    /// Read and evict this request's model events.
    pub fn take_model_events(&self, id: &RequestId) -> Vec<ModelEvent> {
        self.models.remove(id).map(|(_, v)| v).unwrap_or_default()
    }

    /// Read and evict this request's rendered view names.
    pub fn take_views(&self, id: &RequestId) -> Vec<String> {
        self.views.remove(id).map(|(_, v)| v).unwrap_or_default()
    }

    /// Drop every partition belonging to this request. Invoked from the
    /// response-termination hook; idempotent.
    pub fn evict(&self, id: &RequestId) {
        self.active.remove(id);
        self.queries.remove(id);
        self.models.remove(id);
        self.views.remove(id);
    }

    /// Drop partitions for requests older than `max_age`. Backstop for
    /// requests whose termination hook never fired (client disconnect,
    /// process kill between phases).
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let stale: Vec<RequestId> = self
            .active
            .iter()
            .filter(|entry| entry.value().elapsed() > max_age)
            .map(|entry| entry.key().clone())
            .collect();

        for id in &stale {
            debug!(request_id = %id, "evicting stale trace partition");
            self.evict(id);
        }
        stale.len()
    }

    /// Run the stale-partition sweep on an interval.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration, max_age: Duration) {
        let collector = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                collector.sweep_stale(max_age);
            }
        });
    }
}

impl Default for EventCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Interpolate bound parameters into a SQL template positionally: the
/// first `?` consumes the first parameter and so on. String parameters
/// are single-quoted, nulls become `NULL`, other scalars print as-is.
fn interpolate_bindings(sql: &str, bindings: &[Value]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut params = bindings.iter();

    for ch in sql.chars() {
        if ch == '?' {
            match params.next() {
                Some(Value::String(s)) => {
                    result.push('\'');
                    result.push_str(s);
                    result.push('\'');
                }
                Some(Value::Null) => result.push_str("NULL"),
                Some(value) => result.push_str(&value.to_string()),
                None => result.push('?'),
            }
        } else {
            result.push(ch);
        }
    }

    result
}
