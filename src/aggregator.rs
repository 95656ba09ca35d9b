//! Trace aggregation
//!
//! On response finalization the aggregator pulls every per-request data
//! source together into the ordered tab structure the panel renders,
//! evicting the request's partitions as it reads them.

use crate::capture::{CapturedError, ExceptionCapture};
use crate::collector::{EventCollector, ModelEvent, QueryRecord};
use crate::config::TraceConfig;
use crate::context::{
    RequestMeta, ResponseMeta, RouteInfo, SessionSnapshot, TraceContext,
};
use crate::messages::{DebugMessage, MessageRecorder};
use crate::system;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

/// Fixed tab order; keys are internal, titles are display labels.
const TABS: &[(&str, &str)] = &[
    ("messages", "Messages"),
    ("base", "Base"),
    ("route", "Route"),
    ("view", "View"),
    ("models", "Models"),
    ("sql", "SQL"),
    ("exception", "Exception"),
    ("session", "Session"),
    ("request", "Request"),
];

/// A single value inside a tab.
#[derive(Debug, Clone, Serialize)]
pub enum TabItem {
    /// Plain scalar text.
    Text(String),
    /// Structured value rendered as foldable JSON.
    Json(Value),
    /// SQL list row with an optional duration badge.
    Sql {
        sql: String,
        duration_ms: Option<f64>,
    },
    /// Debug message with a source link.
    Message(DebugMessage),
    /// Preformatted code block (exception chain).
    Code(String),
    /// Editor-linkable source location.
    SourceLink {
        label: String,
        file: String,
        line: u32,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    pub label: Option<String>,
    pub item: TabItem,
}

impl Entry {
    fn labeled(label: impl Into<String>, item: TabItem) -> Self {
        Self {
            label: Some(label.into()),
            item,
        }
    }

    fn bare(item: TabItem) -> Self {
        Self { label: None, item }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Tab {
    pub key: String,
    pub title: String,
    pub entries: Vec<Entry>,
}

/// The finished, ordered tab structure. Built fresh per request, never
/// persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceTabs {
    pub tabs: Vec<Tab>,
}

impl TraceTabs {
    pub fn get(&self, key: &str) -> Option<&Tab> {
        self.tabs.iter().find(|t| t.key == key)
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }
}

/// Hook invoked with the finished structure before rendering. An error
/// aborts panel rendering for the response but never the response itself.
pub type EndOfTraceHook = Arc<dyn Fn(&TraceTabs) -> anyhow::Result<()> + Send + Sync>;

pub struct TraceAggregator {
    collector: Arc<EventCollector>,
    recorder: Arc<MessageRecorder>,
    capture: Arc<ExceptionCapture>,
    config: TraceConfig,
    end_hook: Option<EndOfTraceHook>,
}

impl TraceAggregator {
    pub fn new(
        collector: Arc<EventCollector>,
        recorder: Arc<MessageRecorder>,
        capture: Arc<ExceptionCapture>,
        config: TraceConfig,
    ) -> Self {
        Self {
            collector,
            recorder,
            capture,
            config,
            end_hook: None,
        }
    }

    pub fn set_end_hook(&mut self, hook: EndOfTraceHook) {
        self.end_hook = Some(hook);
    }

    /// Build the tab structure for a finished request, reading and
    /// evicting this request's partitions. Returns `None` when the
    /// end-of-trace hook rejects the trace.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &self,
        ctx: &TraceContext,
        req: &RequestMeta,
        resp: &ResponseMeta,
        attached_error: Option<&CapturedError>,
        route: Option<&RouteInfo>,
        session: Option<&SessionSnapshot>,
    ) -> Option<TraceTabs> {
        let exception = self.exception_entries(ctx, attached_error);
        let (sql, sql_seconds) = self.sql_entries(ctx);
        let messages: Vec<Entry> = self
            .recorder
            .take_messages(&ctx.request_id)
            .into_iter()
            .map(|m| Entry::bare(TabItem::Message(m)))
            .collect();
        let base = self.base_entries(ctx, req, resp, session, &sql_seconds);
        let route = self.route_entries(req, route);
        let session = session_entries(session);
        let request = request_entries(req, resp);
        let view: Vec<Entry> = self
            .collector
            .take_views(&ctx.request_id)
            .into_iter()
            .map(|name| Entry::bare(TabItem::Text(name)))
            .collect();
        let models = model_entries(self.collector.take_model_events(&ctx.request_id));

        let mut tabs = TraceTabs::default();
        for (key, title) in TABS {
            let entries = match *key {
                "messages" => messages.clone(),
                "base" => base.clone(),
                "route" => route.clone(),
                "view" => view.clone(),
                "models" => models.clone(),
                "sql" => sql.clone(),
                "exception" => exception.clone(),
                "session" => session.clone(),
                "request" => request.clone(),
                _ => Vec::new(),
            };

            let suffix = match *key {
                "messages" | "sql" | "models" if !entries.is_empty() => {
                    format!(" ({})", entries.len())
                }
                "exception" if !entries.is_empty() => " 🔴".to_string(),
                _ => String::new(),
            };

            let entries = if entries.is_empty() {
                vec![Entry::bare(TabItem::Text(empty_hint(key).to_string()))]
            } else {
                entries
            };

            tabs.tabs.push(Tab {
                key: (*key).to_string(),
                title: format!("{}{}", title, suffix),
                entries,
            });
        }

        if let Some(hook) = &self.end_hook {
            if let Err(e) = hook(&tabs) {
                warn!(request_id = %ctx.request_id, error = %e, "end-of-trace hook failed, omitting trace");
                return None;
            }
        }

        Some(tabs)
    }

    /// Resolve the exception to display: instance-level capture first,
    /// then the typed slot attached to the response.
    fn exception_entries(
        &self,
        ctx: &TraceContext,
        attached: Option<&CapturedError>,
    ) -> Vec<Entry> {
        let err = match self.capture.current(&ctx.request_id) {
            Some(err) => err,
            None => match attached {
                Some(err) => err.clone(),
                None => return Vec::new(),
            },
        };

        let mut entries = vec![
            Entry::labeled("message", TabItem::Text(err.message.clone())),
            Entry::labeled("line", TabItem::Text(err.line.to_string())),
        ];
        if let Some(detail) = &err.detail {
            entries.push(Entry::labeled("exception", TabItem::Code(detail.clone())));
        }
        entries.push(Entry::labeled(
            "file",
            TabItem::SourceLink {
                label: format!("{}#{}", basename(&err.file), err.line),
                file: err.file.clone(),
                line: err.line,
            },
        ));
        entries.push(Entry::labeled("code", TabItem::Text(err.status.to_string())));
        entries
    }

    /// SQL rows plus the total query time in seconds.
    ///
    /// Durations are summed in milliseconds first and divided once at the
    /// end, so per-entry rounding cannot compound; the result is formatted
    /// to three decimals with Rust's default round-half-even.
    fn sql_entries(&self, ctx: &TraceContext) -> (Vec<Entry>, String) {
        let records = self.collector.take_queries(&ctx.request_id);
        let total_ms: f64 = records.iter().filter_map(|r| r.duration_ms).sum();

        let entries = records
            .into_iter()
            .map(|QueryRecord { sql, duration_ms, .. }| {
                Entry::bare(TabItem::Sql { sql, duration_ms })
            })
            .collect();

        let seconds = if total_ms > 0.0 {
            format!("{:.3}", total_ms / 1000.0)
        } else {
            "0".to_string()
        };
        (entries, seconds)
    }

    fn base_entries(
        &self,
        ctx: &TraceContext,
        req: &RequestMeta,
        _resp: &ResponseMeta,
        session: Option<&SessionSnapshot>,
        sql_seconds: &str,
    ) -> Vec<Entry> {
        // Truncated to 3 decimals for display; throughput derives from the
        // truncated value so a displayed 0.000 shows as ∞.
        let runtime = (ctx.started.elapsed().as_secs_f64() * 1000.0).floor() / 1000.0;
        let reqs = if runtime > 0.0 {
            format!("{:.2}", 1.0 / runtime)
        } else {
            "∞".to_string()
        };
        let memory_delta = system::current_memory().saturating_sub(ctx.start_memory);

        let mut base = vec![
            Entry::labeled(
                "请求信息",
                TabItem::Text(format!("{} {}", req.method, req.full_url)),
            ),
            Entry::labeled("运行时间", TabItem::Text(format!("{:.3}秒", runtime))),
            Entry::labeled("吞吐率", TabItem::Text(format!("{} req/s", reqs))),
            Entry::labeled(
                "内存消耗",
                TabItem::Text(system::size_format(memory_delta, 2, false)),
            ),
            Entry::labeled("查询时间", TabItem::Text(format!("{}秒", sql_seconds))),
        ];

        let session_id = session.and_then(|s| s.id.clone()).unwrap_or_default();
        base.push(Entry::labeled(
            "会话信息",
            TabItem::Text(format!("SESSION_ID={}", session_id)),
        ));

        base.push(Entry::labeled(
            "Crate Version",
            TabItem::Text(env!("CARGO_PKG_VERSION").to_string()),
        ));
        base.push(Entry::labeled(
            "Rust Version",
            TabItem::Text(format!("rustc {}+", env!("CARGO_PKG_RUST_VERSION"))),
        ));
        base.push(Entry::labeled(
            "Environment",
            TabItem::Text(self.config.environment.clone()),
        ));
        base.push(Entry::labeled(
            "Locale",
            TabItem::Text(self.config.locale.clone()),
        ));

        match &self.config.db {
            Some(db) => {
                base.push(Entry::labeled(
                    "DB Driver",
                    TabItem::Text(format!(
                        "{}({}) {}",
                        db.driver,
                        system::mask_ip(&db.host),
                        if db.charset.is_empty() { "-" } else { &db.charset }
                    )),
                ));
                base.push(Entry::labeled(
                    "DB Connect",
                    TabItem::Text(format!(
                        "{}({})",
                        db.database,
                        system::mask_username(&db.username)
                    )),
                ));
            }
            None => {
                base.push(Entry::labeled("DB Driver", TabItem::Text("-".to_string())));
                base.push(Entry::labeled("DB Connect", TabItem::Text("-".to_string())));
            }
        }

        base.push(Entry::labeled("OS", TabItem::Text(system::os_summary())));
        if let Some(disk) = system::disk_summary() {
            base.push(Entry::labeled("Disk Space", TabItem::Text(disk)));
        }

        base
    }

    fn route_entries(&self, req: &RequestMeta, route: Option<&RouteInfo>) -> Vec<Entry> {
        let pattern = match (&req.matched_path, route) {
            (Some(p), _) => p.clone(),
            (None, Some(_)) => format!("/{}", req.path),
            (None, None) => return Vec::new(),
        };

        let mut entries = vec![Entry::labeled(
            "uri",
            TabItem::Text(format!("{} {}", req.method, pattern)),
        )];

        if let Some(info) = route {
            if let Some(controller) = &info.controller {
                entries.push(Entry::labeled("controller", TabItem::Text(controller.clone())));
            }
            if let Some(source) = &info.source {
                entries.push(Entry::labeled(
                    "file",
                    TabItem::SourceLink {
                        label: format!(
                            "{}#{}-{}",
                            basename(&source.file),
                            source.line_start,
                            source.line_end
                        ),
                        file: source.file.clone(),
                        line: source.line_start,
                    },
                ));
            }
            if !info.params.is_empty() {
                let params: Vec<Value> =
                    info.params.iter().map(|p| json!(p.as_str())).collect();
                entries.push(Entry::labeled("params", TabItem::Json(Value::Array(params))));
            }
            if !info.middleware.is_empty() {
                entries.push(Entry::labeled(
                    "middleware",
                    TabItem::Text(info.middleware.join(", ")),
                ));
            }
            if let Some(action) = &info.action {
                entries.push(Entry::labeled("action", TabItem::Text(action.clone())));
            }
        }

        entries
    }
}

fn session_entries(session: Option<&SessionSnapshot>) -> Vec<Entry> {
    let Some(session) = session else {
        return Vec::new();
    };

    session
        .data
        .iter()
        .map(|(key, value)| match value {
            Value::Object(_) | Value::Array(_) => {
                Entry::labeled(key.clone(), TabItem::Json(value.clone()))
            }
            other => Entry::labeled(key.clone(), TabItem::Text(scalar_text(other))),
        })
        .collect()
}

fn request_entries(req: &RequestMeta, resp: &ResponseMeta) -> Vec<Entry> {
    let query: serde_json::Map<String, Value> = req
        .query
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let request_headers: serde_json::Map<String, Value> = req
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let response_headers: serde_json::Map<String, Value> = resp
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    vec![
        Entry::labeled("path", TabItem::Text(req.path.clone())),
        Entry::labeled("status_code", TabItem::Text(resp.status.to_string())),
        Entry::labeled(
            "content_type",
            TabItem::Text(if resp.content_type.is_empty() {
                "text/html".to_string()
            } else {
                resp.content_type.clone()
            }),
        ),
        Entry::labeled("host", TabItem::Text(req.host.clone())),
        Entry::labeled("ip", TabItem::Text(req.ip.clone())),
        Entry::labeled("request_query", TabItem::Json(Value::Object(query))),
        Entry::labeled(
            "request_request",
            TabItem::Json(Value::Object(req.body_params.clone())),
        ),
        Entry::labeled(
            "request_headers",
            TabItem::Json(Value::Object(request_headers)),
        ),
        Entry::labeled(
            "response_headers",
            TabItem::Json(Value::Object(response_headers)),
        ),
    ]
}

/// Aggregate model events into `"Name:key 「N次」"` strings, first-seen
/// order preserved.
fn model_entries(events: Vec<ModelEvent>) -> Vec<Entry> {
    let mut order: Vec<String> = Vec::new();
    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for event in events {
        let key = format!("{}:{}", event.model, scalar_text(&event.key));
        if !counts.contains_key(&key) {
            order.push(key.clone());
        }
        *counts.entry(key).or_insert(0) += 1;
    }

    order
        .into_iter()
        .map(|key| {
            let count = counts[&key];
            Entry::bare(TabItem::Text(format!("{} 「{}次」", key, count)))
        })
        .collect()
}

/// Scalar display text: strings bare, `NULL`/`TRUE`/`FALSE` conventions
/// for the rest.
pub fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) if s.is_empty() => "''".to_string(),
        Value::String(s) => s.clone(),
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        other => other.to_string(),
    }
}

fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn empty_hint(tab: &str) -> &'static str {
    match tab {
        "messages" => "暂无调试内容",
        "sql" => "暂无SQL查询",
        "view" => "没有加载视图",
        "exception" => "暂无异常信息",
        _ => "暂无内容",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{ModelEventKind, ModelRef};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn aggregator() -> (TraceAggregator, Arc<EventCollector>, Arc<MessageRecorder>, Arc<ExceptionCapture>)
    {
        let collector = Arc::new(EventCollector::new());
        let recorder = Arc::new(MessageRecorder::new());
        let capture = Arc::new(ExceptionCapture::new());
        let aggregator = TraceAggregator::new(
            collector.clone(),
            recorder.clone(),
            capture.clone(),
            TraceConfig::default(),
        );
        (aggregator, collector, recorder, capture)
    }

    fn build_simple(aggregator: &TraceAggregator, ctx: &TraceContext) -> TraceTabs {
        aggregator
            .build(
                ctx,
                &RequestMeta {
                    method: "GET".to_string(),
                    ..Default::default()
                },
                &ResponseMeta::default(),
                None,
                None,
                None,
            )
            .expect("trace should build")
    }

    #[test]
    fn test_tab_order_is_fixed() {
        let (aggregator, collector, _, _) = aggregator();
        let ctx = TraceContext::new(true, 0);
        collector.begin_request(&ctx.request_id);
        let tabs = build_simple(&aggregator, &ctx);

        let keys: Vec<&str> = tabs.tabs.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["messages", "base", "route", "view", "models", "sql", "exception", "session", "request"]
        );
    }

    #[test]
    fn test_query_time_sums_in_ms_then_divides() {
        let (aggregator, collector, _, _) = aggregator();
        let ctx = TraceContext::new(true, 0);
        collector.begin_request(&ctx.request_id);
        collector.record_query(&ctx.request_id, "select 1", &[], 12.5);
        collector.record_query(&ctx.request_id, "select 2", &[], 7.25);

        let tabs = build_simple(&aggregator, &ctx);
        let base = tabs.get("base").unwrap();
        let query_time = base
            .entries
            .iter()
            .find(|e| e.label.as_deref() == Some("查询时间"))
            .unwrap();
        match &query_time.item {
            TabItem::Text(text) => assert_eq!(text, "0.020秒"),
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[test]
    fn test_sql_tab_title_counts_entries() {
        let (aggregator, collector, _, _) = aggregator();
        let ctx = TraceContext::new(true, 0);
        collector.begin_request(&ctx.request_id);
        collector.record_query(&ctx.request_id, "select 1", &[], 1.0);
        collector.record_query(&ctx.request_id, "select 2", &[], 1.0);

        let tabs = build_simple(&aggregator, &ctx);
        assert_eq!(tabs.get("sql").unwrap().title, "SQL (2)");
    }

    #[test]
    fn test_model_aggregation_strings() {
        let (aggregator, collector, _, _) = aggregator();
        let ctx = TraceContext::new(true, 0);
        collector.begin_request(&ctx.request_id);
        let user = |id: i64| ModelRef {
            name: "User".to_string(),
            key: json!(id),
        };
        collector.record_model_event(&ctx.request_id, ModelEventKind::Retrieved, &[user(1)]);
        collector.record_model_event(&ctx.request_id, ModelEventKind::Retrieved, &[user(1)]);
        collector.record_model_event(&ctx.request_id, ModelEventKind::Created, &[user(2)]);

        let tabs = build_simple(&aggregator, &ctx);
        let models = tabs.get("models").unwrap();
        let texts: Vec<&str> = models
            .entries
            .iter()
            .map(|e| match &e.item {
                TabItem::Text(t) => t.as_str(),
                other => panic!("unexpected item: {:?}", other),
            })
            .collect();
        assert_eq!(texts, vec!["User:1 「2次」", "User:2 「1次」"]);
        assert_eq!(models.title, "Models (2)");
    }

    #[test]
    fn test_model_partition_evicted_at_read() {
        let (aggregator, collector, _, _) = aggregator();
        let ctx = TraceContext::new(true, 0);
        collector.begin_request(&ctx.request_id);
        collector.record_model_event(
            &ctx.request_id,
            ModelEventKind::Created,
            &[ModelRef {
                name: "User".to_string(),
                key: json!(1),
            }],
        );

        let _ = build_simple(&aggregator, &ctx);
        assert!(collector.take_model_events(&ctx.request_id).is_empty());
    }

    #[test]
    fn test_empty_tabs_get_hints() {
        let (aggregator, collector, _, _) = aggregator();
        let ctx = TraceContext::new(true, 0);
        collector.begin_request(&ctx.request_id);
        let tabs = build_simple(&aggregator, &ctx);

        let messages = tabs.get("messages").unwrap();
        assert_eq!(messages.title, "Messages");
        match &messages.entries[0].item {
            TabItem::Text(text) => assert_eq!(text, "暂无调试内容"),
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[test]
    fn test_exception_tab_marker_and_priority() {
        let (aggregator, collector, _, capture) = aggregator();
        let ctx = TraceContext::new(true, 0);
        collector.begin_request(&ctx.request_id);
        capture.init_error(&ctx.request_id, CapturedError::new(500, "captured"));

        let attached = CapturedError::new(404, "attached");
        let tabs = aggregator
            .build(
                &ctx,
                &RequestMeta::default(),
                &ResponseMeta::default(),
                Some(&attached),
                None,
                None,
            )
            .unwrap();

        let exception = tabs.get("exception").unwrap();
        assert!(exception.title.ends_with("🔴"));
        // Instance-level capture wins over the response-attached slot.
        match &exception.entries[0].item {
            TabItem::Text(text) => assert_eq!(text, "captured"),
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[test]
    fn test_attached_error_used_when_no_capture() {
        let (aggregator, collector, _, _) = aggregator();
        let ctx = TraceContext::new(true, 0);
        collector.begin_request(&ctx.request_id);

        let attached = CapturedError::new(404, "attached");
        let tabs = aggregator
            .build(
                &ctx,
                &RequestMeta::default(),
                &ResponseMeta::default(),
                Some(&attached),
                None,
                None,
            )
            .unwrap();

        let exception = tabs.get("exception").unwrap();
        match &exception.entries[0].item {
            TabItem::Text(text) => assert_eq!(text, "attached"),
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[test]
    fn test_end_hook_error_omits_trace() {
        let (mut aggregator, collector, _, _) = aggregator();
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = calls.clone();
        aggregator.set_end_hook(Arc::new(move |_tabs| {
            hook_calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("downstream store rejected the trace")
        }));

        let ctx = TraceContext::new(true, 0);
        collector.begin_request(&ctx.request_id);
        let result = aggregator.build(
            &ctx,
            &RequestMeta::default(),
            &ResponseMeta::default(),
            None,
            None,
            None,
        );
        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_route_entries_with_info() {
        let (aggregator, _, _, _) = aggregator();
        let req = RequestMeta {
            method: "GET".to_string(),
            path: "users/42".to_string(),
            matched_path: Some("/users/:id".to_string()),
            ..Default::default()
        };
        let info = RouteInfo {
            controller: Some("UserController::show".to_string()),
            params: vec![crate::context::RouteParam::model("User", "id", 42)],
            middleware: vec!["auth".to_string(), "throttle".to_string()],
            ..Default::default()
        };

        let entries = aggregator.route_entries(&req, Some(&info));
        assert!(matches!(&entries[0].item, TabItem::Text(t) if t == "GET /users/:id"));
        let middleware = entries
            .iter()
            .find(|e| e.label.as_deref() == Some("middleware"))
            .unwrap();
        assert!(matches!(&middleware.item, TabItem::Text(t) if t == "auth, throttle"));
        let params = entries
            .iter()
            .find(|e| e.label.as_deref() == Some("params"))
            .unwrap();
        assert!(matches!(&params.item, TabItem::Json(Value::Array(a)) if a[0] == json!("User:[id:42]")));
    }

    #[test]
    fn test_scalar_text_conventions() {
        assert_eq!(scalar_text(&json!("x")), "x");
        assert_eq!(scalar_text(&json!("")), "''");
        assert_eq!(scalar_text(&Value::Null), "NULL");
        assert_eq!(scalar_text(&json!(true)), "TRUE");
        assert_eq!(scalar_text(&json!(1.5)), "1.5");
    }
}
