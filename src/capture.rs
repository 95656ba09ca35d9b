//! Exception capture and deduplicated reporting
//!
//! A small state machine per request: an error is captured
//! (`init_error`), optionally reported (side-effecting log write, once),
//! and finally rendered. Two hash sets keep reporting sane: a global
//! bounded set stops the same recurring error from spamming the log
//! across requests, and a request-scoped set stops the same error
//! instance from being processed twice within one report→render cycle.
//! The request-scoped set must be evicted when the request ends.

use crate::config::TraceConfig;
use crate::context::{RequestId, RequestMeta};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use serde_json::json;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::error;

/// Soft cap on the global reported-hash set.
const MAX_REPORTED_EXCEPTIONS: usize = 100;

/// Entries older than this are evicted from the global set.
const REPORTED_TTL: Duration = Duration::from_secs(3600);

/// A captured error, ready for display.
///
/// This is the typed slot hosts attach to `Response::extensions` when an
/// error response is synthesized outside the normal report path.
#[derive(Debug, Clone, Serialize)]
pub struct CapturedError {
    pub type_name: String,
    pub message: String,
    pub file: String,
    pub line: u32,
    pub status: u16,
    /// Rendered error chain / backtrace text, when available.
    pub detail: Option<String>,
}

impl CapturedError {
    /// Capture an ad-hoc error at the call site (the `abort(code)` path).
    #[track_caller]
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        let location = Location::caller();
        Self {
            type_name: "HttpError".to_string(),
            message: message.into(),
            file: location.file().to_string(),
            line: location.line(),
            status,
            detail: None,
        }
    }

    /// Capture a concrete error value, recording its source chain.
    #[track_caller]
    pub fn from_error<E: std::error::Error + ?Sized>(err: &E, status: u16) -> Self {
        let location = Location::caller();
        let mut detail = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            detail.push_str("\ncaused by: ");
            detail.push_str(&cause.to_string());
            source = cause.source();
        }

        Self {
            type_name: std::any::type_name::<E>()
                .rsplit("::")
                .next()
                .unwrap_or("Error")
                .to_string(),
            message: err.to_string(),
            file: location.file().to_string(),
            line: location.line(),
            status,
            detail: Some(detail),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Hash identifying this error across requests.
    fn global_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.type_name.hash(&mut hasher);
        self.file.hash(&mut hasher);
        self.line.hash(&mut hasher);
        self.message.hash(&mut hasher);
        self.status.hash(&mut hasher);
        hasher.finish()
    }

    /// Hash identifying this error within one request.
    fn request_hash(&self, id: &RequestId) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.type_name.hash(&mut hasher);
        self.file.hash(&mut hasher);
        self.line.hash(&mut hasher);
        id.as_str().hash(&mut hasher);
        hasher.finish()
    }
}

/// User-registered callback keyed by HTTP status code. Returning `None`
/// falls through to the next rendering strategy.
pub type StatusCallback =
    Arc<dyn Fn(&CapturedError, &RequestMeta) -> Option<Response> + Send + Sync>;

/// Module-specific exception handler, looked up by the first URL segment.
pub type ModuleHandler =
    Arc<dyn Fn(&CapturedError, &RequestMeta) -> Option<Response> + Send + Sync>;

/// Process-wide capture state; all per-request entries are keyed by
/// [`RequestId`] and evicted by [`ExceptionCapture::clear_request_exceptions`].
pub struct ExceptionCapture {
    /// Latest captured error per request; overwritten on repeated capture.
    current: DashMap<RequestId, CapturedError>,
    /// Global reported-hash set: hash → time of report.
    reported: Mutex<HashMap<u64, Instant>>,
    /// Request-scoped seen-hash sets.
    request_seen: DashMap<RequestId, HashSet<u64>>,
    /// Requests currently inside `render`, to break recursion.
    rendering: DashSet<RequestId>,
    /// Error type names that are never report-worthy.
    dont_report: RwLock<Vec<String>>,
    status_callback: RwLock<Option<(StatusCallback, Vec<u16>)>>,
    module_handlers: RwLock<HashMap<String, ModuleHandler>>,
}

impl ExceptionCapture {
    pub fn new() -> Self {
        Self {
            current: DashMap::new(),
            reported: Mutex::new(HashMap::new()),
            request_seen: DashMap::new(),
            rendering: DashSet::new(),
            dont_report: RwLock::new(Vec::new()),
            status_callback: RwLock::new(None),
            module_handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a callback invoked first during rendering. `codes` limits
    /// it to the given status codes; empty means all.
    pub fn set_status_callback(&self, callback: StatusCallback, codes: Vec<u16>) {
        *self.status_callback.write().unwrap_or_else(|e| e.into_inner()) =
            Some((callback, codes));
    }

    /// Register a module-specific handler, keyed by lowercased module name.
    pub fn register_module_handler(&self, module: impl Into<String>, handler: ModuleHandler) {
        self.module_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(module.into().to_lowercase(), handler);
    }

    /// Error type names whose report side effect is suppressed.
    pub fn set_dont_report(&self, type_names: Vec<String>) {
        *self.dont_report.write().unwrap_or_else(|e| e.into_inner()) = type_names;
    }

    /// Record the current error for a request. May be called repeatedly;
    /// the latest capture always wins.
    pub fn init_error(&self, id: &RequestId, err: CapturedError) {
        self.current.insert(id.clone(), err);
    }

    /// The captured error for a request, if any.
    pub fn current(&self, id: &RequestId) -> Option<CapturedError> {
        self.current.get(id).map(|e| e.value().clone())
    }

    /// Report an error. Returns true when the side-effecting log write ran.
    ///
    /// Idempotent per request: a second report of the same error for the
    /// same identity is a complete no-op. A matching un-expired entry in
    /// the global set skips the log write but still marks the error as
    /// seen for this request, so rendering proceeds normally.
    pub fn report(&self, id: &RequestId, err: &CapturedError) -> bool {
        let request_hash = err.request_hash(id);
        if self
            .request_seen
            .get(id)
            .is_some_and(|set| set.contains(&request_hash))
        {
            return false;
        }

        self.init_error(id, err.clone());
        self.request_seen
            .entry(id.clone())
            .or_default()
            .insert(request_hash);

        if self
            .dont_report
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|t| t == &err.type_name)
        {
            return false;
        }

        let global_hash = err.global_hash();
        let mut reported = self.reported.lock().unwrap_or_else(|e| e.into_inner());
        cleanup_reported(&mut reported);

        if let Some(at) = reported.get(&global_hash) {
            if at.elapsed() < REPORTED_TTL {
                return false;
            }
        }
        reported.insert(global_hash, Instant::now());
        drop(reported);

        error!(
            request_id = %id,
            error_type = %err.type_name,
            file = %err.file,
            line = err.line,
            status = err.status,
            "{}",
            err.message
        );
        true
    }

    /// Render an error response.
    ///
    /// Strategy order: status-code callback, module handler, verbose debug
    /// page (debug mode), production JSON/HTML. Guarded against recursion:
    /// re-entry for the same request short-circuits to the plain fallback.
    pub fn render(
        &self,
        id: &RequestId,
        err: &CapturedError,
        req: &RequestMeta,
        config: &TraceConfig,
    ) -> Response {
        if !self.rendering.insert(id.clone()) {
            return fallback_response(err);
        }

        // abort()-style paths reach render without ever reporting.
        if !self.current.contains_key(id) {
            self.init_error(id, err.clone());
        }

        let response = self.render_inner(err, req, config);
        self.rendering.remove(id);
        response
    }

    fn render_inner(&self, err: &CapturedError, req: &RequestMeta, config: &TraceConfig) -> Response {
        if let Some((callback, codes)) =
            self.status_callback.read().unwrap_or_else(|e| e.into_inner()).as_ref()
        {
            if codes.is_empty() || codes.contains(&err.status) {
                if let Some(response) = callback(err, req) {
                    return response;
                }
            }
        }

        let module = req.module_name(&config.module_namespace);
        if let Some(handler) = self
            .module_handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&module)
        {
            if let Some(response) = handler(err, req) {
                return response;
            }
        }

        if config.debug {
            return debug_page(err, config);
        }

        if req.is_api() || !req.is_get() || req.expects_json {
            let body = json!({ "message": err.message, "code": err.status });
            return (err.status_code(), axum::Json(body)).into_response();
        }

        production_page(err, config)
    }

    /// Purge every request-scoped entry for this identity. Must run when
    /// the request terminates or the sets grow for the process lifetime.
    pub fn clear_request_exceptions(&self, id: &RequestId) {
        self.current.remove(id);
        self.request_seen.remove(id);
        self.rendering.remove(id);
    }

    /// Number of entries in the global reported set (for monitoring).
    pub fn reported_count(&self) -> usize {
        self.reported.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether any request-scoped state remains for this identity.
    pub fn has_request_state(&self, id: &RequestId) -> bool {
        self.current.contains_key(id)
            || self.request_seen.contains_key(id)
            || self.rendering.contains(id)
    }
}

impl Default for ExceptionCapture {
    fn default() -> Self {
        Self::new()
    }
}

/// Time-evict and half-truncate the global reported set.
fn cleanup_reported(reported: &mut HashMap<u64, Instant>) {
    reported.retain(|_, at| at.elapsed() < REPORTED_TTL);

    if reported.len() > MAX_REPORTED_EXCEPTIONS {
        let mut entries: Vec<(u64, Instant)> = reported.drain().collect();
        entries.sort_by_key(|(_, at)| *at);
        let keep = MAX_REPORTED_EXCEPTIONS / 2;
        reported.extend(entries.into_iter().rev().take(keep));
    }
}

fn fallback_response(err: &CapturedError) -> Response {
    (err.status_code(), err.message.clone()).into_response()
}

/// Verbose debug page shown when debug mode is on. Never used in
/// production contexts.
fn debug_page(err: &CapturedError, config: &TraceConfig) -> Response {
    let editor_link = format!(
        "{}://open?file={}&line={}",
        config.editor,
        urlencoding::encode(&err.file),
        err.line
    );
    let mut rows = String::new();
    rows.push_str(&format!(
        "<li class=\"info-item\"><span class=\"info-label\">message</span><div class=\"info-value\">{}</div></li>",
        html_escape::encode_text(&err.message)
    ));
    rows.push_str(&format!(
        "<li class=\"info-item\"><span class=\"info-label\">file</span><div class=\"info-value\"><a href=\"{}\" class=\"trace-link\">{}#{}</a></div></li>",
        html_escape::encode_double_quoted_attribute(&editor_link),
        html_escape::encode_text(&err.file),
        err.line
    ));
    rows.push_str(&format!(
        "<li class=\"info-item\"><span class=\"info-label\">code</span><div class=\"info-value\">{}</div></li>",
        err.status
    ));
    if let Some(detail) = &err.detail {
        rows.push_str(&format!(
            "<li class=\"info-item\"><span class=\"info-label\">exception</span><div class=\"info-value\"><pre><code>{}</code></pre></div></li>",
            html_escape::encode_text(detail)
        ));
    }

    let html = format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"UTF-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n\
         <title>{title} | {app}</title>\n\
         <style>\n\
         * {{ margin: 0; padding: 0; box-sizing: border-box; }}\n\
         body {{ font-family: sans-serif; line-height: 1.6; color: #333; background: linear-gradient(135deg, #0f0c29, #302b63, #24243e); padding: 20px; min-height: 100vh; }}\n\
         .container {{ width: 88%; margin: 0 auto; border-radius: 8px; padding: 30px; }}\n\
         h1 {{ text-align: center; margin-bottom: 30px; color: red; }}\n\
         .info-list {{ list-style: none; }}\n\
         .info-item {{ display: flex; padding: 15px 0; border-bottom: 1px dashed #7f8c8d; align-items: flex-start; }}\n\
         .info-label {{ font-weight: bold; color: #3498db; min-width: 120px; padding-right: 20px; }}\n\
         .info-value {{ flex: 1; word-break: break-word; color: #fff; overflow: auto; }}\n\
         .info-value pre {{ color: #000; border-radius: 4px; padding: 12px; overflow-x: auto; border-left: 3px solid #3498db; margin: 5px 0; background-color: #f8f8f8; }}\n\
         .trace-link {{ color: #03dac6; }}\n\
         </style>\n</head>\n<body>\n\
         <div class=\"container\"><h1>{title}</h1><ul class=\"info-list\">{rows}</ul></div>\n\
         </body>\n</html>",
        title = html_escape::encode_text(&err.type_name),
        app = html_escape::encode_text(&config.app_name),
        rows = rows,
    );

    (
        err.status_code(),
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}

/// Production-safe error page: message and code only, no trace details.
fn production_page(err: &CapturedError, config: &TraceConfig) -> Response {
    let html = format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"UTF-8\">\n<title>{code} | {app}</title>\n\
         <style>body {{ font-family: sans-serif; text-align: center; padding-top: 15vh; color: #444; }} h1 {{ font-size: 48px; }}</style>\n\
         </head>\n<body><h1>{code}</h1><p>{message}</p></body>\n</html>",
        code = err.status,
        app = html_escape::encode_text(&config.app_name),
        message = html_escape::encode_text(&err.message),
    );

    (
        err.status_code(),
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}
