//! Request middleware
//!
//! The middleware owns the whole per-request lifecycle: decide whether the
//! request is traced, mint the identity, open the partitions, run the inner
//! service, aggregate, inject, and always evict. Apply it with
//! `axum::middleware::from_fn_with_state`.

use crate::aggregator::{EndOfTraceHook, TraceAggregator};
use crate::capture::{CapturedError, ExceptionCapture};
use crate::collector::{DbEventBus, EventCollector};
use crate::config::TraceConfig;
use crate::context::{RequestMeta, ResponseMeta, RouteInfo, SessionSnapshot, TraceContext};
use crate::inject;
use crate::messages::MessageRecorder;
use axum::body::{to_bytes, Body};
use axum::extract::{MatchedPath, Request, State};
use axum::http::{header, HeaderMap, Method};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Largest request body the middleware will buffer for the Request tab.
const MAX_REQUEST_BODY: usize = 64 * 1024;

/// Largest response body the middleware will buffer for injection.
const MAX_RESPONSE_BODY: usize = 8 * 1024 * 1024;

/// Extensions of typical static assets; requests for these are never traced.
const STATIC_EXTENSIONS: &[&str] = &[
    "css", "js", "map", "ico", "png", "jpg", "jpeg", "gif", "svg", "webp", "avif", "bmp", "woff",
    "woff2", "ttf", "eot", "otf", "mp4", "mp3", "wav", "avi", "webm", "pdf", "zip", "rar", "7z",
    "gz", "tar", "txt", "xml",
];

/// Path prefixes that serve generated images (captcha and friends).
const SKIPPED_PREFIXES: &[&str] = &["captcha/", "tn_code/"];

/// Shared handles for the overlay, cloned into the middleware layer.
#[derive(Clone)]
pub struct TraceState {
    pub config: TraceConfig,
    pub collector: Arc<EventCollector>,
    pub recorder: Arc<MessageRecorder>,
    pub capture: Arc<ExceptionCapture>,
    aggregator: Arc<TraceAggregator>,
}

impl TraceState {
    pub fn new(config: TraceConfig) -> Self {
        let collector = Arc::new(EventCollector::new());
        let recorder = Arc::new(MessageRecorder::new());
        let capture = Arc::new(ExceptionCapture::new());
        let aggregator = Arc::new(TraceAggregator::new(
            collector.clone(),
            recorder.clone(),
            capture.clone(),
            config.clone(),
        ));

        Self {
            config,
            collector,
            recorder,
            capture,
            aggregator,
        }
    }

    /// Install a hook that observes every finished trace before rendering.
    /// A hook error drops the panel for that response, nothing else.
    pub fn with_end_hook(mut self, hook: EndOfTraceHook) -> Self {
        let mut aggregator = TraceAggregator::new(
            self.collector.clone(),
            self.recorder.clone(),
            self.capture.clone(),
            self.config.clone(),
        );
        aggregator.set_end_hook(hook);
        self.aggregator = Arc::new(aggregator);
        self
    }

    /// Subscribe the collector to the host's database event bus. Safe to
    /// call more than once.
    pub fn attach_bus(&self, bus: &DbEventBus) {
        self.collector.register_listeners(bus);
    }

    /// Start the background sweep that evicts partitions of requests whose
    /// termination never ran.
    pub fn start_sweeper(&self, period: Duration, max_age: Duration) {
        self.collector.spawn_sweeper(period, max_age);
    }
}

/// The trace middleware.
///
/// Untraced requests (tracing disabled, static assets, panel assets, or a
/// request already wrapped by an outer trace layer) pass through untouched.
pub async fn trace_middleware(
    State(state): State<TraceState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().trim_start_matches('/').to_string();

    if request.extensions().get::<TraceContext>().is_some() {
        // Already traced by an outer layer.
        return next.run(request).await;
    }
    if path.starts_with("__trace/") || is_static_path(&path) {
        return next.run(request).await;
    }
    // GET callers that want JSON get neither injection nor a side channel,
    // so skip collection entirely for them.
    if request.method() == Method::GET && expects_json(request.headers()) {
        return next.run(request).await;
    }
    if !state.config.tracing_allowed() {
        let mut request = request;
        request.extensions_mut().insert(TraceContext::new(false, 0));
        return next.run(request).await;
    }

    let ctx = TraceContext::new(true, crate::system::current_memory());
    let (mut meta, request) = snapshot_request(request, &path, &state.config.app_url).await;
    meta.matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string());

    let mut request = request;
    request.extensions_mut().insert(ctx.clone());
    state.collector.begin_request(&ctx.request_id);

    let response = next.run(request).await;
    let response = finalize(&state, &ctx, &meta, response).await;

    state.collector.evict(&ctx.request_id);
    state.recorder.evict(&ctx.request_id);
    state.capture.clear_request_exceptions(&ctx.request_id);

    response
}

/// Aggregate and inject. Any bail-out path returns the response unchanged;
/// eviction happens in the caller either way.
async fn finalize(
    state: &TraceState,
    ctx: &TraceContext,
    meta: &RequestMeta,
    response: Response,
) -> Response {
    let resp_meta = snapshot_response(&response);
    let is_html = resp_meta.content_type.contains("text/html");

    // Non-GET responses are probed for a JSON object body regardless of
    // the declared content type.
    let wants_injection = meta.is_get() && is_html;
    let wants_side_channel = !meta.is_get();
    if !wants_injection && !wants_side_channel {
        return response;
    }
    if resp_meta.content_type.contains("text/event-stream") {
        return response;
    }

    let content_length = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if content_length.is_some_and(|len| len > MAX_RESPONSE_BODY) {
        return response;
    }

    let attached = response.extensions().get::<CapturedError>().cloned();
    let route = response.extensions().get::<RouteInfo>().cloned();
    let session = response.extensions().get::<SessionSnapshot>().cloned();

    let Some(tabs) = state
        .aggregator
        .build(ctx, meta, &resp_meta, attached.as_ref(), route.as_ref(), session.as_ref())
    else {
        return response;
    };

    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, MAX_RESPONSE_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(request_id = %ctx.request_id, error = %e, "response body not bufferable, skipping trace");
            return Response::from_parts(parts, Body::empty());
        }
    };
    if bytes.is_empty() {
        return Response::from_parts(parts, Body::from(bytes));
    }

    let Ok(content) = std::str::from_utf8(&bytes) else {
        return Response::from_parts(parts, Body::from(bytes));
    };

    let panel = inject::render_panel(&tabs, &state.config);
    let new_body = if wants_injection {
        Some(inject::inject_into_html(content, &panel))
    } else {
        inject::merge_debugger_field(content, &panel)
    };

    match new_body {
        Some(new_body) => {
            parts.headers.remove(header::CONTENT_LENGTH);
            Response::from_parts(parts, Body::from(new_body))
        }
        None => Response::from_parts(parts, Body::from(bytes)),
    }
}

/// Snapshot everything needed from the request before the inner service
/// consumes it, buffering small JSON/form bodies for the Request tab.
/// `app_url` reconstructs the full URL when no Host header arrived.
async fn snapshot_request(request: Request, path: &str, app_url: &str) -> (RequestMeta, Request) {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = request.headers().clone();

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let full_url = if !host.is_empty() {
        format!("http://{}{}", host, uri)
    } else if !app_url.is_empty() {
        format!("{}{}", app_url.trim_end_matches('/'), uri)
    } else {
        uri.to_string()
    };

    let query = uri
        .query()
        .map(parse_query)
        .unwrap_or_default();

    let header_pairs: Vec<(String, String)> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    let (body_params, request) = buffer_body_params(request, &method, &headers).await;

    let meta = RequestMeta {
        method: method.to_string(),
        full_url,
        path: path.to_string(),
        host,
        ip: client_ip(&headers),
        expects_json: expects_json(&headers),
        query,
        body_params,
        headers: header_pairs,
        matched_path: None,
    };

    (meta, request)
}

/// Buffer and parse a small JSON or form body, handing an equivalent
/// request back to the caller. Oversized or non-parameter bodies pass
/// through without buffering.
async fn buffer_body_params(
    request: Request,
    method: &Method,
    headers: &HeaderMap,
) -> (serde_json::Map<String, serde_json::Value>, Request) {
    let empty = serde_json::Map::new();
    if method == Method::GET || method == Method::HEAD {
        return (empty, request);
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let is_json = content_type.contains("json");
    let is_form = content_type.contains("application/x-www-form-urlencoded");
    if !is_json && !is_form {
        return (empty, request);
    }

    let too_large = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .is_some_and(|len| len > MAX_REQUEST_BODY);
    if too_large {
        return (empty, request);
    }

    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (empty, Request::from_parts(parts, Body::empty()));
        }
    };

    let params = if is_json {
        serde_json::from_slice::<serde_json::Value>(&bytes)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default()
    } else {
        std::str::from_utf8(&bytes)
            .map(|text| {
                parse_query(text)
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect()
            })
            .unwrap_or_default()
    };

    (params, Request::from_parts(parts, Body::from(bytes)))
}

fn snapshot_response(response: &Response) -> ResponseMeta {
    ResponseMeta {
        status: response.status().as_u16(),
        content_type: response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        headers: response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(component: &str) -> String {
    let component = component.replace('+', " ");
    urlencoding::decode(&component)
        .map(|s| s.into_owned())
        .unwrap_or(component)
}

fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

fn expects_json(headers: &HeaderMap) -> bool {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if accept.contains("/json") || accept.contains("+json") {
        return true;
    }
    headers
        .get("x-requested-with")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
}

/// Static asset request, by extension or generated-image prefix.
fn is_static_path(path: &str) -> bool {
    if SKIPPED_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return true;
    }
    match path.rsplit('.').next() {
        Some(ext) if ext != path => STATIC_EXTENSIONS.contains(&ext.to_lowercase().as_str()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_path_detection() {
        assert!(is_static_path("favicon.ico"));
        assert!(is_static_path("build/app.CSS"));
        assert!(is_static_path("captcha/img"));
        assert!(is_static_path("tn_code/check"));
        assert!(!is_static_path("users/1"));
        assert!(!is_static_path("api/export.csv.generate"));
        assert!(!is_static_path("plainpath"));
    }

    #[test]
    fn test_parse_query_decodes_components() {
        let pairs = parse_query("name=J%C3%BCrgen&page=2&flag&q=a+b");
        assert_eq!(pairs[0], ("name".to_string(), "Jürgen".to_string()));
        assert_eq!(pairs[1], ("page".to_string(), "2".to_string()));
        assert_eq!(pairs[2], ("flag".to_string(), String::new()));
        assert_eq!(pairs[3], ("q".to_string(), "a b".to_string()));
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.1.2.3, 172.16.0.1".parse().unwrap());
        headers.insert("x-real-ip", "192.168.0.9".parse().unwrap());
        assert_eq!(client_ip(&headers), "10.1.2.3");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "192.168.0.9".parse().unwrap());
        assert_eq!(client_ip(&headers), "192.168.0.9");

        assert_eq!(client_ip(&HeaderMap::new()), "127.0.0.1");
    }

    #[test]
    fn test_expects_json() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, "application/json".parse().unwrap());
        assert!(expects_json(&headers));

        let mut headers = HeaderMap::new();
        headers.insert("x-requested-with", "XMLHttpRequest".parse().unwrap());
        assert!(expects_json(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, "text/html".parse().unwrap());
        assert!(!expects_json(&headers));
    }

    #[tokio::test]
    async fn test_snapshot_request_meta() {
        let request = Request::builder()
            .method("GET")
            .uri("/users/1?page=2")
            .header(header::HOST, "example.test")
            .body(Body::empty())
            .unwrap();

        let (meta, _request) = snapshot_request(request, "users/1", "").await;
        assert_eq!(meta.method, "GET");
        assert_eq!(meta.path, "users/1");
        assert_eq!(meta.host, "example.test");
        assert_eq!(meta.full_url, "http://example.test/users/1?page=2");
        assert_eq!(meta.query, vec![("page".to_string(), "2".to_string())]);
        assert!(meta.body_params.is_empty());
    }

    #[tokio::test]
    async fn test_app_url_fallback_when_no_host_header() {
        let request = Request::builder()
            .method("GET")
            .uri("/users/1")
            .body(Body::empty())
            .unwrap();

        let (meta, _request) = snapshot_request(request, "users/1", "https://app.test/").await;
        assert_eq!(meta.full_url, "https://app.test/users/1");
    }

    #[tokio::test]
    async fn test_body_params_parsed_and_body_preserved() {
        let request = Request::builder()
            .method("POST")
            .uri("/users")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"name\":\"alice\"}"))
            .unwrap();

        let (meta, request) = snapshot_request(request, "users", "").await;
        assert_eq!(meta.body_params["name"], serde_json::json!("alice"));

        let bytes = to_bytes(request.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"{\"name\":\"alice\"}");
    }

    #[tokio::test]
    async fn test_form_body_params() {
        let request = Request::builder()
            .method("POST")
            .uri("/login")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("user=bob&pass=secret%21"))
            .unwrap();

        let (meta, _request) = snapshot_request(request, "login", "").await;
        assert_eq!(meta.body_params["user"], serde_json::json!("bob"));
        assert_eq!(meta.body_params["pass"], serde_json::json!("secret!"));
    }
}
