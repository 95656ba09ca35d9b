//! Embedded panel assets
//!
//! The stylesheet and client script are compiled into the binary and
//! served from fixed routes with long-lived caching, so the overlay needs
//! no filesystem access at runtime.

use crate::inject::{ASSET_CSS_PATH, ASSET_JS_PATH};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::{Duration, Utc};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const TRACE_CSS: &str = include_str!("../assets/trace.css");
const TRACE_JS: &str = include_str!("../assets/trace.js");

const ONE_YEAR_SECONDS: i64 = 31_536_000;

/// Router serving the panel assets. Merge into the host application's
/// router; the paths match what the injector writes into responses.
pub fn asset_router() -> Router {
    Router::new()
        .route(ASSET_CSS_PATH, get(serve_css))
        .route(ASSET_JS_PATH, get(serve_js))
}

async fn serve_css(headers: HeaderMap) -> Response {
    serve_asset(TRACE_CSS, "text/css; charset=utf-8", &headers)
}

async fn serve_js(headers: HeaderMap) -> Response {
    serve_asset(TRACE_JS, "application/javascript; charset=utf-8", &headers)
}

/// Immutable content with a strong ETag: a matching `If-None-Match` gets
/// 304 with no body, everything else gets the asset plus one year of
/// cache headers.
fn serve_asset(content: &'static str, content_type: &'static str, headers: &HeaderMap) -> Response {
    let etag = format!("\"{}\"", content_hash(content));

    let not_modified = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == etag || v == "*");
    if not_modified {
        return (
            StatusCode::NOT_MODIFIED,
            [(header::ETAG, etag)],
        )
            .into_response();
    }

    let expires = (Utc::now() + Duration::seconds(ONE_YEAR_SECONDS))
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CACHE_CONTROL,
                format!("public, max-age={}, immutable", ONE_YEAR_SECONDS),
            ),
            (header::EXPIRES, expires),
            (header::ETAG, etag),
        ],
        content,
    )
        .into_response()
}

fn content_hash(content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
