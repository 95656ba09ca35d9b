//! Per-request identity and context
//!
//! Every stateful structure in this crate is partitioned by [`RequestId`].
//! The identity is minted once per request by the middleware and threaded
//! explicitly through every collector call; there is no ambient
//! "current request" global.

use serde::Serialize;
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// Opaque per-request identity, used only as a map key.
///
/// Stable for the lifetime of one request; collision probability within one
/// process uptime is negligible (UUID v4).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn mint() -> Self {
        Self(format!("trace_{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request-scoped trace context, created by the middleware and inserted
/// into the request extensions so application code can reach the recorder.
#[derive(Clone, Debug)]
pub struct TraceContext {
    pub request_id: RequestId,
    pub started: Instant,
    /// Process RSS at request start, for the memory-delta line.
    pub start_memory: u64,
    /// False when tracing is off for this request; recorders no-op.
    pub enabled: bool,
}

impl TraceContext {
    pub fn new(enabled: bool, start_memory: u64) -> Self {
        Self {
            request_id: RequestId::mint(),
            started: Instant::now(),
            start_memory,
            enabled,
        }
    }
}

/// Session key/value snapshot the host may attach to its response
/// extensions. Absent or empty means the Session tab shows its
/// empty-state hint.
#[derive(Clone, Debug, Default)]
pub struct SessionSnapshot {
    pub id: Option<String>,
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// Handler source span for editor links on the Route tab.
#[derive(Clone, Debug, Serialize)]
pub struct SourceLocation {
    pub file: String,
    pub line_start: u32,
    pub line_end: u32,
}

/// Route parameter as displayed on the Route tab.
///
/// Route-bound model objects are serialized as `Type:[key:value]` rather
/// than a full dump.
#[derive(Clone, Debug, Serialize)]
pub struct RouteParam(String);

impl RouteParam {
    pub fn plain(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn model(
        type_name: impl AsRef<str>,
        key_name: impl AsRef<str>,
        key_value: impl fmt::Display,
    ) -> Self {
        Self(format!(
            "{}:[{}:{}]",
            type_name.as_ref(),
            key_name.as_ref(),
            key_value
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Resolved route metadata the host may attach to its response extensions.
///
/// The middleware already picks up the matched path pattern on its own;
/// everything here is optional enrichment.
#[derive(Clone, Debug, Default)]
pub struct RouteInfo {
    /// Handler name, e.g. `UserController::show`.
    pub controller: Option<String>,
    /// Handler source span; omitted when the handler cannot be resolved.
    pub source: Option<SourceLocation>,
    pub params: Vec<RouteParam>,
    pub middleware: Vec<String>,
    pub action: Option<String>,
}

/// Request snapshot taken by the middleware before the inner service runs.
#[derive(Clone, Debug, Default)]
pub struct RequestMeta {
    pub method: String,
    pub full_url: String,
    /// Path without the leading slash, e.g. `api/users/1`.
    pub path: String,
    pub host: String,
    pub ip: String,
    pub expects_json: bool,
    pub query: Vec<(String, String)>,
    /// Parsed JSON/form body parameters, when the body was parseable.
    pub body_params: serde_json::Map<String, serde_json::Value>,
    pub headers: Vec<(String, String)>,
    /// Matched route pattern, e.g. `/users/:id`.
    pub matched_path: Option<String>,
}

impl RequestMeta {
    pub fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }

    pub fn is_api(&self) -> bool {
        self.path.starts_with("api/") || self.path == "api"
    }

    /// Module owning this request, lowercased; `app` when none applies.
    ///
    /// When the first URL segment equals the configured module namespace
    /// (e.g. `modules/admin/users` with namespace `modules`), the module
    /// is the segment after it; otherwise the first segment itself.
    pub fn module_name(&self, namespace: &str) -> String {
        let mut segments = self.path.split('/').filter(|s| !s.is_empty());
        match segments.next() {
            Some(first) if first.eq_ignore_ascii_case(namespace) => segments
                .next()
                .map(|s| s.to_lowercase())
                .unwrap_or_else(|| "app".to_string()),
            Some(first) => first.to_lowercase(),
            None => "app".to_string(),
        }
    }
}

/// Response snapshot handed to the aggregator.
#[derive(Clone, Debug, Default)]
pub struct ResponseMeta {
    pub status: u16,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        let a = RequestId::mint();
        let b = RequestId::mint();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("trace_"));
    }

    #[test]
    fn test_route_param_model_format() {
        let param = RouteParam::model("User", "id", 42);
        assert_eq!(param.as_str(), "User:[id:42]");
    }

    #[test]
    fn test_context_carries_enabled_flag() {
        let ctx = TraceContext::new(false, 0);
        assert!(!ctx.enabled);
        assert!(ctx.request_id.as_str().len() > "trace_".len());
    }

    #[test]
    fn test_module_name_from_path() {
        let meta = RequestMeta {
            path: "admin/users/1".to_string(),
            ..Default::default()
        };
        assert_eq!(meta.module_name("modules"), "admin");

        let meta = RequestMeta::default();
        assert_eq!(meta.module_name("modules"), "app");
    }

    #[test]
    fn test_module_name_skips_namespace_segment() {
        let meta = RequestMeta {
            path: "modules/Admin/users".to_string(),
            ..Default::default()
        };
        assert_eq!(meta.module_name("modules"), "admin");

        // A bare namespace path has no module behind it.
        let meta = RequestMeta {
            path: "modules".to_string(),
            ..Default::default()
        };
        assert_eq!(meta.module_name("modules"), "app");
    }

    #[test]
    fn test_is_api() {
        let meta = RequestMeta {
            path: "api/users".to_string(),
            ..Default::default()
        };
        assert!(meta.is_api());

        let meta = RequestMeta {
            path: "apiary".to_string(),
            ..Default::default()
        };
        assert!(!meta.is_api());
    }
}
