//! Ad-hoc debug message recording
//!
//! Application code calls [`MessageRecorder::add_message`] (usually through
//! a thin host wrapper) to dump values onto the Messages tab together with
//! the call site that produced them.

use crate::context::{RequestId, TraceContext};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::panic::Location;
use std::path::Path;

/// One recorded debug call.
#[derive(Debug, Clone, Serialize)]
pub struct DebugMessage {
    pub value: Value,
    /// `basename#line`, e.g. `foo.rs#42`.
    pub label: String,
    pub file: String,
    pub relative_path: String,
    pub line: u32,
    /// Uppercased kind badge shown on the right, e.g. `DEBUG`.
    pub kind: String,
}

/// Request-partitioned store of debug messages.
pub struct MessageRecorder {
    messages: DashMap<RequestId, Vec<DebugMessage>>,
    /// Workspace root stripped from recorded file paths.
    base_path: String,
}

impl MessageRecorder {
    pub fn new() -> Self {
        Self {
            messages: DashMap::new(),
            base_path: std::env::var("CARGO_MANIFEST_DIR").unwrap_or_default(),
        }
    }

    pub fn with_base_path(base_path: impl Into<String>) -> Self {
        Self {
            messages: DashMap::new(),
            base_path: base_path.into(),
        }
    }

    /// Record a debug value together with its call site.
    ///
    /// The call site comes from `#[track_caller]`; when it points inside a
    /// library path (a vendored dependency or the standard library) there
    /// is no application frame worth showing, so the call is a silent
    /// no-op. Also a no-op when tracing is disabled for the request.
    #[track_caller]
    pub fn add_message(&self, ctx: &TraceContext, value: Value, kind: &str) {
        if !ctx.enabled {
            return;
        }

        let location = Location::caller();
        self.add_message_at(ctx, value, kind, location.file(), location.line());
    }

    /// Location-explicit variant for host wrappers that already resolved
    /// the interesting frame themselves.
    pub fn add_message_at(
        &self,
        ctx: &TraceContext,
        value: Value,
        kind: &str,
        file: &str,
        line: u32,
    ) {
        if !ctx.enabled || is_library_path(file) {
            return;
        }

        let relative_path = self.relative_path(file);
        let basename = Path::new(&relative_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| relative_path.clone());

        self.messages
            .entry(ctx.request_id.clone())
            .or_default()
            .push(DebugMessage {
                value,
                label: format!("{}#{}", basename, line),
                file: file.to_string(),
                relative_path,
                line,
                kind: kind.to_uppercase(),
            });
    }

    /// Read and evict this request's messages.
    pub fn take_messages(&self, id: &RequestId) -> Vec<DebugMessage> {
        self.messages.remove(id).map(|(_, v)| v).unwrap_or_default()
    }

    /// Drop this request's partition without reading it.
    pub fn evict(&self, id: &RequestId) {
        self.messages.remove(id);
    }

    fn relative_path(&self, file: &str) -> String {
        if !self.base_path.is_empty() {
            if let Some(stripped) = file.strip_prefix(&self.base_path) {
                return stripped.trim_start_matches('/').to_string();
            }
        }
        file.to_string()
    }
}

impl Default for MessageRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a source path belongs to a dependency or the toolchain rather
/// than application code.
fn is_library_path(file: &str) -> bool {
    file.contains("/.cargo/") || file.contains("\\.cargo\\") || file.starts_with("/rustc/")
}
