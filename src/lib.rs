pub mod aggregator;
pub mod assets;
pub mod capture;
pub mod collector;
pub mod config;
pub mod context;
pub mod error;
pub mod inject;
pub mod messages;
pub mod middleware;
pub mod system;

pub use aggregator::{EndOfTraceHook, TraceAggregator, TraceTabs};
pub use capture::{CapturedError, ExceptionCapture};
pub use collector::{ConnectionInfo, DbEvent, DbEventBus, EventCollector, ModelEventKind, ModelRef};
pub use config::TraceConfig;
pub use error::TraceError;
pub use messages::{DebugMessage, MessageRecorder};
pub use context::{RequestId, RouteInfo, RouteParam, SessionSnapshot, TraceContext};
pub use middleware::{trace_middleware, TraceState};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging
///
/// Note: This function can only be called once per process. Hosts that
/// already install their own subscriber should skip it.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
