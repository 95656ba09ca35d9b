use crate::error::TraceError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TraceConfig {
    /// Hard override: `Some(true)`/`Some(false)` wins over every other check.
    /// When unset, tracing is on outside production (or when `debug` is on).
    #[serde(default)]
    pub enabled: Option<bool>,

    /// Debug mode: renders the verbose exception page and forces tracing on
    /// even in production.
    #[serde(default)]
    pub debug: bool,

    /// Deployment environment name, e.g. "local" or "production".
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Editor URL scheme used for `{editor}://open?file=...&line=...` links.
    #[serde(default = "default_editor")]
    pub editor: String,

    /// First URL segment namespace used to look up module-specific
    /// exception handlers.
    #[serde(default = "default_module_namespace")]
    pub module_namespace: String,

    #[serde(default = "default_app_name")]
    pub app_name: String,

    #[serde(default)]
    pub app_url: String,

    #[serde(default = "default_locale")]
    pub locale: String,

    /// Database connection descriptor shown on the Base tab. The overlay
    /// never talks to the database itself; the host describes its primary
    /// connection here.
    #[serde(default)]
    pub db: Option<DbInfo>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DbInfo {
    pub driver: String,
    pub host: String,
    pub database: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub charset: String,
}

fn default_environment() -> String {
    "local".to_string()
}

fn default_editor() -> String {
    "vscode".to_string()
}

fn default_module_namespace() -> String {
    "modules".to_string()
}

fn default_app_name() -> String {
    "app".to_string()
}

fn default_locale() -> String {
    "en".to_string()
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            debug: false,
            environment: default_environment(),
            editor: default_editor(),
            module_namespace: default_module_namespace(),
            app_name: default_app_name(),
            app_url: String::new(),
            locale: default_locale(),
            db: None,
        }
    }
}

/// Load configuration from `trace.{toml,yaml,json}` (optional) plus
/// `TRACE__*` environment variables.
pub fn load_config() -> Result<TraceConfig, TraceError> {
    let config = config::Config::builder()
        .add_source(config::File::with_name("trace").required(false))
        .add_source(config::Environment::with_prefix("TRACE").separator("__"))
        .build()?;

    let cfg: TraceConfig = config
        .try_deserialize()
        .map_err(TraceError::from)?;
    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &TraceConfig) -> Result<(), TraceError> {
    if cfg.environment.is_empty() {
        return Err(TraceError::Config("environment must not be empty".to_string()));
    }

    if cfg.editor.is_empty() {
        return Err(TraceError::Config("editor scheme must not be empty".to_string()));
    }

    Ok(())
}

impl TraceConfig {
    /// Whether tracing is on at all for this deployment. Request-level
    /// filtering (JSON expectations, static assets) happens in the
    /// middleware on top of this.
    pub fn tracing_allowed(&self) -> bool {
        if let Some(enabled) = self.enabled {
            return enabled;
        }
        self.environment != "production" || self.debug
    }
}
