use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;

pub use config::ConfigError;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub capture: CaptureSettings,
    pub forward: ForwardSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
    /// Ordered immediate-response rules; first match wins
    #[serde(default)]
    pub responses: Vec<ResponseRuleSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Listen path prefix under which requests are captured ("/" captures everything)
    pub path_prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureSettings {
    /// Maximum inbound body size in bytes; 0 disables the limit
    pub max_body_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ForwardSettings {
    /// Absolute base URLs each captured request is delivered to
    #[serde(default)]
    pub targets: Vec<String>,
    /// Additional delivery attempts after the first (total = retries + 1)
    pub retries: u32,
    /// Process-wide bound on simultaneous outbound deliveries
    pub max_concurrent: usize,
    /// Per-attempt outbound request timeout in seconds
    pub timeout_secs: u64,
    /// Header names dropped from forwarded requests, on top of the
    /// built-in connection-management set
    #[serde(default)]
    pub header_blacklist: Vec<String>,
    /// When set, only these headers are forwarded (blacklist still applies)
    #[serde(default)]
    pub header_whitelist: Option<Vec<String>>,
    #[serde(default)]
    pub path: PathStrategySettings,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PathStrategySettings {
    /// One of "append", "strip-prefix", "rewrite"
    #[serde(default)]
    pub mode: Option<String>,
    /// Prefix removed from the inbound path in "strip-prefix" mode
    #[serde(default)]
    pub prefix: Option<String>,
    /// Ordered rewrite rules for "rewrite" mode; first match wins
    #[serde(default)]
    pub rules: Vec<RewriteRuleSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RewriteRuleSettings {
    pub name: String,
    #[serde(rename = "match")]
    pub match_pattern: String,
    #[serde(default)]
    pub replacement: Option<String>,
    #[serde(default)]
    pub is_regex: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub database_path: String,
    /// Maximum rows retained in the persistent store; 0 disables the bound
    pub max_records: u64,
    /// Maximum age of persistent rows in hours; 0 disables age-based pruning
    pub retention_hours: u64,
    /// Capacity of the in-memory live ring buffer
    pub live_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResponseRuleSettings {
    pub name: String,
    /// Methods the rule applies to; empty matches any method
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub exact_path: Option<String>,
    #[serde(default)]
    pub path_prefix: Option<String>,
    pub status: u16,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.path_prefix", "/")?
            .set_default("capture.max_body_bytes", 10 * 1024 * 1024)?
            .set_default("forward.retries", 3)?
            .set_default("forward.max_concurrent", 8)?
            .set_default("forward.timeout_secs", 30)?
            .set_default("storage.database_path", "reqtap.db")?
            .set_default("storage.max_records", 10_000)?
            .set_default("storage.retention_hours", 72)?
            .set_default("storage.live_capacity", 200)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "text")?
            // Add configuration file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Add environment variables with prefix
            .add_source(Environment::with_prefix("REQTAP").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new().expect("Failed to load configuration")
    }
}
