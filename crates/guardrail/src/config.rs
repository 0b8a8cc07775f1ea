//! Server configuration from the environment.
//!
//! Every secret-bearing variable supports a `<VAR>_FILE` variant that is
//! read preferentially, so deployments can mount secrets as files.
//! `PRODUCTION_MODE` has no default: the operator must say which world
//! this process runs in. The startup validator refuses wildcard CORS and
//! placeholder-looking secrets in production.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Values that mark a secret as never-configured.
const PLACEHOLDER_MARKERS: &[&str] = &["generate_a_", "change_me", "placeholder", "example"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },

    #[error("failed to read {var}_FILE: {source}")]
    SecretFile {
        var: &'static str,
        source: std::io::Error,
    },
}

/// Token types recognized by the authorization layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Mcp,
    Ide,
    Admin,
}

/// Full server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // Network
    pub mcp_port: u16,
    pub web_port: u16,
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
    pub max_url_bytes: usize,

    // Auth & keys
    pub mcp_api_key: String,
    pub ide_api_key: String,
    pub admin_api_key: Option<String>,
    pub jwt_secret: Option<String>,

    // Database
    pub database_url: String,

    // Cache
    pub redis_url: Option<String>,
    pub enable_cache: bool,

    // TLS
    pub tls_enabled: bool,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub tls_min_version: f32,

    // CORS
    pub cors_allowed_origins: Vec<String>,

    // Rate limits (requests per minute)
    pub rate_limit_mcp: u64,
    pub rate_limit_ide: u64,
    pub rate_limit_session: u64,

    // Cache TTLs
    pub cache_ttl_rules: Duration,
    pub cache_ttl_docs: Duration,
    pub cache_ttl_search: Duration,

    // Modes
    pub production_mode: bool,
    pub enable_metrics: bool,
    pub enable_audit_logging: bool,
    pub trust_proxy: bool,

    // Sessions
    pub session_idle_timeout: Duration,
    pub reply_queue_capacity: usize,

    // Ingestion sources
    pub rule_source_dirs: Vec<PathBuf>,
}

impl Config {
    /// Load from the environment and validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let production_mode = match require("PRODUCTION_MODE")?.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            other => {
                return Err(ConfigError::Invalid {
                    var: "PRODUCTION_MODE",
                    message: format!("expected true/false, got '{}'", other),
                });
            }
        };

        let config = Self {
            mcp_port: parse_or("MCP_PORT", 8787)?,
            web_port: parse_or("WEB_PORT", 8788)?,
            request_timeout: Duration::from_secs(parse_or("REQUEST_TIMEOUT", 30u64)?),
            max_body_bytes: parse_or("MAX_BODY_BYTES", 10 * 1024 * 1024)?,
            max_url_bytes: parse_or("MAX_URL_BYTES", 4096)?,

            mcp_api_key: secret("MCP_API_KEY")?.ok_or(ConfigError::Missing("MCP_API_KEY"))?,
            ide_api_key: secret("IDE_API_KEY")?.ok_or(ConfigError::Missing("IDE_API_KEY"))?,
            admin_api_key: secret("ADMIN_API_KEY")?,
            jwt_secret: secret("JWT_SECRET")?,

            database_url: database_url()?,

            redis_url: redis_url()?,
            enable_cache: parse_or("ENABLE_CACHE", true)?,

            tls_enabled: parse_or("TLS_ENABLED", false)?,
            tls_cert_path: optional("TLS_CERT_PATH").map(PathBuf::from),
            tls_key_path: optional("TLS_KEY_PATH").map(PathBuf::from),
            tls_min_version: parse_or("TLS_MIN_VERSION", if production_mode { 1.3 } else { 1.2 })?,

            cors_allowed_origins: optional("CORS_ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|origin| origin.trim().to_string())
                        .filter(|origin| !origin.is_empty())
                        .collect()
                })
                .unwrap_or_default(),

            rate_limit_mcp: parse_or("RATE_LIMIT_MCP", 60)?,
            rate_limit_ide: parse_or("RATE_LIMIT_IDE", 120)?,
            rate_limit_session: parse_or("RATE_LIMIT_SESSION", 120)?,

            cache_ttl_rules: Duration::from_secs(parse_or("CACHE_TTL_RULES", 300u64)?),
            cache_ttl_docs: Duration::from_secs(parse_or("CACHE_TTL_DOCS", 600u64)?),
            cache_ttl_search: Duration::from_secs(parse_or("CACHE_TTL_SEARCH", 120u64)?),

            production_mode,
            enable_metrics: parse_or("ENABLE_METRICS", true)?,
            enable_audit_logging: parse_or("ENABLE_AUDIT_LOGGING", true)?,
            trust_proxy: parse_or("TRUST_PROXY", false)?,

            session_idle_timeout: Duration::from_secs(parse_or("SESSION_IDLE_TIMEOUT", 3600u64)?),
            reply_queue_capacity: parse_or("REPLY_QUEUE_CAPACITY", 256)?,

            rule_source_dirs: optional("RULE_SOURCE_DIRS")
                .map(|v| v.split(':').map(PathBuf::from).collect())
                .unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Startup validation; hard failures, not warnings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (var, value) in [
            ("MCP_API_KEY", Some(self.mcp_api_key.as_str())),
            ("IDE_API_KEY", Some(self.ide_api_key.as_str())),
            ("ADMIN_API_KEY", self.admin_api_key.as_deref()),
            ("JWT_SECRET", self.jwt_secret.as_deref()),
        ] {
            let Some(value) = value else { continue };
            let lowered = value.to_ascii_lowercase();
            if PLACEHOLDER_MARKERS.iter().any(|m| lowered.contains(m)) {
                return Err(ConfigError::Invalid {
                    var,
                    message: "placeholder value; generate a real secret".to_string(),
                });
            }
        }

        if self.production_mode && self.cors_allowed_origins.iter().any(|o| o == "*") {
            return Err(ConfigError::Invalid {
                var: "CORS_ALLOWED_ORIGINS",
                message: "wildcard origin is not allowed in production".to_string(),
            });
        }

        if self.tls_min_version < 1.2 {
            return Err(ConfigError::Invalid {
                var: "TLS_MIN_VERSION",
                message: "must be at least 1.2".to_string(),
            });
        }
        if self.production_mode && self.tls_enabled && self.tls_min_version < 1.3 {
            return Err(ConfigError::Invalid {
                var: "TLS_MIN_VERSION",
                message: "production requires TLS 1.3".to_string(),
            });
        }

        Ok(())
    }

    /// Required token type for a normalized request path, or `None` for
    /// public paths. Matching is an explicit prefix switch.
    pub fn required_token_type(&self, normalized_path: &str) -> Option<TokenType> {
        if is_public_path(normalized_path) {
            return None;
        }
        if normalized_path.starts_with("/mcp/") {
            return Some(TokenType::Mcp);
        }
        if normalized_path.starts_with("/api/ingest") {
            return Some(TokenType::Admin);
        }
        if normalized_path.starts_with("/api/") {
            return Some(TokenType::Ide);
        }
        // Unrouted paths still require the strongest credential.
        Some(TokenType::Admin)
    }

    /// Rate limit (req/min) for a token type.
    pub fn rate_limit_for(&self, token_type: TokenType) -> u64 {
        match token_type {
            TokenType::Mcp => self.rate_limit_mcp,
            TokenType::Ide => self.rate_limit_ide,
            TokenType::Admin => self.rate_limit_ide,
        }
    }

    /// A config suitable for tests: in-memory DB, permissive limits.
    pub fn for_tests() -> Self {
        Self {
            mcp_port: 0,
            web_port: 0,
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 10 * 1024 * 1024,
            max_url_bytes: 4096,
            mcp_api_key: "test-mcp-key".to_string(),
            ide_api_key: "test-ide-key".to_string(),
            admin_api_key: Some("test-admin-key".to_string()),
            jwt_secret: None,
            database_url: "sqlite::memory:".to_string(),
            redis_url: None,
            enable_cache: true,
            tls_enabled: false,
            tls_cert_path: None,
            tls_key_path: None,
            tls_min_version: 1.2,
            cors_allowed_origins: vec!["http://localhost:3000".to_string()],
            rate_limit_mcp: 60,
            rate_limit_ide: 120,
            rate_limit_session: 120,
            cache_ttl_rules: Duration::from_secs(300),
            cache_ttl_docs: Duration::from_secs(600),
            cache_ttl_search: Duration::from_secs(120),
            production_mode: false,
            enable_metrics: true,
            enable_audit_logging: true,
            trust_proxy: false,
            session_idle_timeout: Duration::from_secs(3600),
            reply_queue_capacity: 256,
            rule_source_dirs: Vec::new(),
        }
    }
}

/// Public paths, compared against the normalized request path.
pub fn is_public_path(normalized_path: &str) -> bool {
    matches!(
        normalized_path,
        "/health/live" | "/health/ready" | "/metrics" | "/version"
    )
}

/// Collapse `.` and `..` segments so exemption checks can't be bypassed
/// with traversal tricks like `/health/live/../../admin`.
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    let mut normalized = String::from("/");
    normalized.push_str(&segments.join("/"));
    normalized
}

fn optional(var: &'static str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn require(var: &'static str) -> Result<String, ConfigError> {
    optional(var).ok_or(ConfigError::Missing(var))
}

/// Read `<VAR>_FILE` preferentially, falling back to `<VAR>`.
fn secret(var: &'static str) -> Result<Option<String>, ConfigError> {
    let file_var = format!("{}_FILE", var);
    if let Ok(path) = std::env::var(&file_var) {
        if !path.is_empty() {
            let content = std::fs::read_to_string(&path)
                .map_err(|source| ConfigError::SecretFile { var, source })?;
            return Ok(Some(content.trim().to_string()));
        }
    }
    Ok(optional(var))
}

fn parse_or<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match optional(var) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            message: e.to_string(),
        }),
    }
}

fn database_url() -> Result<String, ConfigError> {
    if let Some(url) = optional("DATABASE_URL") {
        return Ok(url);
    }
    let host = optional("DB_HOST");
    match host {
        None => Ok("sqlite:guardrail.db?mode=rwc".to_string()),
        Some(host) => {
            let port = optional("DB_PORT").unwrap_or_else(|| "5432".to_string());
            let name = optional("DB_NAME").unwrap_or_else(|| "guardrail".to_string());
            let user = optional("DB_USER").unwrap_or_else(|| "guardrail".to_string());
            let password = secret("DB_PASSWORD")?.unwrap_or_default();
            let sslmode = optional("DB_SSLMODE").unwrap_or_else(|| "require".to_string());
            Ok(format!(
                "postgres://{}:{}@{}:{}/{}?sslmode={}",
                user, password, host, port, name, sslmode
            ))
        }
    }
}

fn redis_url() -> Result<Option<String>, ConfigError> {
    let Some(host) = optional("REDIS_HOST") else {
        return Ok(None);
    };
    let port = optional("REDIS_PORT").unwrap_or_else(|| "6379".to_string());
    let password = secret("REDIS_PASSWORD")?;
    let scheme = if parse_or("REDIS_USE_TLS", false)? {
        "rediss"
    } else {
        "redis"
    };
    let auth = password
        .map(|p| format!(":{}@", p))
        .unwrap_or_default();
    Ok(Some(format!("{}://{}{}:{}", scheme, auth, host, port)))
}
