pub mod audit;
pub mod content;
pub mod jwt;
pub mod rate_limit;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::bus::types::AuditEntry;
use crate::bus::BusApi;

use audit::AuditBatcher;
use jwt::TokenService;
use rate_limit::{RateLimitError, RateLimiter};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("Rate limit exceeded for {action}, retry in {retry_after_ms}ms")]
    RateLimit { action: String, retry_after_ms: u64 },
    #[error("invalid content: {0}")]
    InvalidContent(String),
    #[error("Directory guard blocked reference to {0}")]
    DirectoryDenied(String),
}

impl From<RateLimitError> for SecurityError {
    fn from(e: RateLimitError) -> Self {
        SecurityError::RateLimit { action: e.action, retry_after_ms: e.retry_after_ms }
    }
}

impl SecurityError {
    /// Short tag used in audit `blocked:<reason>` results.
    pub fn reason(&self) -> &'static str {
        match self {
            SecurityError::RateLimit { .. } => "rate_limit",
            SecurityError::InvalidContent(_) => "invalid_content",
            SecurityError::DirectoryDenied(_) => "directory_guard",
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default = "default_rate_limits")]
    pub rate_limits: HashMap<String, u32>,
    #[serde(default)]
    pub allowed_directories: Vec<PathBuf>,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    /// Symmetric signing secret. Usually injected via `NYARLA_JWT_SECRET`
    /// rather than written into the config file.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_expiry_ms")]
    pub expiry_ms: u64,
    #[serde(default = "default_rotation_ms")]
    pub rotation_interval_ms: u64,
    #[serde(default = "default_revocation_ttl_ms")]
    pub revocation_ttl_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_batch")]
    pub batch_size: usize,
    #[serde(default = "default_audit_flush_ms")]
    pub flush_interval_ms: u64,
}

fn default_rate_limits() -> HashMap<String, u32> {
    HashMap::from([("message".to_string(), 60), ("command".to_string(), 30)])
}

fn default_expiry_ms() -> u64 {
    60 * 60 * 1000
}

fn default_rotation_ms() -> u64 {
    15 * 60 * 1000
}

fn default_revocation_ttl_ms() -> u64 {
    60 * 60 * 1000
}

fn default_audit_batch() -> usize {
    20
}

fn default_audit_flush_ms() -> u64 {
    30_000
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: None,
            expiry_ms: default_expiry_ms(),
            rotation_interval_ms: default_rotation_ms(),
            revocation_ttl_ms: default_revocation_ttl_ms(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { batch_size: default_audit_batch(), flush_interval_ms: default_audit_flush_ms() }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            jwt: JwtConfig::default(),
            rate_limits: default_rate_limits(),
            allowed_directories: Vec::new(),
            audit: AuditConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline facade
// ---------------------------------------------------------------------------

/// The five security concerns behind one surface. The router applies, per
/// message: `check_and_record("message")` → `validate_and_sanitize` →
/// `enforce_directory` → `audit`.
pub struct SecurityPipeline {
    tokens: TokenService,
    limiter: RateLimiter,
    audit: Arc<AuditBatcher>,
    allowed_directories: Vec<PathBuf>,
}

impl SecurityPipeline {
    pub fn new(config: &SecurityConfig, machine_id: &str, bus: Arc<dyn BusApi>) -> Self {
        let secret = config.jwt.secret.clone().unwrap_or_default();
        Self {
            tokens: TokenService::new(&secret, machine_id, &config.jwt),
            limiter: RateLimiter::new(config.rate_limits.clone()),
            audit: Arc::new(AuditBatcher::new(bus, &config.audit)),
            allowed_directories: config.allowed_directories.clone(),
        }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn check_and_record(&self, actor_id: &str, action: &str) -> Result<(), SecurityError> {
        self.limiter.check_and_record(actor_id, action).map_err(Into::into)
    }

    pub fn validate_and_sanitize(&self, raw: &str) -> Result<String, SecurityError> {
        content::validate_and_sanitize(raw)
    }

    pub fn enforce_directory(&self, sanitized: &str) -> Result<(), SecurityError> {
        content::enforce_directories(sanitized, &self.allowed_directories)
    }

    pub async fn audit(&self, entry: AuditEntry) {
        self.audit.record(entry).await;
    }

    pub fn start_audit_flush(&self) -> JoinHandle<()> {
        AuditBatcher::start_auto_flush(self.audit.clone())
    }

    pub async fn shutdown(&self) {
        self.audit.shutdown().await;
    }

    #[cfg(test)]
    pub fn audit_pending(&self) -> usize {
        self.audit.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingBus;

    fn config_with_dirs(dirs: &[&str]) -> SecurityConfig {
        SecurityConfig {
            jwt: JwtConfig { secret: Some("sekrit".into()), ..JwtConfig::default() },
            allowed_directories: dirs.iter().map(PathBuf::from).collect(),
            ..SecurityConfig::default()
        }
    }

    #[tokio::test]
    async fn test_pipeline_order_allows_clean_message() {
        let bus = Arc::new(RecordingBus::new());
        let p = SecurityPipeline::new(&config_with_dirs(&["/w/p"]), "M", bus);

        p.check_and_record("a1", "message").unwrap();
        let clean = p.validate_and_sanitize("  look at /w/p/src/main.rs  ").unwrap();
        p.enforce_directory(&clean).unwrap();
    }

    #[test]
    fn test_security_error_reasons() {
        let e = SecurityError::RateLimit { action: "message".into(), retry_after_ms: 10 };
        assert_eq!(e.reason(), "rate_limit");
        assert_eq!(SecurityError::InvalidContent("x".into()).reason(), "invalid_content");
        assert_eq!(SecurityError::DirectoryDenied("/etc".into()).reason(), "directory_guard");
    }

    #[test]
    fn test_config_defaults_parse_from_empty_table() {
        let cfg: SecurityConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.rate_limits.get("message"), Some(&60));
        assert_eq!(cfg.audit.batch_size, 20);
        assert!(cfg.jwt.secret.is_none());
        assert!(cfg.allowed_directories.is_empty());
    }

    #[test]
    fn test_config_partial_table_parses() {
        let cfg: SecurityConfig = toml::from_str(
            r#"
            allowed_directories = ["/w/p"]

            [jwt]
            secret = "s"
            rotation_interval_ms = 1000

            [rate_limits]
            message = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.jwt.secret.as_deref(), Some("s"));
        assert_eq!(cfg.jwt.rotation_interval_ms, 1000);
        assert_eq!(cfg.jwt.expiry_ms, default_expiry_ms());
        assert_eq!(cfg.rate_limits.get("message"), Some(&5));
    }
}
