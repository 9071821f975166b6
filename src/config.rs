use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::security::SecurityConfig;

pub const DEFAULT_ENVIRONMENT: &str = "dev";
const DEFAULT_HEARTBEAT_MS: u64 = 30_000;
const DEFAULT_POLL_MS: u64 = 5_000;

/// On-disk shape of `<claude_dir>/comms/config.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub environments: HashMap<String, EnvironmentConfig>,
    #[serde(default)]
    pub security: Option<SecurityConfig>,
    #[serde(default)]
    pub daemon: DaemonTuning,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentConfig {
    pub api_url: Option<String>,
    /// Literal credential, or the name of the env var holding it.
    pub project_key: Option<String>,
    pub project_key_env: Option<String>,
    pub machine_id: Option<String>,
    pub heartbeat_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonTuning {
    #[serde(default = "default_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_active_window_secs")]
    pub active_window_secs: u64,
}

fn default_poll_ms() -> u64 {
    DEFAULT_POLL_MS
}

fn default_active_window_secs() -> u64 {
    60 * 60
}

impl Default for DaemonTuning {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_ms(),
            active_window_secs: default_active_window_secs(),
        }
    }
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn load_if_present(path: &Path) -> Result<Option<Self>> {
        if path.exists() {
            Ok(Some(Self::load(path)?))
        } else {
            Ok(None)
        }
    }
}

/// CLI-provided values; they win over env vars, which win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub env: Option<String>,
    pub api_url: Option<String>,
    pub project_key: Option<String>,
    pub machine_id: Option<String>,
    pub heartbeat_interval_ms: Option<u64>,
}

/// Fully-resolved daemon configuration. Any missing required field is a
/// startup error, the only fatal kind the daemon knows.
#[derive(Debug, Clone)]
pub struct Config {
    pub environment: String,
    pub api_url: String,
    pub project_key: String,
    pub machine_id: String,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub active_window: Duration,
    pub claude_dir: PathBuf,
    pub security: Option<SecurityConfig>,
}

impl Config {
    pub fn resolve(file: Option<ConfigFile>, overrides: &Overrides) -> Result<Self> {
        Self::resolve_with(file, overrides, |name| std::env::var(name).ok())
    }

    /// `lookup` abstracts env-var access so resolution is testable without
    /// mutating process state.
    pub fn resolve_with(
        file: Option<ConfigFile>,
        overrides: &Overrides,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let file = file.unwrap_or_default();

        let environment = overrides
            .env
            .clone()
            .or_else(|| lookup("NYARLA_ENV"))
            .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());

        let section = file.environments.get(&environment).cloned().unwrap_or_default();

        let api_url = overrides
            .api_url
            .clone()
            .or_else(|| lookup("NYARLA_API_URL"))
            .or(section.api_url)
            .with_context(|| format!("missing api_url for environment '{environment}'"))?;

        let project_key = overrides
            .project_key
            .clone()
            .or_else(|| lookup("NYARLA_PROJECT_KEY"))
            .or_else(|| {
                section
                    .project_key_env
                    .as_deref()
                    .and_then(&lookup)
                    .filter(|k| !k.is_empty())
            })
            .or(section.project_key)
            .with_context(|| format!("missing project_key for environment '{environment}'"))?;

        let machine_id = overrides
            .machine_id
            .clone()
            .or_else(|| lookup("NYARLA_MACHINE_ID"))
            .or(section.machine_id)
            .with_context(|| format!("missing machine_id for environment '{environment}'"))?;

        let heartbeat_ms = overrides
            .heartbeat_interval_ms
            .or_else(|| {
                lookup("NYARLA_HEARTBEAT_INTERVAL_MS").and_then(|v| v.parse().ok())
            })
            .or(section.heartbeat_interval_ms)
            .unwrap_or(DEFAULT_HEARTBEAT_MS);

        // Security turns on when a JWT secret is available from anywhere;
        // a [security] table without one is a misconfiguration.
        let env_secret = lookup("NYARLA_JWT_SECRET").filter(|s| !s.is_empty());
        let security = match (file.security, env_secret) {
            (Some(mut cfg), secret) => {
                if let Some(secret) = secret {
                    cfg.jwt.secret = Some(secret);
                }
                if cfg.jwt.secret.as_deref().unwrap_or("").is_empty() {
                    anyhow::bail!(
                        "security is configured but no JWT secret was provided \
                         (set NYARLA_JWT_SECRET or [security.jwt] secret)"
                    );
                }
                Some(cfg)
            }
            (None, Some(secret)) => {
                let mut cfg = SecurityConfig::default();
                cfg.jwt.secret = Some(secret);
                Some(cfg)
            }
            (None, None) => None,
        };

        let claude_dir = lookup("NYARLA_CLAUDE_DIR")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".claude")))
            .context("cannot determine home directory")?;

        Ok(Self {
            environment,
            api_url,
            project_key,
            machine_id,
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            poll_interval: Duration::from_millis(file.daemon.poll_interval_ms),
            active_window: Duration::from_secs(file.daemon.active_window_secs),
            claude_dir,
            security,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn parse(toml_str: &str) -> ConfigFile {
        toml::from_str(toml_str).unwrap()
    }

    fn full_file() -> ConfigFile {
        parse(
            r#"
            [environments.dev]
            api_url = "http://localhost:8787/"
            project_key = "dev-key"
            machine_id = "dev-box"

            [environments.live]
            api_url = "https://bus.example.com"
            project_key_env = "BUS_KEY"
            machine_id = "prod-box"
            heartbeat_interval_ms = 10000
            "#,
        )
    }

    #[test]
    fn test_resolves_default_environment_from_file() {
        let config = Config::resolve_with(Some(full_file()), &Overrides::default(), no_env).unwrap();
        assert_eq!(config.environment, "dev");
        assert_eq!(config.api_url, "http://localhost:8787/");
        assert_eq!(config.project_key, "dev-key");
        assert_eq!(config.machine_id, "dev-box");
        assert_eq!(config.heartbeat_interval, Duration::from_millis(30_000));
        assert_eq!(config.poll_interval, Duration::from_millis(5_000));
        assert!(config.security.is_none());
    }

    #[test]
    fn test_env_selection_and_key_indirection() {
        let overrides = Overrides { env: Some("live".into()), ..Overrides::default() };
        let config = Config::resolve_with(Some(full_file()), &overrides, |name| match name {
            "BUS_KEY" => Some("live-secret".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.environment, "live");
        assert_eq!(config.project_key, "live-secret");
        assert_eq!(config.heartbeat_interval, Duration::from_millis(10_000));
    }

    #[test]
    fn test_flags_beat_env_vars_beat_file() {
        let overrides = Overrides {
            api_url: Some("http://flag".into()),
            ..Overrides::default()
        };
        let config = Config::resolve_with(Some(full_file()), &overrides, |name| match name {
            "NYARLA_API_URL" => Some("http://envvar".to_string()),
            "NYARLA_MACHINE_ID" => Some("env-box".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.api_url, "http://flag");
        assert_eq!(config.machine_id, "env-box");
    }

    #[test]
    fn test_missing_required_field_is_startup_error() {
        let file = parse(
            r#"
            [environments.dev]
            api_url = "http://localhost"
            "#,
        );
        let err = Config::resolve_with(Some(file), &Overrides::default(), no_env).unwrap_err();
        assert!(err.to_string().contains("project_key"));
    }

    #[test]
    fn test_unknown_environment_without_overrides_fails() {
        let overrides = Overrides { env: Some("staging".into()), ..Overrides::default() };
        let err = Config::resolve_with(Some(full_file()), &overrides, no_env).unwrap_err();
        assert!(err.to_string().contains("staging"));
    }

    #[test]
    fn test_security_enabled_by_env_secret_alone() {
        let config = Config::resolve_with(Some(full_file()), &Overrides::default(), |name| {
            (name == "NYARLA_JWT_SECRET").then(|| "s3".to_string())
        })
        .unwrap();
        let security = config.security.expect("security should be enabled");
        assert_eq!(security.jwt.secret.as_deref(), Some("s3"));
    }

    #[test]
    fn test_security_section_without_secret_fails() {
        let file = parse(
            r#"
            [environments.dev]
            api_url = "http://localhost"
            project_key = "k"
            machine_id = "m"

            [security]
            allowed_directories = ["/w/p"]
            "#,
        );
        let err = Config::resolve_with(Some(file), &Overrides::default(), no_env).unwrap_err();
        assert!(err.to_string().contains("JWT secret"));
    }

    #[test]
    fn test_security_section_with_env_secret_merges() {
        let file = parse(
            r#"
            [environments.dev]
            api_url = "http://localhost"
            project_key = "k"
            machine_id = "m"

            [security]
            allowed_directories = ["/w/p"]

            [security.rate_limits]
            message = 5
            "#,
        );
        let config = Config::resolve_with(Some(file), &Overrides::default(), |name| {
            (name == "NYARLA_JWT_SECRET").then(|| "s3".to_string())
        })
        .unwrap();
        let security = config.security.unwrap();
        assert_eq!(security.jwt.secret.as_deref(), Some("s3"));
        assert_eq!(security.rate_limits.get("message"), Some(&5));
        assert_eq!(security.allowed_directories, vec![PathBuf::from("/w/p")]);
    }

    #[test]
    fn test_daemon_tuning_defaults_and_overrides() {
        let file = parse(
            r#"
            [environments.dev]
            api_url = "http://localhost"
            project_key = "k"
            machine_id = "m"

            [daemon]
            poll_interval_ms = 250
            active_window_secs = 120
            "#,
        );
        let config = Config::resolve_with(Some(file), &Overrides::default(), no_env).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.active_window, Duration::from_secs(120));
    }

    #[test]
    fn test_no_file_all_from_env() {
        let config = Config::resolve_with(None, &Overrides::default(), |name| match name {
            "NYARLA_API_URL" => Some("http://envvar".to_string()),
            "NYARLA_PROJECT_KEY" => Some("k".to_string()),
            "NYARLA_MACHINE_ID" => Some("m".to_string()),
            "NYARLA_HEARTBEAT_INTERVAL_MS" => Some("1500".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.api_url, "http://envvar");
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1500));
    }

    #[test]
    fn test_invalid_toml_fails() {
        let result: Result<ConfigFile, _> = toml::from_str("not valid {{{");
        assert!(result.is_err());
    }
}
