//! Configuration: CLI/env var (highest priority) -> `{data_dir}/config.toml`
//! overlay -> built-in default, in the style of
//! `clawd::config::DaemonConfig::new`. No hot-reload watcher — the teacher's
//! `ConfigWatcher` only ever reloaded non-critical session-pruning fields,
//! which this domain has no equivalent of.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::error;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_LOG: &str = "info";

#[derive(Deserialize, Default)]
struct TomlConfig {
    port: Option<u16>,
    log: Option<String>,
    object_store_endpoint: Option<String>,
    object_store_bucket: Option<String>,
    object_store_access_key: Option<String>,
    object_store_secret_key: Option<String>,
    oauth_client_id: Option<String>,
    oauth_client_secret: Option<String>,
    jwt_secret: Option<String>,
    cors_origins: Option<Vec<String>>,
    enable_account_registration: Option<bool>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

/// Object-store backend selection. `Fs` is the default when no endpoint is
/// configured; `S3` activates once an endpoint and bucket are both present.
#[derive(Debug, Clone)]
pub enum ObjectStoreConfig {
    Fs {
        root: PathBuf,
    },
    S3 {
        endpoint: String,
        bucket: String,
        access_key: String,
        secret_key: String,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    pub object_store: ObjectStoreConfig,
    pub oauth_client_id: Option<String>,
    pub oauth_client_secret: Option<String>,
    pub jwt_secret: String,
    pub cors_origins: Vec<String>,
    pub enable_account_registration: bool,
}

impl ServerConfig {
    /// Build config from CLI args + env vars + optional TOML file.
    ///
    /// Priority (highest to lowest): CLI flag (`Some(value)` from clap) > env
    /// var (`CODEPUSH_*`) > `{data_dir}/config.toml` > built-in default.
    pub fn new(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir
            .or_else(|| std::env::var("CODEPUSH_DATA_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(default_data_dir);

        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port
            .or_else(|| env_u16("CODEPUSH_PORT"))
            .or(toml.port)
            .unwrap_or(DEFAULT_PORT);
        let log = log
            .or_else(|| std::env::var("CODEPUSH_LOG").ok())
            .or(toml.log)
            .unwrap_or_else(|| DEFAULT_LOG.to_string());

        let endpoint = std::env::var("CODEPUSH_OBJECT_STORE_ENDPOINT")
            .ok()
            .or(toml.object_store_endpoint);
        let bucket = std::env::var("CODEPUSH_OBJECT_STORE_BUCKET")
            .ok()
            .or(toml.object_store_bucket);
        let object_store = match (endpoint, bucket) {
            (Some(endpoint), Some(bucket)) => ObjectStoreConfig::S3 {
                endpoint,
                bucket,
                access_key: std::env::var("CODEPUSH_OBJECT_STORE_ACCESS_KEY")
                    .ok()
                    .or(toml.object_store_access_key)
                    .unwrap_or_default(),
                secret_key: std::env::var("CODEPUSH_OBJECT_STORE_SECRET_KEY")
                    .ok()
                    .or(toml.object_store_secret_key)
                    .unwrap_or_default(),
            },
            _ => ObjectStoreConfig::Fs {
                root: data_dir.join("blobs"),
            },
        };

        let oauth_client_id = std::env::var("CODEPUSH_OAUTH_CLIENT_ID").ok().or(toml.oauth_client_id);
        let oauth_client_secret = std::env::var("CODEPUSH_OAUTH_CLIENT_SECRET")
            .ok()
            .or(toml.oauth_client_secret);
        let jwt_secret = std::env::var("CODEPUSH_JWT_SECRET")
            .ok()
            .or(toml.jwt_secret)
            .unwrap_or_else(|| "codepush-dev-secret-change-me".to_string());
        let cors_origins = std::env::var("CODEPUSH_CORS_ORIGINS")
            .ok()
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .or(toml.cors_origins)
            .unwrap_or_default();
        let enable_account_registration = std::env::var("CODEPUSH_ENABLE_ACCOUNT_REGISTRATION")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .or(toml.enable_account_registration)
            .unwrap_or(false);

        Self {
            port,
            data_dir,
            log,
            object_store,
            oauth_client_id,
            oauth_client_secret,
            jwt_secret,
            cors_origins,
            enable_account_registration,
        }
    }
}

fn env_u16(name: &str) -> Option<u16> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("codepush");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("codepush");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("codepush");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("codepush");
        }
    }
    PathBuf::from(".codepush")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_any_override() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig::new(None, Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.log, DEFAULT_LOG);
        assert!(matches!(cfg.object_store, ObjectStoreConfig::Fs { .. }));
        assert!(!cfg.enable_account_registration);
    }

    #[test]
    fn explicit_port_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig::new(Some(8080), Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.port, 8080);
    }

    #[test]
    fn toml_file_is_used_as_an_overlay() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "port = 9999\nlog = \"debug\"\n").unwrap();
        let cfg = ServerConfig::new(None, Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.port, 9999);
        assert_eq!(cfg.log, "debug");
    }

    #[test]
    fn explicit_arg_wins_over_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "port = 9999\n").unwrap();
        let cfg = ServerConfig::new(Some(1234), Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.port, 1234);
    }
}
