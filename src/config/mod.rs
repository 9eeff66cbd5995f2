//! Layered configuration for the relay server and endpoint client.
//!
//! Priority (highest to lowest): CLI / env var > TOML file > built-in default.
//! Mirrors the daemon's own config-loading shape: a `TomlConfig` file layer
//! merged under explicit overrides, never the other way around.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 4300;
const DEFAULT_UNLOCK_SECRET: &str = "666666";
const DEFAULT_AUTO_LOCK_TIMEOUT_MS: u64 = 0;

/// `{data_dir}/config.toml` on the server side — all fields optional.
#[derive(Deserialize, Default)]
struct ServerTomlConfig {
    port: Option<u16>,
    allow_origins: Option<Vec<String>>,
    disable_registration: Option<bool>,
    jwt_secret: Option<String>,
}

/// Configuration for the relay server binary.
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// CORS allowlist for the adjacent health/REST surface.
    pub allow_origins: Vec<String>,
    /// Disables new-account registration on the auth side (no-op here;
    /// accepted for forward compatibility with the external auth service).
    pub disable_registration: bool,
    /// HMAC secret for the bundled JWT verifier (see `auth` module).
    pub jwt_secret: String,
}

impl RelayServerConfig {
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        jwt_secret: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml::<ServerTomlConfig>(&data_dir.join("config.toml")).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.unwrap_or_else(|| "info".to_string());
        let allow_origins = toml.allow_origins.unwrap_or_default();
        let disable_registration = toml.disable_registration.unwrap_or(false);

        let jwt_secret = std::env::var("STUDIO_RELAY_JWT_SECRET")
            .ok()
            .or(jwt_secret)
            .or(toml.jwt_secret)
            .unwrap_or_else(|| "insecure-development-secret".to_string());

        Self {
            port,
            data_dir,
            log,
            allow_origins,
            disable_registration,
            jwt_secret,
        }
    }
}

/// `{data_dir}/config.toml` on the endpoint side — all fields optional.
#[derive(Deserialize, Default)]
struct EndpointTomlConfig {
    server_url: Option<String>,
    device_name: Option<String>,
    allow_remote_control: Option<bool>,
    unlock_secret: Option<String>,
    auto_lock_timeout_ms: Option<u64>,
}

/// Configuration for an endpoint (desktop or mobile) process.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub server_url: String,
    pub token: String,
    pub device_name: String,
    pub data_dir: PathBuf,
    pub log: String,
    /// Desktop-only: whether incoming `control-request`s may be accepted.
    pub allow_remote_control: bool,
    /// Desktop-only: six-digit secret required to exit remote/unlocking states.
    pub unlock_secret: String,
    /// Desktop-only: ms to wait after accepting control before locking (0 = immediate).
    pub auto_lock_timeout_ms: u64,
}

impl EndpointConfig {
    pub fn new(
        server_url: Option<String>,
        token: Option<String>,
        device_name: Option<String>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
    ) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml =
            load_toml::<EndpointTomlConfig>(&data_dir.join("config.toml")).unwrap_or_default();

        let server_url = std::env::var("STUDIO_RELAY_SERVER_URL")
            .ok()
            .or(server_url)
            .or(toml.server_url)
            .ok_or_else(|| anyhow::anyhow!("no server URL: pass --server-url, set STUDIO_RELAY_SERVER_URL, or configure server_url in config.toml"))?;

        let token = std::env::var("STUDIO_RELAY_TOKEN")
            .ok()
            .or(token)
            .ok_or_else(|| anyhow::anyhow!("no auth token: pass --token or set STUDIO_RELAY_TOKEN"))?;

        let device_name = device_name
            .or(toml.device_name)
            .unwrap_or_else(|| whoami_fallback());

        let log = log.unwrap_or_else(|| "info".to_string());
        let allow_remote_control = toml.allow_remote_control.unwrap_or(true);
        let unlock_secret = toml
            .unlock_secret
            .unwrap_or_else(|| DEFAULT_UNLOCK_SECRET.to_string());
        let auto_lock_timeout_ms = toml
            .auto_lock_timeout_ms
            .unwrap_or(DEFAULT_AUTO_LOCK_TIMEOUT_MS);

        Ok(Self {
            server_url,
            token,
            device_name,
            data_dir,
            log,
            allow_remote_control,
            unlock_secret,
            auto_lock_timeout_ms,
        })
    }
}

fn whoami_fallback() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown-device".to_string())
}

fn load_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<T>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("studio-relay");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("studio-relay");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("studio-relay");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("studio-relay");
        }
    }
    PathBuf::from(".studio-relay")
}
