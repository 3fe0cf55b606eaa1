//! Configuration vault – reads/writes `~/.fleetsync/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use fleetsync_runtime::EngineConfig;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Persisted operator configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Bus partition the engine joins.
    #[serde(default)]
    pub domain_id: u32,

    /// Dashboard host for the outward socket.  Leave unset to run without
    /// one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token for the outward socket (stored as plain text; the file
    /// is written owner-only).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jwt: String,

    #[serde(default)]
    pub quiet_logging: bool,

    /// Per-category throttle overrides in milliseconds.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub throttle: BTreeMap<String, u64>,

    /// How many simulated robots the demo fleet reports.
    #[serde(default = "default_demo_robots")]
    pub demo_robots: usize,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("domain_id", &self.domain_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("jwt", if self.jwt.is_empty() { &"<not set>" } else { &"<redacted>" })
            .field("quiet_logging", &self.quiet_logging)
            .field("throttle", &self.throttle)
            .field("demo_robots", &self.demo_robots)
            .finish()
    }
}

impl Drop for Config {
    fn drop(&mut self) {
        self.jwt.zeroize();
    }
}

fn default_port() -> u16 {
    fleetsync_runtime::config::DEFAULT_PORT
}
fn default_demo_robots() -> usize {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain_id: 0,
            host: None,
            port: default_port(),
            jwt: String::new(),
            quiet_logging: false,
            throttle: BTreeMap::new(),
            demo_robots: default_demo_robots(),
        }
    }
}

impl Config {
    /// Engine view of this configuration.
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            domain_id: self.domain_id,
            host: self.host.clone(),
            port: self.port,
            jwt: (!self.jwt.is_empty()).then(|| self.jwt.clone()),
            quiet_logging: self.quiet_logging,
            throttle: self.throttle.clone(),
            ..EngineConfig::default()
        }
    }
}

/// Return the path to `~/.fleetsync/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".fleetsync").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `FLEETSYNC_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `FLEETSYNC_DOMAIN_ID` | `domain_id` |
/// | `FLEETSYNC_HOST` | `host` (empty clears it) |
/// | `FLEETSYNC_PORT` | `port` |
/// | `FLEETSYNC_JWT` | `jwt` |
/// | `FLEETSYNC_QUIET` | `quiet_logging` (`1`/`true`) |
///
/// Unparseable numeric values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("FLEETSYNC_DOMAIN_ID")
        && let Ok(id) = v.parse::<u32>()
    {
        cfg.domain_id = id;
    }
    if let Ok(v) = std::env::var("FLEETSYNC_HOST") {
        cfg.host = (!v.trim().is_empty()).then_some(v);
    }
    if let Ok(v) = std::env::var("FLEETSYNC_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.port = port;
    }
    if let Ok(v) = std::env::var("FLEETSYNC_JWT") {
        cfg.jwt.zeroize();
        cfg.jwt = v;
    }
    if let Ok(v) = std::env::var("FLEETSYNC_QUIET") {
        cfg.quiet_logging = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
    }
}

/// Save the config to disk, creating `~/.fleetsync/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner-only read/write on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
