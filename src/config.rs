use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::routing::RoutingSettings;

const APP_DIR: &str = "tunwire";
const CONFIG_FILE: &str = "config.json";
const CATALOG_FILE: &str = "servers.json";
const SESSION_FILE: &str = "session.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: format!("tunwire/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Settings read from `~/.config/tunwire/config.json`. Missing keys take defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub routing: RoutingSettings,
    /// Tunnel link name used when none is given on the command line.
    pub interface: String,
    /// Destinations that always bypass the tunnel.
    pub excluded_subnets: Vec<IpNet>,
    pub http: HttpSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            routing: RoutingSettings::default(),
            interface: "wg0".to_string(),
            excluded_subnets: Vec::new(),
            http: HttpSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load the user config, falling back to defaults when the file is absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let json = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "config_loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.routing.validate()?;
        if self.interface.is_empty() || self.interface.len() > 15 {
            return Err(AppError::Config(format!(
                "interface name {:?} must be 1-15 characters",
                self.interface
            )));
        }
        if self.http.timeout_secs == 0 {
            return Err(AppError::Config("http.timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Root config directory: ~/.config/tunwire/
#[must_use]
pub fn app_config_dir() -> PathBuf {
    xdg_config_home().join(APP_DIR)
}

#[must_use]
pub fn config_path() -> PathBuf {
    app_config_dir().join(CONFIG_FILE)
}

/// Server catalog: ~/.config/tunwire/servers.json
#[must_use]
pub fn catalog_path() -> PathBuf {
    app_config_dir().join(CATALOG_FILE)
}

/// Routing session of the active tunnel: ~/.config/tunwire/session.json
#[must_use]
pub fn session_path() -> PathBuf {
    app_config_dir().join(SESSION_FILE)
}

fn xdg_config_home() -> PathBuf {
    if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(config)
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".config")
    } else {
        PathBuf::from("/tmp")
    }
}

/// Write `data` to `path` readable by the owner only, creating the parent directory `0700`.
pub fn write_private_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
        }
    }
    fs::write(path, data)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}
