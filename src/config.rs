use dirs::home_dir;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ConfigError;
use crate::models::structs::SavedConnection;

const APP_DIR: &str = ".kymar";
const CONNECTIONS_FILE: &str = "connections.json";

/// Fixed limits applied to every database pool the broker opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_open: usize,
    pub max_idle: usize,
    /// Keeps tunnel-routed connections from outliving their tunnel for long.
    pub max_lifetime: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_open: 5,
            max_idle: 2,
            max_lifetime: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorSettings {
    /// SSH connect + handshake, SSH authentication, direct dial fallback.
    pub tunnel_timeout: Duration,
    pub ping_timeout: Duration,
    pub switch_timeout: Duration,
    pub catalog_timeout: Duration,
    pub query_timeout: Duration,
    pub pool: PoolLimits,
    /// When false, tunneling an engine that needs the local forwarder is
    /// rejected instead of attempted.
    pub allow_forward_proxy: bool,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            tunnel_timeout: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(5),
            switch_timeout: Duration::from_secs(5),
            catalog_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(30),
            pool: PoolLimits::default(),
            allow_forward_proxy: true,
        }
    }
}

impl ConnectorSettings {
    /// Defaults, overridden by `KYMAR_QUERY_TIMEOUT_SECS` and
    /// `KYMAR_ALLOW_FORWARD_PROXY` when set.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Ok(raw) = std::env::var("KYMAR_QUERY_TIMEOUT_SECS") {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => settings.query_timeout = Duration::from_secs(secs),
                _ => warn!("Ignoring invalid KYMAR_QUERY_TIMEOUT_SECS={}", raw),
            }
        }
        if let Ok(raw) = std::env::var("KYMAR_ALLOW_FORWARD_PROXY") {
            match parse_flag(&raw) {
                Some(flag) => settings.allow_forward_proxy = flag,
                None => warn!("Ignoring invalid KYMAR_ALLOW_FORWARD_PROXY={}", raw),
            }
        }
        settings
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn app_dir() -> Result<PathBuf, ConfigError> {
    home_dir()
        .map(|home| home.join(APP_DIR))
        .ok_or(ConfigError::NoHomeDir)
}

pub fn connections_path() -> Result<PathBuf, ConfigError> {
    Ok(app_dir()?.join(CONNECTIONS_FILE))
}

/// Saved connection profiles, persisted as one JSON document.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ConnectionStore {
    pub connections: Vec<SavedConnection>,
    #[serde(skip)]
    path: PathBuf,
}

impl ConnectionStore {
    /// Load from `~/.kymar/connections.json`.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(connections_path()?)
    }

    /// Load from `path`; a missing file is an empty store bound to that path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No saved connections at {}", path.display());
                return Ok(Self {
                    connections: Vec::new(),
                    path,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let mut store: ConnectionStore = serde_json::from_str(&data)?;
        store.path = path;
        info!(
            "Loaded {} saved connections from {}",
            store.connections.len(),
            store.path.display()
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        if let Some(dir) = self.path.parent() {
            create_private_dir(dir)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        write_private_file(&self.path, data.as_bytes())?;
        debug!(
            "Saved {} connections to {}",
            self.connections.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Insert `connection`, replacing any profile with the same name, and
    /// persist.
    pub fn add_connection(&mut self, connection: SavedConnection) -> Result<(), ConfigError> {
        match self
            .connections
            .iter_mut()
            .find(|existing| existing.name == connection.name)
        {
            Some(existing) => *existing = connection,
            None => self.connections.push(connection),
        }
        self.save()
    }

    /// Remove by name and persist. Unknown names are not an error.
    pub fn remove_connection(&mut self, name: &str) -> Result<(), ConfigError> {
        let before = self.connections.len();
        self.connections.retain(|c| c.name != name);
        if self.connections.len() == before {
            return Ok(());
        }
        self.save()
    }

    pub fn get_connection(&self, name: &str) -> Option<&SavedConnection> {
        self.connections.iter().find(|c| c.name == name)
    }

    /// Favorites first, then the rest, each group by name.
    pub fn sorted(&self) -> Vec<&SavedConnection> {
        let mut all: Vec<&SavedConnection> = self.connections.iter().collect();
        all.sort_by(|a, b| {
            b.is_favorite
                .cmp(&a.is_favorite)
                .then_with(|| a.name.cmp(&b.name))
        });
        all
    }

    pub fn favorites(&self) -> impl Iterator<Item = &SavedConnection> {
        self.connections.iter().filter(|c| c.is_favorite)
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if dir.exists() {
        return Ok(());
    }
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn write_private_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    fs::write(path, data)
}
