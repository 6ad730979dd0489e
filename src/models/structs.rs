use serde::{Deserialize, Serialize};

use crate::errors::ConnectError;
use crate::models::enums::DatabaseType;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TunnelParameters {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl TunnelParameters {
    pub fn endpoint(&self) -> String {
        format_host_port(&self.host, self.port)
    }
}

/// Everything needed to reach one database server. `tunnel` is `Some`
/// exactly when the connection should go through SSH.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(from = "StoredParams", into = "StoredParams")]
pub struct ConnectionParameters {
    pub engine: DatabaseType,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub tunnel: Option<TunnelParameters>,
}

impl ConnectionParameters {
    pub fn new(
        engine: DatabaseType,
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            database: String::new(),
            tunnel: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_tunnel(mut self, tunnel: TunnelParameters) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    pub fn use_tunnel(&self) -> bool {
        self.tunnel.is_some()
    }

    pub fn has_database(&self) -> bool {
        !self.database.trim().is_empty()
    }

    pub fn target(&self) -> String {
        format_host_port(&self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConnectError> {
        if self.host.trim().is_empty() {
            return Err(ConnectError::InvalidParameters(
                "Database host cannot be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ConnectError::InvalidParameters(
                "Database port must be a valid number".to_string(),
            ));
        }
        if let Some(tunnel) = &self.tunnel {
            if tunnel.host.trim().is_empty() {
                return Err(ConnectError::InvalidParameters(
                    "SSH host cannot be empty".to_string(),
                ));
            }
            if tunnel.user.trim().is_empty() {
                return Err(ConnectError::InvalidParameters(
                    "SSH username cannot be empty".to_string(),
                ));
            }
            if tunnel.port == 0 {
                return Err(ConnectError::InvalidParameters(
                    "SSH port must be a valid number".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// On-disk record shape of a profile. Field names match the files written by
/// earlier releases of the client.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StoredParams {
    #[serde(rename = "DBType")]
    db_type: Option<DatabaseType>,
    #[serde(rename = "Host", default)]
    host: String,
    #[serde(rename = "Port", default)]
    port: u16,
    #[serde(rename = "User", default)]
    user: String,
    #[serde(rename = "Pass", default)]
    pass: String,
    #[serde(rename = "DB", default)]
    db: String,
    #[serde(rename = "UseSSH", default)]
    use_ssh: bool,
    #[serde(rename = "SSHHost", default)]
    ssh_host: String,
    #[serde(rename = "SSHPort", default)]
    ssh_port: u16,
    #[serde(rename = "SSHUser", default)]
    ssh_user: String,
    #[serde(rename = "SSHPass", default)]
    ssh_pass: String,
}

impl From<StoredParams> for ConnectionParameters {
    fn from(stored: StoredParams) -> Self {
        let engine = stored.db_type.unwrap_or(DatabaseType::MySQL);
        // SSH fields left behind by an earlier edit mean nothing unless UseSSH is set
        let tunnel = stored.use_ssh.then(|| TunnelParameters {
            host: stored.ssh_host,
            port: if stored.ssh_port == 0 { 22 } else { stored.ssh_port },
            user: stored.ssh_user,
            password: stored.ssh_pass,
        });
        Self {
            engine,
            host: stored.host,
            port: if stored.port == 0 {
                engine.default_port()
            } else {
                stored.port
            },
            user: stored.user,
            password: stored.pass,
            database: stored.db,
            tunnel,
        }
    }
}

impl From<ConnectionParameters> for StoredParams {
    fn from(params: ConnectionParameters) -> Self {
        let mut stored = StoredParams {
            db_type: Some(params.engine),
            host: params.host,
            port: params.port,
            user: params.user,
            pass: params.password,
            db: params.database,
            ..Default::default()
        };
        if let Some(tunnel) = params.tunnel {
            stored.use_ssh = true;
            stored.ssh_host = tunnel.host;
            stored.ssh_port = tunnel.port;
            stored.ssh_user = tunnel.user;
            stored.ssh_pass = tunnel.password;
        }
        stored
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedConnection {
    pub name: String,
    pub params: ConnectionParameters,
    #[serde(default)]
    pub is_favorite: bool,
}

/// Headers plus rows rendered as text.
pub type QueryResult = (Vec<String>, Vec<Vec<String>>);

/// `host:port`, bracketing bare IPv6 literals.
pub fn format_host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Inverse of [`format_host_port`].
pub fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}
