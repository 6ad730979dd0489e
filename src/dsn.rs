use std::fmt;

use url::Url;

use crate::errors::ConnectError;
use crate::models::enums::{DatabaseType, Route};
use crate::models::structs::ConnectionParameters;

const REDACTED: &str = "********";
const APPLICATION_NAME: &str = "kymar";

/// Engine-specific connection string plus the transport the driver should
/// dial through. `Display` never shows the password.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub engine: DatabaseType,
    pub dsn: String,
    pub transport: Option<String>,
    redacted: String,
}

impl ConnectionString {
    pub fn as_str(&self) -> &str {
        &self.dsn
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted)?;
        if let Some(transport) = &self.transport {
            write!(f, " (transport {transport})")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("engine", &self.engine)
            .field("dsn", &self.redacted)
            .field("transport", &self.transport)
            .finish()
    }
}

/// Build the connection string for `params` as reached over `route`. An
/// empty database leaves the database segment out entirely.
pub fn build(params: &ConnectionParameters, route: &Route) -> Result<ConnectionString, ConnectError> {
    let (host, port) = match route {
        Route::Forwarded { local_addr } => (local_addr.ip().to_string(), local_addr.port()),
        Route::Direct | Route::Transport { .. } => (params.host.trim().to_string(), params.port),
    };
    let transport = match route {
        Route::Transport { name } => Some(name.clone()),
        _ => None,
    };

    let (dsn, redacted) = match params.engine {
        DatabaseType::MySQL => (
            mysql_url(params, &host, port, &params.password)?,
            mysql_url(params, &host, port, REDACTED)?,
        ),
        DatabaseType::PostgreSQL => (
            postgres_kv(params, &host, port, &params.password),
            postgres_kv(params, &host, port, REDACTED),
        ),
    };

    Ok(ConnectionString {
        engine: params.engine,
        dsn,
        transport,
        redacted,
    })
}

fn mysql_url(
    params: &ConnectionParameters,
    host: &str,
    port: u16,
    password: &str,
) -> Result<String, ConnectError> {
    let invalid = |what: &str| ConnectError::InvalidParameters(format!("cannot use {what} in a MySQL URL"));

    let mut url = Url::parse("mysql://localhost").map_err(|_| invalid("the base URL"))?;
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    url.set_host(Some(&host)).map_err(|_| invalid("this host"))?;
    url.set_port(Some(port)).map_err(|_| invalid("this port"))?;
    url.set_username(&params.user).map_err(|_| invalid("this user"))?;
    if !password.is_empty() {
        url.set_password(Some(password))
            .map_err(|_| invalid("this password"))?;
    }
    if params.has_database() {
        url.path_segments_mut()
            .map_err(|_| invalid("a database path"))?
            .push(params.database.trim());
    }
    Ok(url.to_string())
}

fn postgres_kv(params: &ConnectionParameters, host: &str, port: u16, password: &str) -> String {
    let mut parts = vec![
        format!("host={}", quote(host)),
        format!("port={port}"),
        format!("user={}", quote(&params.user)),
    ];
    if !password.is_empty() {
        parts.push(format!("password={}", quote(password)));
    }
    if params.has_database() {
        parts.push(format!("dbname={}", quote(params.database.trim())));
    }
    parts.push("sslmode=disable".to_string());
    parts.push(format!("application_name={APPLICATION_NAME}"));
    parts.join(" ")
}

/// Single-quote a libpq key/value value, escaping quotes and backslashes.
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}
