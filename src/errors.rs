use std::time::Duration;

use crate::models::enums::DatabaseType;

/// Everything `ConnectionBroker::connect` can fail with. Resources created
/// before the failing step are already released when one of these is returned.
#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    #[error("SSH authentication failed for {user}@{endpoint}")]
    Authentication { user: String, endpoint: String },
    #[error("SSH tunnel to {endpoint} failed: {reason}")]
    TunnelConnect { endpoint: String, reason: String },
    #[error("failed to bind local forwarder: {0}")]
    ProxyBind(#[source] std::io::Error),
    #[error("{engine} driver rejected the connection: {reason}")]
    DriverOpen { engine: DatabaseType, reason: String },
    #[error("{engine} liveness check failed: {reason}")]
    Liveness { engine: DatabaseType, reason: String },
    #[error("tunneling is not available for {engine} ({reason})")]
    UnsupportedCombination { engine: DatabaseType, reason: &'static str },
    #[error("invalid connection parameters: {0}")]
    InvalidParameters(String),
    #[error("teardown failed: {0}")]
    Close(String),
}

#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    #[error("query failed: {0}")]
    Database(String),
    #[error("connection is closed")]
    Closed,
    #[error("not supported for {engine}: {what}")]
    Unsupported { engine: DatabaseType, what: &'static str },
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("config i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cannot determine home directory")]
    NoHomeDir,
}
