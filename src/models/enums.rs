use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use sqlx::mysql::MySqlPool;

use crate::driver_postgres::PgPool;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
pub enum DatabaseType {
    #[serde(rename = "mysql")]
    MySQL,
    #[serde(rename = "postgres")]
    PostgreSQL,
}

impl DatabaseType {
    pub fn default_port(&self) -> u16 {
        match self {
            DatabaseType::MySQL => 3306,
            DatabaseType::PostgreSQL => 5432,
        }
    }

    /// Whether the client library for this engine can be handed a
    /// caller-supplied byte stream instead of dialing TCP itself.
    pub fn supports_custom_transport(&self) -> bool {
        match self {
            // sqlx dials its own sockets
            DatabaseType::MySQL => false,
            // tokio-postgres connect_raw
            DatabaseType::PostgreSQL => true,
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseType::MySQL => f.write_str("MySQL"),
            DatabaseType::PostgreSQL => f.write_str("PostgreSQL"),
        }
    }
}

/// A pool for either engine. Cloning is cheap; clones share connections.
#[derive(Clone, Debug)]
pub enum DatabasePool {
    MySQL(MySqlPool),
    PostgreSQL(PgPool),
}

/// How an open connection reaches its server.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Route {
    Direct,
    /// Dials go through a transport registered by name with the driver.
    Transport { name: String },
    /// The driver talks to a local forwarder that relays over the tunnel.
    Forwarded { local_addr: SocketAddr },
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Direct => f.write_str("direct"),
            Route::Transport { name } => write!(f, "transport '{name}'"),
            Route::Forwarded { local_addr } => write!(f, "forwarded via {local_addr}"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnectState {
    Idle,
    TunnelEstablishing,
    ProxyStarting,
    DriverOpening,
    Pinging,
    Open,
    Error,
    Closed,
}

/// Coarse statement classification used to pick between a row-returning
/// query and an exec.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StatementKind {
    Rows,
    Command,
}
