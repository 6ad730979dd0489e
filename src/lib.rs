pub mod config;
pub mod connection;
pub mod dialer;
pub mod driver_mysql;
pub mod driver_postgres;
pub mod dsn;
pub mod errors;
pub mod forward_proxy;
pub mod models;
pub mod query;
pub mod ssh_tunnel;

pub use config::{ConnectionStore, ConnectorSettings, PoolLimits};
pub use connection::{CloseHandle, ConnectionBroker, OpenConnection};
pub use errors::{ConfigError, ConnectError, QueryError};
pub use models::enums::{ConnectState, DatabaseType, Route};
pub use models::structs::{ConnectionParameters, SavedConnection, TunnelParameters};

/// Load `.env` and install the logger. Our own modules log at debug unless
/// `RUST_LOG` says otherwise; calling this twice is harmless.
pub fn init_logging() {
    dotenv::dotenv().ok();
    let _ = env_logger::Builder::from_default_env()
        .filter_module("kymar", log::LevelFilter::Debug)
        .is_test(false)
        .try_init();
}
