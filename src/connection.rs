//! Connection establishment: optional SSH tunnel, per-engine routing, lazy
//! pool, liveness check, and the composite close that undoes all of it.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Mutex, RwLock};

use crate::config::ConnectorSettings;
use crate::dialer::{self, Dialer, SSH_TRANSPORT, TunnelResolver};
use crate::driver_mysql;
use crate::driver_postgres::{PgPool, Transport};
use crate::dsn;
use crate::errors::{ConnectError, QueryError};
use crate::forward_proxy::ForwardProxy;
use crate::models::enums::{ConnectState, DatabasePool, DatabaseType, Route, StatementKind};
use crate::models::structs::{ConnectionParameters, QueryResult};
use crate::query::{self, StatementOutcome};
use crate::ssh_tunnel::TunnelSession;

/// Swappable so `use_database` can replace the pool in place.
type PoolSlot = Arc<RwLock<Option<DatabasePool>>>;

/// Everything one connect attempt created, in the order it is torn down.
struct Resources {
    pool: PoolSlot,
    proxy: Option<ForwardProxy>,
    /// Set only when this attempt installed its tunnel as the current one.
    registered: Option<Arc<dyn Dialer>>,
    tunnel: Option<Arc<TunnelSession>>,
}

impl Resources {
    fn new() -> Self {
        Self {
            pool: Arc::new(RwLock::new(None)),
            proxy: None,
            registered: None,
            tunnel: None,
        }
    }
}

/// Releases a connection's pool, forwarder and tunnel. Clones share state;
/// only the first `close` does anything.
#[derive(Clone)]
pub struct CloseHandle {
    parts: Arc<Mutex<Option<Resources>>>,
    pool_close_timeout: Duration,
}

impl CloseHandle {
    fn new(resources: Resources, pool_close_timeout: Duration) -> Self {
        Self {
            parts: Arc::new(Mutex::new(Some(resources))),
            pool_close_timeout,
        }
    }

    /// Close the pool, stop the forwarder, release the current-tunnel cell
    /// if this connection holds it, then disconnect the tunnel.
    pub async fn close(&self) -> Result<(), ConnectError> {
        let Some(resources) = self.parts.lock().await.take() else {
            debug!("Connection already closed");
            return Ok(());
        };

        let mut failure = None;

        let pool = resources.pool.write().await.take();
        if let Some(pool) = pool
            && tokio::time::timeout(self.pool_close_timeout, pool.close())
                .await
                .is_err()
        {
            warn!("{} pool did not close within {:?}", pool.engine(), self.pool_close_timeout);
            failure = Some(ConnectError::Close(format!(
                "{} pool did not close within {:?}",
                pool.engine(),
                self.pool_close_timeout
            )));
        }

        if let Some(proxy) = &resources.proxy {
            proxy.shutdown().await;
        }

        if let Some(registered) = &resources.registered
            && !dialer::clear_current_tunnel(registered)
        {
            debug!("Current tunnel was replaced by a later connection; leaving it");
        }

        if let Some(tunnel) = &resources.tunnel {
            tunnel.close().await;
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.parts.lock().await.is_none()
    }
}

/// Logs every state change of one connect attempt.
struct Progress {
    engine: DatabaseType,
    state: ConnectState,
}

impl Progress {
    fn new(engine: DatabaseType) -> Self {
        Self {
            engine,
            state: ConnectState::Idle,
        }
    }

    fn advance(&mut self, next: ConnectState) {
        debug!("{} connect: {:?} -> {:?}", self.engine, self.state, next);
        self.state = next;
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionBroker {
    settings: ConnectorSettings,
}

impl ConnectionBroker {
    pub fn new(settings: ConnectorSettings) -> Self {
        Self { settings }
    }

    /// Open a verified connection for `params`. On error every resource
    /// created along the way has already been released.
    ///
    /// PostgreSQL connections through a tunnel share one process-wide
    /// current-tunnel cell; callers must not run two of them concurrently.
    pub async fn connect(&self, params: &ConnectionParameters) -> Result<OpenConnection, ConnectError> {
        let engine = params.engine;
        let mut progress = Progress::new(engine);

        params.validate()?;
        if params.use_tunnel() && !engine.supports_custom_transport() && !self.settings.allow_forward_proxy {
            return Err(ConnectError::UnsupportedCombination {
                engine,
                reason: "the driver cannot use a custom transport and local forwarding is disabled",
            });
        }

        let mut resources = Resources::new();
        match self.establish(params, &mut resources, &mut progress).await {
            Ok(route) => {
                progress.advance(ConnectState::Open);
                info!("Connected to {} at {} ({})", engine, params.target(), route);
                let pool = resources.pool.clone();
                Ok(OpenConnection {
                    engine,
                    route,
                    database: StdMutex::new(params.database.trim().to_string()),
                    settings: self.settings.clone(),
                    pool,
                    closer: CloseHandle::new(resources, self.settings.ping_timeout),
                    state: StdMutex::new(ConnectState::Open),
                })
            }
            Err(e) => {
                progress.advance(ConnectState::Error);
                warn!("{} connect to {} failed: {}", engine, params.target(), e);
                let closer = CloseHandle::new(resources, self.settings.ping_timeout);
                if let Err(close_err) = closer.close().await {
                    warn!("Cleanup after failed connect: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        params: &ConnectionParameters,
        resources: &mut Resources,
        progress: &mut Progress,
    ) -> Result<Route, ConnectError> {
        let engine = params.engine;
        let settings = &self.settings;

        let route = match &params.tunnel {
            None => Route::Direct,
            Some(tunnel_params) => {
                progress.advance(ConnectState::TunnelEstablishing);
                let tunnel = TunnelSession::open(tunnel_params, settings.tunnel_timeout).await?;
                resources.tunnel = Some(tunnel.clone());
                let tunnel: Arc<dyn Dialer> = tunnel;

                if engine.supports_custom_transport() {
                    let resolver = Arc::new(TunnelResolver::new(settings.tunnel_timeout));
                    dialer::register_once(SSH_TRANSPORT, resolver);
                    dialer::set_current_tunnel(tunnel.clone());
                    resources.registered = Some(tunnel);
                    Route::Transport {
                        name: SSH_TRANSPORT.to_string(),
                    }
                } else {
                    progress.advance(ConnectState::ProxyStarting);
                    let proxy = ForwardProxy::start(params.target(), tunnel).await?;
                    let local_addr = proxy.local_addr();
                    resources.proxy = Some(proxy);
                    Route::Forwarded { local_addr }
                }
            }
        };

        progress.advance(ConnectState::DriverOpening);
        let conn_str = dsn::build(params, &route)?;
        debug!("Opening {} pool: {}", engine, conn_str);
        let driver_open = |reason: String| ConnectError::DriverOpen { engine, reason };
        let pool = match engine {
            DatabaseType::MySQL => DatabasePool::MySQL(
                driver_mysql::open_lazy(conn_str.as_str(), settings.pool, settings.ping_timeout)
                    .map_err(|e| driver_open(e.to_string()))?,
            ),
            DatabaseType::PostgreSQL => {
                let transport = match &conn_str.transport {
                    Some(name) => Transport::Named(name.clone()),
                    None => Transport::Tcp,
                };
                DatabasePool::PostgreSQL(
                    PgPool::open_lazy(conn_str.as_str(), transport, settings.pool, settings.tunnel_timeout)
                        .map_err(|e| driver_open(e.to_string()))?,
                )
            }
        };
        *resources.pool.write().await = Some(pool.clone());

        progress.advance(ConnectState::Pinging);
        match tokio::time::timeout(settings.ping_timeout, pool.ping()).await {
            Ok(Ok(())) => Ok(route),
            Ok(Err(reason)) => Err(ConnectError::Liveness { engine, reason }),
            Err(_) => Err(ConnectError::Liveness {
                engine,
                reason: format!("no answer within {:?}", settings.ping_timeout),
            }),
        }
    }
}

/// A verified connection. Dropping it without `close` releases the
/// current-tunnel cell and leaves the pool, forwarder and tunnel to their own
/// destructors.
pub struct OpenConnection {
    engine: DatabaseType,
    route: Route,
    database: StdMutex<String>,
    settings: ConnectorSettings,
    pool: PoolSlot,
    closer: CloseHandle,
    state: StdMutex<ConnectState>,
}

impl std::fmt::Debug for OpenConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenConnection")
            .field("engine", &self.engine)
            .field("route", &self.route)
            .field("database", &self.database())
            .field("state", &self.state())
            .finish()
    }
}

impl OpenConnection {
    pub fn engine(&self) -> DatabaseType {
        self.engine
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Currently selected database; empty at server level.
    pub fn database(&self) -> String {
        self.database.lock().map(|db| db.clone()).unwrap_or_default()
    }

    pub fn state(&self) -> ConnectState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectState::Error)
    }

    /// A handle that can close this connection from elsewhere.
    pub fn close_handle(&self) -> CloseHandle {
        self.closer.clone()
    }

    async fn current_pool(&self) -> Result<DatabasePool, QueryError> {
        self.pool.read().await.clone().ok_or(QueryError::Closed)
    }

    pub async fn query(&self, sql: &str) -> Result<QueryResult, QueryError> {
        let pool = self.current_pool().await?;
        query::with_deadline(self.settings.query_timeout, pool.query(sql)).await
    }

    pub async fn exec(&self, sql: &str) -> Result<u64, QueryError> {
        let pool = self.current_pool().await?;
        query::with_deadline(self.settings.query_timeout, pool.exec(sql)).await
    }

    /// `query` or `exec` depending on what `sql` looks like.
    pub async fn run(&self, sql: &str) -> Result<StatementOutcome, QueryError> {
        match query::classify(sql) {
            StatementKind::Rows => self.query(sql).await.map(StatementOutcome::Rows),
            StatementKind::Command => self.exec(sql).await.map(StatementOutcome::Affected),
        }
    }

    /// Databases at server level, tables once a database is selected. For
    /// PostgreSQL, the base tables of the `public` schema.
    pub async fn list_objects(&self) -> Result<Vec<String>, QueryError> {
        let pool = self.current_pool().await?;
        let has_database = !self.database().is_empty();
        let sql = query::catalog_statement(self.engine, has_database);
        let (_, rows) = query::with_deadline(self.settings.catalog_timeout, pool.query(sql)).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .collect())
    }

    /// Make `name` the default database for every pooled connection. MySQL
    /// only. The old pool is closed once the new one answers.
    pub async fn use_database(&self, name: &str) -> Result<(), QueryError> {
        let name = name.trim();
        let old = match self.current_pool().await? {
            DatabasePool::MySQL(pool) => pool,
            DatabasePool::PostgreSQL(_) => {
                return Err(QueryError::Unsupported {
                    engine: self.engine,
                    what: "switching databases on an open connection",
                });
            }
        };
        if name.is_empty() {
            return Err(QueryError::Database("database name cannot be empty".to_string()));
        }

        let switched = DatabasePool::MySQL(driver_mysql::with_database(&old, name));
        let use_sql = format!("USE {}", query::quote_mysql_identifier(name));
        if let Err(e) = query::with_deadline(self.settings.switch_timeout, switched.exec(&use_sql)).await {
            switched.close().await;
            return Err(e);
        }

        {
            let mut slot = self.pool.write().await;
            if slot.is_none() {
                drop(slot);
                switched.close().await;
                return Err(QueryError::Closed);
            }
            *slot = Some(switched);
        }
        if let Ok(mut db) = self.database.lock() {
            *db = name.to_string();
        }
        info!("Switched MySQL database to {}", name);
        old.close().await;
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), QueryError> {
        let pool = self.current_pool().await?;
        query::with_deadline(self.settings.ping_timeout, pool.ping()).await
    }

    /// Composite close; calling it again is a no-op.
    pub async fn close(&self) -> Result<(), ConnectError> {
        let result = self.closer.close().await;
        if let Ok(mut state) = self.state.lock()
            && *state == ConnectState::Open
        {
            debug!("{} connection: Open -> Closed", self.engine);
            *state = ConnectState::Closed;
        }
        result
    }
}

impl Drop for OpenConnection {
    fn drop(&mut self) {
        // A detached CloseHandle still owns teardown
        if Arc::strong_count(&self.closer.parts) > 1 {
            return;
        }
        if let Ok(mut parts) = self.closer.parts.try_lock()
            && let Some(resources) = parts.as_mut()
        {
            warn!("{} connection dropped without close", self.engine);
            // The cell would otherwise keep the tunnel alive
            if let Some(registered) = resources.registered.take() {
                dialer::clear_current_tunnel(&registered);
            }
        }
    }
}
