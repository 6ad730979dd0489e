//! PostgreSQL over tokio-postgres, pooled with deadpool-postgres.
//!
//! tokio-postgres will speak the protocol over any stream handed to
//! `Config::connect_raw`, which is what makes the named transport table below
//! possible: a connection string can ask for transport `ssh` and every pooled
//! connection is then dialed by whatever was registered under that name.
//!
//! deadpool caps open connections. It has no idle cap or lifetime cap, so
//! [`PgPool`] trims its idle slots around every checkout.

use std::cell::Cell;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, PoolError, RecyclingMethod};
use log::debug;
use once_cell::sync::Lazy;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};

use crate::config::PoolLimits;
use crate::dialer::{BoxedStream, Dialer, DirectDialer};
use crate::models::structs::{QueryResult, format_host_port};

#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error("invalid connection string: {0}")]
    InvalidDsn(String),
    #[error("unknown transport '{0}'")]
    UnknownTransport(String),
    #[error("transport '{0}' is already registered")]
    TransportExists(String),
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),
    #[error(transparent)]
    Pool(PoolError),
    #[error("cannot build pool: {0}")]
    Build(#[from] deadpool_postgres::BuildError),
    #[error("pool is closed")]
    PoolClosed,
}

impl From<PoolError> for DriverError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Closed => DriverError::PoolClosed,
            other => DriverError::Pool(other),
        }
    }
}

/// `e` followed by every cause not already spelled out in its message.
/// tokio-postgres keeps the underlying I/O error out of its own `Display`.
pub fn describe(e: &(dyn std::error::Error + 'static)) -> String {
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        let part = cause.to_string();
        if !text.contains(&part) {
            text.push_str(": ");
            text.push_str(&part);
        }
        source = cause.source();
    }
    text
}

static TRANSPORTS: Lazy<RwLock<HashMap<String, Arc<dyn Dialer>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a dialer under `name`. A name can only be registered once per
/// process.
pub fn register_transport(name: &str, dialer: Arc<dyn Dialer>) -> Result<(), DriverError> {
    let mut table = TRANSPORTS.write().unwrap_or_else(|e| e.into_inner());
    if table.contains_key(name) {
        return Err(DriverError::TransportExists(name.to_string()));
    }
    table.insert(name.to_string(), dialer);
    Ok(())
}

pub fn lookup_transport(name: &str) -> Option<Arc<dyn Dialer>> {
    TRANSPORTS
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(name)
        .cloned()
}

/// How pooled connections reach the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Named(String),
}

/// Dials every new pooled connection, by name or over plain TCP.
struct TransportConnect {
    target: String,
    transport: Transport,
    direct: DirectDialer,
}

impl TransportConnect {
    async fn dial(&self) -> io::Result<BoxedStream> {
        match &self.transport {
            Transport::Tcp => self.direct.dial(&self.target).await,
            Transport::Named(name) => match lookup_transport(name) {
                Some(dialer) => dialer.dial(&self.target).await,
                None => Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("unknown transport '{name}'"),
                )),
            },
        }
    }
}

type ConnectFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(Client, JoinHandle<()>), tokio_postgres::Error>> + Send + 'a>>;

impl deadpool_postgres::Connect for TransportConnect {
    fn connect(&self, pg_config: &tokio_postgres::Config) -> ConnectFuture<'_> {
        let pg_config = pg_config.clone();
        Box::pin(async move {
            let stream: BoxedStream = match self.dial().await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("Dial to {} failed: {}", self.target, e);
                    Box::new(DialFailed(Some(e)))
                }
            };
            let (client, connection) = pg_config.connect_raw(stream, NoTls).await?;
            let target = self.target.clone();
            let task = tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!("PostgreSQL connection to {} ended: {}", target, e);
                }
            });
            debug!("Opened PostgreSQL connection to {}", self.target);
            Ok((client, task))
        })
    }
}

/// Stands in for a stream that could not be dialed. The startup write fails
/// with the dial error, which tokio-postgres reports as an I/O error.
struct DialFailed(Option<io::Error>);

impl DialFailed {
    fn take(&mut self) -> io::Error {
        self.0
            .take()
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "dial failed"))
    }
}

impl AsyncRead for DialFailed {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(self.get_mut().take()))
    }
}

impl AsyncWrite for DialFailed {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(self.get_mut().take()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(self.get_mut().take()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[derive(Clone)]
pub struct PgPool {
    pool: Pool,
    target: String,
    limits: PoolLimits,
}

impl std::fmt::Debug for PgPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgPool")
            .field("target", &self.target)
            .field("status", &self.pool.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PgPool {
    /// Parse `dsn` and build a pool without connecting; the first `acquire`
    /// dials.
    pub fn open_lazy(
        dsn: &str,
        transport: Transport,
        limits: PoolLimits,
        dial_timeout: Duration,
    ) -> Result<Self, DriverError> {
        let config = tokio_postgres::Config::from_str(dsn)
            .map_err(|e| DriverError::InvalidDsn(e.to_string()))?;

        let target = match (config.get_hosts().first(), config.get_ports().first()) {
            (Some(tokio_postgres::config::Host::Tcp(host)), port) => {
                format_host_port(host, port.copied().unwrap_or(5432))
            }
            _ => {
                return Err(DriverError::InvalidDsn(
                    "a TCP host is required".to_string(),
                ));
            }
        };

        if let Transport::Named(name) = &transport
            && lookup_transport(name).is_none()
        {
            return Err(DriverError::UnknownTransport(name.clone()));
        }

        let connect = TransportConnect {
            target: target.clone(),
            transport,
            direct: DirectDialer::new(dial_timeout),
        };
        let manager = Manager::from_connect(
            config,
            connect,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(limits.max_open.max(1))
            .build()?;

        Ok(Self {
            pool,
            target,
            limits,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Connections sitting in the pool, not checked out.
    pub fn idle_count(&self) -> usize {
        self.pool.status().available
    }

    /// Drop idle connections past the lifetime cap, then all but the first
    /// `max_idle` of the rest.
    fn trim_idle(&self) {
        let max_lifetime = self.limits.max_lifetime;
        let max_idle = self.limits.max_idle;
        let kept = Cell::new(0usize);
        self.pool.retain(|_, metrics| {
            if metrics.age() >= max_lifetime || kept.get() >= max_idle {
                return false;
            }
            kept.set(kept.get() + 1);
            true
        });
    }

    pub async fn acquire(&self) -> Result<Object, DriverError> {
        if self.is_closed() {
            return Err(DriverError::PoolClosed);
        }
        self.trim_idle();
        Ok(self.pool.get().await?)
    }

    /// Run `sql` with the simple protocol on a pooled connection, then trim
    /// the idle slots it went back to.
    async fn simple_query(&self, sql: &str) -> Result<Vec<SimpleQueryMessage>, DriverError> {
        let messages = {
            let client = self.acquire().await?;
            client.simple_query(sql).await?
        };
        self.trim_idle();
        Ok(messages)
    }

    /// Round trip on a pooled connection.
    pub async fn ping(&self) -> Result<(), DriverError> {
        self.simple_query("SELECT 1").await?;
        Ok(())
    }

    /// Every value comes back as text.
    pub async fn query(&self, sql: &str) -> Result<QueryResult, DriverError> {
        let messages = self.simple_query(sql).await?;

        let mut headers: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<String>> = Vec::new();
        for message in messages {
            match message {
                SimpleQueryMessage::RowDescription(columns) if headers.is_empty() => {
                    headers = columns.iter().map(|c| c.name().to_string()).collect();
                }
                SimpleQueryMessage::Row(row) => {
                    if headers.is_empty() {
                        headers = row.columns().iter().map(|c| c.name().to_string()).collect();
                    }
                    let values = (0..row.len())
                        .map(|i| row.get(i).unwrap_or("NULL").to_string())
                        .collect();
                    rows.push(values);
                }
                _ => {}
            }
        }
        Ok((headers, rows))
    }

    /// Run `sql` and return the rows affected, summed over all statements.
    pub async fn exec(&self, sql: &str) -> Result<u64, DriverError> {
        let messages = self.simple_query(sql).await?;
        Ok(messages
            .iter()
            .map(|m| match m {
                SimpleQueryMessage::CommandComplete(n) => *n,
                _ => 0,
            })
            .sum())
    }

    /// Stop handing out connections and drop the idle ones. Connections
    /// currently checked out are dropped when returned.
    pub async fn close(&self) {
        if self.pool.is_closed() {
            return;
        }
        let idle = self.idle_count();
        self.pool.close();
        debug!(
            "Closed PostgreSQL pool for {} ({} idle connections dropped)",
            self.target, idle
        );
    }
}
