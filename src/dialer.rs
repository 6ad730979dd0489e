//! Dial abstraction and the process-wide transport registry.
//!
//! A [`Dialer`] turns a `host:port` target into a byte stream. Tunnel
//! sessions, plain TCP and the registry resolver all implement it, so the
//! forwarder and the PostgreSQL driver never need to know which one they got.
//!
//! The registry keeps one "current tunnel" cell shared by every dial that goes
//! through a registered transport name. The driver resolves the transport by
//! name when a pooled connection is opened, so there is no per-connection
//! context to carry the tunnel through; the cell is read at dial time
//! instead. Two concurrent PostgreSQL connects through different tunnels
//! would race on the cell and must be serialised by the caller.

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use once_cell::sync::Lazy;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::driver_postgres;

/// Transport name the broker registers for tunneled PostgreSQL connections.
pub const SSH_TRANSPORT: &str = "ssh";

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &str) -> io::Result<BoxedStream>;
}

/// Plain TCP with a connect deadline.
#[derive(Clone, Debug)]
pub struct DirectDialer {
    timeout: Duration,
}

impl DirectDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn connect(&self, target: &str) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(target))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {target} timed out after {:?}", self.timeout),
                )
            })??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self::new(DIAL_TIMEOUT)
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, target: &str) -> io::Result<BoxedStream> {
        Ok(Box::new(self.connect(target).await?))
    }
}

static CURRENT_TUNNEL: Lazy<RwLock<Option<Arc<dyn Dialer>>>> = Lazy::new(|| RwLock::new(None));

static INSTALLED: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// What gets registered under a transport name: the current tunnel if there
/// is one, direct TCP otherwise.
pub struct TunnelResolver {
    fallback: DirectDialer,
}

impl TunnelResolver {
    pub fn new(timeout: Duration) -> Self {
        Self {
            fallback: DirectDialer::new(timeout),
        }
    }
}

#[async_trait]
impl Dialer for TunnelResolver {
    async fn dial(&self, target: &str) -> io::Result<BoxedStream> {
        match current_tunnel() {
            Some(tunnel) => tunnel.dial(target).await,
            None => {
                debug!("No active tunnel, dialing {} directly", target);
                self.fallback.dial(target).await
            }
        }
    }
}

/// Install `resolver` under `name` with the PostgreSQL driver. Only the first
/// call per name does anything; returns whether this call installed it.
pub fn register_once(name: &str, resolver: Arc<dyn Dialer>) -> bool {
    let mut installed = INSTALLED.lock().unwrap_or_else(|e| e.into_inner());
    if !installed.insert(name.to_string()) {
        return false;
    }
    match driver_postgres::register_transport(name, resolver) {
        Ok(()) => {
            debug!("Registered transport '{}'", name);
            true
        }
        Err(e) => {
            // Someone reached the driver table without going through this gate
            warn!("Transport '{}' was already known to the driver: {}", name, e);
            false
        }
    }
}

pub fn is_registered(name: &str) -> bool {
    INSTALLED
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .contains(name)
}

/// Make `tunnel` the target of every registry dial from now on, replacing
/// whatever was there.
pub fn set_current_tunnel(tunnel: Arc<dyn Dialer>) {
    let mut current = CURRENT_TUNNEL.write().unwrap_or_else(|e| e.into_inner());
    if current.is_some() {
        debug!("Replacing current tunnel");
    }
    *current = Some(tunnel);
}

/// Clear the cell, but only if it still holds `tunnel`. Returns whether it did.
pub fn clear_current_tunnel(tunnel: &Arc<dyn Dialer>) -> bool {
    let mut current = CURRENT_TUNNEL.write().unwrap_or_else(|e| e.into_inner());
    match current.as_ref() {
        Some(existing) if same_dialer(existing, tunnel) => {
            *current = None;
            true
        }
        _ => false,
    }
}

pub fn current_tunnel() -> Option<Arc<dyn Dialer>> {
    CURRENT_TUNNEL
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

fn same_dialer(a: &Arc<dyn Dialer>, b: &Arc<dyn Dialer>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
