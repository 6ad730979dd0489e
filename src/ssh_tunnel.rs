//! Password-authenticated SSH sessions used as a dialer.
//!
//! One [`TunnelSession`] per connect attempt. Every `dial` opens a fresh
//! `direct-tcpip` channel on the same session, so pooled database
//! connections share the one SSH transport.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use russh::client::{self, Config, Handle};

use crate::dialer::{BoxedStream, Dialer};
use crate::errors::ConnectError;
use crate::models::structs::{TunnelParameters, split_host_port};

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

static OPEN_SESSIONS: AtomicUsize = AtomicUsize::new(0);

/// Number of tunnel sessions opened and not yet closed, process-wide.
pub fn open_sessions() -> usize {
    OPEN_SESSIONS.load(Ordering::SeqCst)
}

struct TunnelHandler {
    endpoint: String,
}

impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // No known_hosts store: every host key is accepted
        warn!(
            "Accepting unverified {} host key from {}",
            server_public_key.algorithm().as_str(),
            self.endpoint
        );
        Ok(true)
    }
}

pub struct TunnelSession {
    handle: Handle<TunnelHandler>,
    endpoint: String,
    closed: AtomicBool,
}

impl TunnelSession {
    /// Connect, handshake and authenticate with the password. Each phase gets
    /// `timeout`.
    pub async fn open(
        params: &TunnelParameters,
        timeout: Duration,
    ) -> Result<Arc<TunnelSession>, ConnectError> {
        let endpoint = params.endpoint();
        info!("Opening SSH tunnel to {} as {}", endpoint, params.user);

        let config = Arc::new(Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let handler = TunnelHandler {
            endpoint: endpoint.clone(),
        };

        let mut handle = tokio::time::timeout(
            timeout,
            client::connect(config, (params.host.trim(), params.port), handler),
        )
        .await
        .map_err(|_| ConnectError::TunnelConnect {
            endpoint: endpoint.clone(),
            reason: format!("connection timed out after {:?}", timeout),
        })?
        .map_err(|e| ConnectError::TunnelConnect {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;

        let auth = tokio::time::timeout(
            timeout,
            handle.authenticate_password(&params.user, &params.password),
        )
        .await;
        let failure = match auth {
            Ok(Ok(result)) if result.success() => None,
            Ok(Ok(_)) => Some(ConnectError::Authentication {
                user: params.user.clone(),
                endpoint: endpoint.clone(),
            }),
            Ok(Err(e)) => Some(ConnectError::TunnelConnect {
                endpoint: endpoint.clone(),
                reason: format!("authentication aborted: {e}"),
            }),
            Err(_) => Some(ConnectError::TunnelConnect {
                endpoint: endpoint.clone(),
                reason: format!("authentication timed out after {:?}", timeout),
            }),
        };
        if let Some(e) = failure {
            // Never leave a half-open session behind
            disconnect(&handle, &endpoint).await;
            return Err(e);
        }

        OPEN_SESSIONS.fetch_add(1, Ordering::SeqCst);
        info!("SSH tunnel to {} established", endpoint);
        Ok(Arc::new(TunnelSession {
            handle,
            endpoint,
            closed: AtomicBool::new(false),
        }))
    }

    /// Disconnect the session. Later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        disconnect(&self.handle, &self.endpoint).await;
        OPEN_SESSIONS.fetch_sub(1, Ordering::SeqCst);
        info!("SSH tunnel to {} closed", self.endpoint);
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        // Dropping the handle ends the session task; keep the count honest
        if !self.closed.swap(true, Ordering::SeqCst) {
            OPEN_SESSIONS.fetch_sub(1, Ordering::SeqCst);
            debug!("SSH tunnel to {} dropped without close", self.endpoint);
        }
    }
}

async fn disconnect(handle: &Handle<TunnelHandler>, endpoint: &str) {
    match tokio::time::timeout(
        DISCONNECT_TIMEOUT,
        handle.disconnect(russh::Disconnect::ByApplication, "", "en"),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("SSH disconnect from {} failed: {}", endpoint, e),
        Err(_) => warn!("Timed out disconnecting from {}", endpoint),
    }
}

#[async_trait]
impl Dialer for TunnelSession {
    async fn dial(&self, target: &str) -> io::Result<BoxedStream> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("tunnel to {} is closed", self.endpoint),
            ));
        }
        let (host, port) = split_host_port(target).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid dial target '{target}'"),
            )
        })?;

        let channel = self
            .handle
            .channel_open_direct_tcpip(host.as_str(), u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("tunnel {} could not reach {}: {}", self.endpoint, target, e),
                )
            })?;
        debug!("Opened channel to {} via {}", target, self.endpoint);
        Ok(Box::new(channel.into_stream()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn bastion(port: u16) -> TunnelParameters {
        TunnelParameters {
            host: "127.0.0.1".to_string(),
            port,
            user: "ops".to_string(),
            password: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn test_silent_bastion_times_out() {
        // Accepts TCP but never speaks SSH
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let started = std::time::Instant::now();
        let result = TunnelSession::open(&bastion(port), Duration::from_millis(300)).await;
        assert!(matches!(result, Err(ConnectError::TunnelConnect { .. })));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_refused_bastion_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TunnelSession::open(&bastion(port), Duration::from_secs(2)).await;
        match result {
            Err(ConnectError::TunnelConnect { endpoint, .. }) => {
                assert_eq!(endpoint, format!("127.0.0.1:{port}"));
            }
            other => panic!("expected TunnelConnect, got {:?}", other.err()),
        }
    }
}
