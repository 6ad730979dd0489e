//! Loopback TCP forwarder for drivers that can only dial plain TCP.
//!
//! The proxy listens on `127.0.0.1:<ephemeral>` and bridges every accepted
//! socket to one fixed target through a [`Dialer`], usually a tunnel session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dialer::Dialer;
use crate::errors::ConnectError;

static OPEN_PROXIES: AtomicUsize = AtomicUsize::new(0);

/// Number of forwarders started and not yet shut down, process-wide.
pub fn open_proxies() -> usize {
    OPEN_PROXIES.load(Ordering::SeqCst)
}

pub struct ForwardProxy {
    local_addr: SocketAddr,
    target: String,
    token: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    active: Arc<AtomicUsize>,
    stopped: AtomicBool,
}

impl ForwardProxy {
    /// Bind the listener and start accepting. Returns once the local address
    /// is known.
    pub async fn start(
        target: impl Into<String>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<ForwardProxy, ConnectError> {
        let target = target.into();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(ConnectError::ProxyBind)?;
        let local_addr = listener.local_addr().map_err(ConnectError::ProxyBind)?;

        let token = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            target.clone(),
            dialer,
            token.clone(),
            active.clone(),
        ));

        OPEN_PROXIES.fetch_add(1, Ordering::SeqCst);
        info!("Forwarding {} -> {}", local_addr, target);
        Ok(ForwardProxy {
            local_addr,
            target,
            token,
            accept_task: Mutex::new(Some(accept_task)),
            active,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Bridges currently copying bytes.
    pub fn active_bridges(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop accepting. Sockets still waiting on their dial are dropped;
    /// established bridges drain on their own. Returns after the listener is
    /// closed. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        if let Some(task) = self.accept_task.lock().await.take()
            && let Err(e) = task.await
        {
            warn!("Forwarder accept task for {} ended abnormally: {}", self.local_addr, e);
        }
        OPEN_PROXIES.fetch_sub(1, Ordering::SeqCst);
        info!("Forwarder {} stopped", self.local_addr);
    }
}

impl Drop for ForwardProxy {
    fn drop(&mut self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.token.cancel();
            OPEN_PROXIES.fetch_sub(1, Ordering::SeqCst);
            debug!("Forwarder {} dropped without shutdown", self.local_addr);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    target: String,
    dialer: Arc<dyn Dialer>,
    token: CancellationToken,
    active: Arc<AtomicUsize>,
) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((socket, peer)) => {
                debug!("Forwarder accepted {}", peer);
                tokio::spawn(bridge(
                    socket,
                    target.clone(),
                    dialer.clone(),
                    token.clone(),
                    active.clone(),
                ));
            }
            Err(e) => {
                // Transient (e.g. fd exhaustion); the listener is still usable
                warn!("Forwarder accept failed: {}", e);
            }
        }
    }
    // Listener dropped here, so the port refuses from now on
}

/// One accepted socket. A failed dial only drops this socket.
async fn bridge(
    mut socket: TcpStream,
    target: String,
    dialer: Arc<dyn Dialer>,
    token: CancellationToken,
    active: Arc<AtomicUsize>,
) {
    let upstream = tokio::select! {
        _ = token.cancelled() => return,
        dialed = dialer.dial(&target) => match dialed {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Forwarder could not reach {}: {}", target, e);
                return;
            }
        },
    };

    // Established bridges drain on their own; shutdown only stops new ones
    active.fetch_add(1, Ordering::SeqCst);
    let (mut local_read, mut local_write) = socket.split();
    let (mut remote_read, mut remote_write) = tokio::io::split(upstream);
    // Whichever side finishes first ends the bridge; both ends close on return
    tokio::select! {
        sent = tokio::io::copy(&mut local_read, &mut remote_write) => match sent {
            Ok(n) => debug!("Client side of bridge to {} closed after {} bytes", target, n),
            Err(e) => debug!("Bridge to {} ended on client side: {}", target, e),
        },
        received = tokio::io::copy(&mut remote_read, &mut local_write) => match received {
            Ok(n) => debug!("Remote side of bridge to {} closed after {} bytes", target, n),
            Err(e) => debug!("Bridge to {} ended on remote side: {}", target, e),
        },
    }
    active.fetch_sub(1, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::{BoxedStream, DirectDialer};
    use async_trait::async_trait;
    use std::io;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_server() -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        (addr, task)
    }

    /// Fails the first dial, then behaves like direct TCP.
    struct FlakyDialer {
        failed_once: AtomicBool,
        inner: DirectDialer,
    }

    #[async_trait]
    impl Dialer for FlakyDialer {
        async fn dial(&self, target: &str) -> io::Result<BoxedStream> {
            if !self.failed_once.swap(true, Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "first dial fails"));
            }
            self.inner.dial(target).await
        }
    }

    async fn round_trip(addr: SocketAddr, payload: &[u8]) -> io::Result<Vec<u8>> {
        let mut client = TcpStream::connect(addr).await?;
        client.write_all(payload).await?;
        let mut buf = vec![0u8; payload.len()];
        client.read_exact(&mut buf).await?;
        Ok(buf)
    }

    #[tokio::test]
    async fn test_bridges_bytes_both_ways() {
        let (target, _server) = echo_server().await;
        let proxy = ForwardProxy::start(target.clone(), Arc::new(DirectDialer::default()))
            .await
            .unwrap();
        assert!(proxy.local_addr().ip().is_loopback());
        assert_eq!(proxy.target(), target);

        let echoed = round_trip(proxy.local_addr(), b"hello through proxy").await.unwrap();
        assert_eq!(echoed, b"hello through proxy");
        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_dial_keeps_accepting() {
        let (target, _server) = echo_server().await;
        let dialer = Arc::new(FlakyDialer {
            failed_once: AtomicBool::new(false),
            inner: DirectDialer::default(),
        });
        let proxy = ForwardProxy::start(target, dialer).await.unwrap();

        // First client is dropped by the proxy
        assert!(round_trip(proxy.local_addr(), b"x").await.is_err());
        let echoed = round_trip(proxy.local_addr(), b"second").await.unwrap();
        assert_eq!(echoed, b"second");
        proxy.shutdown().await;
    }

    async fn wait_for_bridges(proxy: &ForwardProxy, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while proxy.active_bridges() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "expected {} active bridges, still {}",
                expected,
                proxy.active_bridges()
            )
        });
    }

    #[tokio::test]
    async fn test_client_close_ends_bridge_when_remote_stays_open() {
        // Reads everything and never closes its end
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        let _server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        let proxy = ForwardProxy::start(target, Arc::new(DirectDialer::default()))
            .await
            .unwrap();

        let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
        client.write_all(b"hi").await.unwrap();
        wait_for_bridges(&proxy, 1).await;

        drop(client);
        wait_for_bridges(&proxy, 0).await;
        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_close_ends_bridge_and_closes_client() {
        // Closes every connection right after accepting it
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        let _server = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::time::sleep(Duration::from_millis(100)).await;
                drop(socket);
            }
        });
        let proxy = ForwardProxy::start(target, Arc::new(DirectDialer::default()))
            .await
            .unwrap();

        let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)), "client should see the bridge close");
        wait_for_bridges(&proxy, 0).await;
        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_listener_but_lets_bridges_drain() {
        let (target, _server) = echo_server().await;
        let proxy = ForwardProxy::start(target, Arc::new(DirectDialer::default()))
            .await
            .unwrap();
        let addr = proxy.local_addr();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"live").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(proxy.active_bridges(), 1);

        proxy.shutdown().await;
        proxy.shutdown().await;

        assert!(TcpStream::connect(addr).await.is_err());
        // The bridge accepted before shutdown still carries traffic
        client.write_all(b"more").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"more");

        drop(client);
        wait_for_bridges(&proxy, 0).await;
    }
}
