//! Failed connects must leave nothing behind. The counters are process-wide,
//! so every test here holds `SERIAL` for its whole body.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use kymar::dialer;
use kymar::forward_proxy::open_proxies;
use kymar::ssh_tunnel::open_sessions;
use kymar::{ConnectError, ConnectionBroker, ConnectionParameters, ConnectorSettings, DatabaseType, TunnelParameters};
use once_cell::sync::Lazy;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::{Algorithm, PrivateKey};
use russh::server;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

static SERIAL: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

fn fast_settings() -> ConnectorSettings {
    ConnectorSettings {
        tunnel_timeout: Duration::from_millis(500),
        ping_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

fn assert_nothing_left() {
    assert_eq!(open_sessions(), 0, "tunnel session leaked");
    assert_eq!(open_proxies(), 0, "forward proxy leaked");
    assert!(dialer::current_tunnel().is_none(), "current tunnel left set");
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Accepts TCP and never answers, like a firewalled SSH port.
async fn silent_bastion() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    port
}

/// Speaks SSH and turns down every password.
struct RejectingBastion;

impl server::Handler for RejectingBastion {
    type Error = russh::Error;
}

/// Returns the bastion's port and the number of SSH sessions that have ended
/// on its side.
async fn rejecting_bastion() -> (u16, Arc<AtomicUsize>) {
    let mut config = server::Config {
        auth_rejection_time: Duration::from_millis(10),
        auth_rejection_time_initial: Some(Duration::ZERO),
        ..Default::default()
    };
    config
        .keys
        .push(PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap());
    let config = Arc::new(config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let ended = Arc::new(AtomicUsize::new(0));
    let counter = ended.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let config = config.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                if let Ok(session) = server::run_stream(config, socket, RejectingBastion).await {
                    let _ = session.await;
                }
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
    });
    (port, ended)
}

fn bastion(port: u16) -> TunnelParameters {
    TunnelParameters {
        host: "127.0.0.1".to_string(),
        port,
        user: "ops".to_string(),
        password: "secret".to_string(),
    }
}

#[tokio::test]
async fn direct_postgres_to_closed_port_fails_liveness() {
    let _guard = SERIAL.lock().await;
    let port = closed_port().await;
    let params = ConnectionParameters::new(DatabaseType::PostgreSQL, "127.0.0.1", port, "postgres", "x");

    let err = ConnectionBroker::new(fast_settings()).connect(&params).await.unwrap_err();
    assert!(matches!(err, ConnectError::Liveness { engine: DatabaseType::PostgreSQL, .. }), "{err}");
    assert_nothing_left();
}

#[tokio::test]
async fn direct_mysql_to_closed_port_fails_liveness() {
    let _guard = SERIAL.lock().await;
    let port = closed_port().await;
    let params = ConnectionParameters::new(DatabaseType::MySQL, "127.0.0.1", port, "root", "x");

    let started = Instant::now();
    let err = ConnectionBroker::new(fast_settings()).connect(&params).await.unwrap_err();
    assert!(matches!(err, ConnectError::Liveness { engine: DatabaseType::MySQL, .. }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_nothing_left();
}

#[tokio::test]
async fn mysql_through_refused_bastion_fails_tunnel_connect() {
    let _guard = SERIAL.lock().await;
    let params = ConnectionParameters::new(DatabaseType::MySQL, "db.internal", 3306, "root", "x")
        .with_tunnel(bastion(closed_port().await));

    let err = ConnectionBroker::new(fast_settings()).connect(&params).await.unwrap_err();
    assert!(matches!(err, ConnectError::TunnelConnect { .. }), "{err}");
    assert_nothing_left();
}

#[tokio::test]
async fn mysql_through_silent_bastion_fails_within_deadline() {
    let _guard = SERIAL.lock().await;
    let params = ConnectionParameters::new(DatabaseType::MySQL, "db.internal", 3306, "root", "x")
        .with_tunnel(bastion(silent_bastion().await));

    let started = Instant::now();
    let err = ConnectionBroker::new(fast_settings()).connect(&params).await.unwrap_err();
    assert!(matches!(err, ConnectError::TunnelConnect { .. }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_nothing_left();
}

#[tokio::test]
async fn postgres_through_silent_bastion_leaves_cell_empty() {
    let _guard = SERIAL.lock().await;
    let params = ConnectionParameters::new(DatabaseType::PostgreSQL, "db.internal", 5432, "postgres", "x")
        .with_tunnel(bastion(silent_bastion().await));

    let err = ConnectionBroker::new(fast_settings()).connect(&params).await.unwrap_err();
    assert!(matches!(err, ConnectError::TunnelConnect { .. }), "{err}");
    assert_nothing_left();
}

#[tokio::test]
async fn disallowed_forwarding_is_rejected_up_front() {
    let _guard = SERIAL.lock().await;
    let settings = ConnectorSettings {
        allow_forward_proxy: false,
        ..fast_settings()
    };
    let params = ConnectionParameters::new(DatabaseType::MySQL, "db.internal", 3306, "root", "x")
        .with_tunnel(bastion(silent_bastion().await));

    let started = Instant::now();
    let err = ConnectionBroker::new(settings).connect(&params).await.unwrap_err();
    assert!(matches!(err, ConnectError::UnsupportedCombination { .. }), "{err}");
    // Nothing was dialed, so no handshake wait either
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_nothing_left();
}

#[tokio::test]
async fn rejected_password_leaves_nothing_open() {
    let _guard = SERIAL.lock().await;
    let (port, ended) = rejecting_bastion().await;
    let settings = ConnectorSettings {
        tunnel_timeout: Duration::from_secs(3),
        ..fast_settings()
    };

    // MySQL would go through the forwarder, PostgreSQL through the registry
    for engine in [DatabaseType::MySQL, DatabaseType::PostgreSQL] {
        let params = ConnectionParameters::new(engine, "db.internal", engine.default_port(), "app", "x")
            .with_tunnel(bastion(port));
        let err = ConnectionBroker::new(settings.clone()).connect(&params).await.unwrap_err();
        assert!(
            matches!(&err, ConnectError::Authentication { user, .. } if user == "ops"),
            "{engine}: {err}"
        );
        assert_nothing_left();
    }

    // Both half-open sessions were disconnected, not abandoned
    tokio::time::timeout(Duration::from_secs(2), async {
        while ended.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}
