//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use shield_proxy::admin;
use shield_proxy::clock::ManualClock;
use shield_proxy::config::schema::RouteConfig;
use shield_proxy::store::MemoryStore;
use shield_proxy::{build_worker, HttpServer, ShieldConfig, Shutdown, Worker};

pub const ADMIN_KEY: &str = "test-admin-key";
pub const T0: u64 = 1_700_000_000;

/// Start a mock backend that answers every request with `backend <path>`.
///
/// The request head is read before answering so the proxy never sees a
/// reset connection.
pub async fn start_mock_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }

                let head = String::from_utf8_lossy(&head);
                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                let forwarded = head
                    .lines()
                    .find_map(|l| l.strip_prefix("x-forwarded-for: "))
                    .unwrap_or("-")
                    .to_string();
                let body = format!("backend {path} for {forwarded}");
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// An address nothing listens on.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn route(name: &str, prefix: &str, upstream: SocketAddr) -> RouteConfig {
    RouteConfig {
        name: name.to_string(),
        host: None,
        path_prefix: Some(prefix.to_string()),
        upstream: format!("http://{upstream}"),
        priority: 0,
    }
}

pub fn temp_artifact() -> PathBuf {
    std::env::temp_dir().join(format!("shield-it-{}.conf", uuid::Uuid::new_v4()))
}

/// A running gateway (and admin API) on ephemeral ports with a manual clock.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub clock: Arc<ManualClock>,
    pub worker: Worker,
    pub client: reqwest::Client,
    shutdown: Shutdown,
}

/// Wait until `path` exists and contains `needle`.
pub async fn wait_for_artifact(path: &std::path::Path, needle: &str) -> String {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(rendered) = std::fs::read_to_string(path) {
            if rendered.contains(needle) {
                return rendered;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "artifact {path:?} never contained {needle:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

impl TestProxy {
    pub async fn start(mut config: ShieldConfig) -> Self {
        config.admin.enabled = true;
        config.admin.api_key = ADMIN_KEY.to_string();

        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let worker = build_worker(config, store, clock.clone()).unwrap();
        let shutdown = Shutdown::new();
        worker.spawn_background(&shutdown);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = HttpServer::new(&worker);
        let rx = shutdown.subscribe();
        tokio::spawn(async move {
            server.run(listener, rx).await.unwrap();
        });

        let admin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let admin_addr = admin_listener.local_addr().unwrap();
        let router = admin::setup_admin_router(worker.clone());
        let rx = shutdown.subscribe();
        tokio::spawn(async move {
            admin::serve(router, admin_listener, rx).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(0)
            .build()
            .unwrap();

        Self {
            addr,
            admin_addr,
            clock,
            worker,
            client,
            shutdown,
        }
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("http://{}{}", self.addr, path))
            .send()
            .await
            .unwrap()
    }

    pub fn admin(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("http://{}{}", self.admin_addr, path))
            .bearer_auth(ADMIN_KEY)
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}
