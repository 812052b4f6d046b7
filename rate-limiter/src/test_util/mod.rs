pub mod fake_backend;

pub use fake_backend::FakeBackend;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::server::Server;
use crate::state::AppState;

/// Config for a proxy on an ephemeral localhost port in front of `backend_url`.
pub fn test_config(backend_url: &str) -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.shutdown_grace_secs = 1;
    config.backend.url = backend_url.to_string();
    config.backend.health_timeout_secs = 1;
    config.logging.level = "debug".to_string();
    config
}

/// A proxy running in the background of the current test runtime.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<std::io::Result<()>>>,
}

impl TestProxy {
    pub async fn start(config: Config) -> Self {
        let server = Server::bind(config).await.expect("Failed to bind test proxy");
        let addr = server.local_addr();
        let state = server.state();
        let (tx, rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(server.run(async move {
            let _ = rx.await;
        }));

        Self {
            addr,
            state,
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Trigger graceful shutdown and wait for `run` to return.
    pub async fn shutdown(mut self) -> std::io::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.handle.take() {
            Some(handle) => handle.await.expect("proxy task panicked"),
            None => Ok(()),
        }
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
