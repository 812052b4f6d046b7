//! Listener lifecycle: bind, serve, drain on shutdown.

use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::api;
use crate::config::Config;
use crate::error::StartupError;
use crate::state::AppState;

/// A bound proxy that has not started serving yet.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<AppState>,
}

impl Server {
    /// Validate `config`, build the shared state and bind the listener.
    pub async fn bind(config: Config) -> Result<Self, StartupError> {
        let state = Arc::new(AppState::new(config)?);
        let addr = state.config.server.listen_addr();

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| StartupError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| StartupError::Bind { addr, source })?;

        Ok(Self {
            listener,
            local_addr,
            state,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Serve until `shutdown` resolves, then drain.
    ///
    /// On shutdown the listener stops accepting, the gate is closed so queued
    /// requests get a 503, and in-flight requests may finish within the
    /// configured grace period. Whatever is still running after that is
    /// abandoned.
    pub async fn run<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server {
            listener,
            local_addr,
            state,
        } = self;
        let grace = state.config.server.shutdown_grace();
        tracing::info!("Listening on {}", local_addr);

        let (fired_tx, mut fired_rx) = watch::channel(false);
        let signal = {
            let state = state.clone();
            async move {
                shutdown.await;
                tracing::info!(
                    active = state.stats.active_requests(),
                    queued = state.gate.queued(),
                    "Shutting down, draining for up to {}s",
                    grace.as_secs()
                );
                state.gate.close();
                let _ = fired_tx.send(true);
            }
        };

        let serve = axum::serve(listener, api::router(state.clone()))
            .with_graceful_shutdown(signal)
            .into_future();

        let forced = async move {
            if fired_rx.wait_for(|fired| *fired).await.is_ok() {
                tokio::time::sleep(grace).await;
            } else {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            result = serve => result?,
            _ = forced => {
                tracing::warn!(
                    active = state.stats.active_requests(),
                    "Grace period elapsed, closing remaining connections"
                );
            }
        }

        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> Config {
        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = Server::bind(local_config()).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_address_in_use() {
        let first = Server::bind(local_config()).await.unwrap();

        let mut config = local_config();
        config.server.port = first.local_addr().port();
        let result = Server::bind(config).await;
        assert!(matches!(result, Err(StartupError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_bind_invalid_config() {
        let mut config = local_config();
        config.backend.url = "not a url".to_string();
        let result = Server::bind(config).await;
        assert!(matches!(result, Err(StartupError::Config(_))));
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let server = Server::bind(local_config()).await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(server.run(async move {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
