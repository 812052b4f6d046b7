//! Backend process supervision.
//!
//! Optional: spawns the backend (normally `llama-server`) as a child process,
//! waits for its `/health` to report ready, and stops it when the proxy shuts
//! down. The proxy treats it purely as a child process; nothing else in the
//! request path knows about it.

use std::process::Stdio;
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::process::{Child, Command};

use crate::config::LaunchConfig;
use crate::error::StartupError;

const HEALTH_CHECK_INTERVAL_MS: u64 = 200;

/// A backend process started by the proxy.
pub struct BackendProcess {
    child: Child,
    command: String,
    shutdown_timeout: Duration,
}

impl BackendProcess {
    /// Spawn the configured command and wait until `health_url` answers 2xx.
    ///
    /// On failure the child is terminated before the error is returned.
    pub async fn launch(config: &LaunchConfig, health_url: &str) -> Result<Self, StartupError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args).stdin(Stdio::null()).kill_on_drop(true);

        if config.log_output {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let child = cmd.spawn().map_err(|e| {
            StartupError::Launch(format!("failed to spawn '{}': {}", config.command, e))
        })?;

        tracing::info!(
            "Spawned backend '{}' (pid: {:?})",
            config.command,
            child.id()
        );

        let mut process = Self {
            child,
            command: config.command.clone(),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
        };

        let startup_timeout = Duration::from_secs(config.startup_timeout_secs);
        if let Err(e) = process.wait_for_ready(health_url, startup_timeout).await {
            process.terminate().await;
            return Err(e);
        }

        Ok(process)
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Check if the process is still alive.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn wait_for_ready(&mut self, health_url: &str, timeout: Duration) -> Result<(), StartupError> {
        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(2))
            .build()?;
        let start = Instant::now();

        loop {
            if start.elapsed() > timeout {
                return Err(StartupError::Launch(format!(
                    "backend '{}' not ready after {:?}",
                    self.command,
                    start.elapsed()
                )));
            }

            if !self.is_running() {
                return Err(StartupError::Launch(format!(
                    "backend '{}' exited during startup",
                    self.command
                )));
            }

            if let Ok(resp) = client.get(health_url).send().await {
                if resp.status().is_success() {
                    tracing::info!(
                        "Backend ready at {} ({:?})",
                        health_url,
                        start.elapsed()
                    );
                    return Ok(());
                }
            }

            tokio::time::sleep(Duration::from_millis(HEALTH_CHECK_INTERVAL_MS)).await;
        }
    }

    /// Stop the process: SIGTERM, then SIGKILL after the shutdown timeout.
    pub async fn terminate(mut self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = self.child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        match tokio::time::timeout(self.shutdown_timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!("Backend '{}' exited with {}", self.command, status);
            }
            Ok(Err(e)) => {
                tracing::warn!("Error waiting for backend '{}': {}", self.command, e);
            }
            Err(_timeout) => {
                tracing::warn!("Backend '{}' didn't stop gracefully, killing", self.command);
                let _ = self.child.kill().await;
            }
        }
    }
}
