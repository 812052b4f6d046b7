//! LLM Rate Limiter - caps concurrent requests to a llama.cpp server.

use clap::Parser;

use llm_rate_limiter::logging::init_tracing;
use llm_rate_limiter::{shutdown_signal, BackendProcess, Cli, Config, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli).map_err(|e| {
        format!(
            "{}. Check config.toml, RATE_LIMITER__* environment variables and command-line flags.",
            e
        )
    })?;

    init_tracing(&config.logging.level);

    let server = Server::bind(config.clone()).await?;

    tracing::info!("LLM Rate Limiter {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Listening on: http://{}", server.local_addr());
    tracing::info!("Backend: {}", config.backend.url);
    tracing::info!("Max concurrent requests: {}", config.limits.max_concurrent);
    tracing::info!(
        "Queue size: {} (timeout {}s)",
        if config.limits.max_queue == 0 {
            "unbounded".to_string()
        } else {
            config.limits.max_queue.to_string()
        },
        config.limits.queue_timeout_secs
    );
    tracing::info!("Stats endpoint: http://{}/proxy/stats", server.local_addr());

    let backend = if config.launch.enabled {
        let health_url = format!("{}/health", server.state().forwarder.base_url());
        Some(BackendProcess::launch(&config.launch, &health_url).await?)
    } else {
        None
    };

    server.run(shutdown_signal()).await?;

    if let Some(process) = backend {
        process.terminate().await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
