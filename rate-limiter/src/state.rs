//! Shared application state.

use std::sync::Arc;

use llm_rate_limiter_common::StatsSnapshot;

use crate::config::Config;
use crate::error::StartupError;
use crate::forward::Forwarder;
use crate::gate::ConcurrencyGate;
use crate::stats::ProxyStats;

/// Shared application state passed to all handlers.
///
/// Built once per proxy instance; nothing here is global, so several proxies
/// can live in one process (tests do this).
pub struct AppState {
    pub config: Config,
    pub gate: ConcurrencyGate,
    pub stats: Arc<ProxyStats>,
    pub forwarder: Forwarder,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, StartupError> {
        config.validate()?;
        let backend = config.backend_url()?;
        let forwarder = Forwarder::new(
            &backend,
            config.backend.timeout(),
            config.backend.health_timeout(),
        )?;

        Ok(Self {
            gate: ConcurrencyGate::new(config.limits.max_concurrent, config.limits.max_queue),
            stats: Arc::new(ProxyStats::new()),
            forwarder,
            config,
        })
    }

    /// Whether a path is forwarded without taking a gate slot.
    pub fn is_passthrough(&self, path: &str) -> bool {
        self.config.limits.passthrough_paths.iter().any(|p| p == path)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(&self.gate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_bad_config() {
        let mut config = Config::default();
        config.limits.max_concurrent = 0;
        assert!(matches!(AppState::new(config), Err(StartupError::Config(_))));
    }

    #[test]
    fn test_passthrough_paths() {
        let mut config = Config::default();
        config.limits.passthrough_paths = vec!["/metrics".to_string()];
        let state = AppState::new(config).unwrap();

        assert!(state.is_passthrough("/metrics"));
        assert!(!state.is_passthrough("/metrics/extra"));
        assert!(!state.is_passthrough("/v1/completions"));
    }

    #[test]
    fn test_snapshot_reflects_limits() {
        let mut config = Config::default();
        config.limits.max_concurrent = 7;
        let state = AppState::new(config).unwrap();

        let snapshot = state.snapshot();
        assert_eq!(snapshot.max_concurrent, 7);
        assert_eq!(snapshot.available_slots, 7);
    }
}
