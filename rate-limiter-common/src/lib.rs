//! LLM Rate Limiter Common Types
//!
//! JSON bodies served by the rate limiter's own endpoints. Kept in a separate
//! crate so tooling that polls `/proxy/stats` or `/health` can decode them
//! without pulling in the proxy.

pub mod error;
pub mod health;
pub mod stats;

pub use error::ErrorBody;
pub use health::{HealthResponse, HealthStatus};
pub use stats::StatsSnapshot;
