//! LLM Rate Limiter - admission-controlled reverse proxy for a single
//! llama.cpp-style inference server.
//!
//! At most `max_concurrent` requests are forwarded to the backend at once;
//! the rest queue on a fair gate (or are refused with 503 after the queue
//! timeout). Responses are streamed back as they arrive.

pub mod api;
pub mod config;
pub mod error;
pub mod forward;
pub mod gate;
pub mod logging;
pub mod server;
pub mod state;
pub mod stats;
pub mod supervisor;
pub mod test_util;

pub use config::{Cli, Config, ConfigError};
pub use error::{ProxyError, StartupError};
pub use gate::{AdmissionError, ConcurrencyGate, GatePermit};
pub use server::{shutdown_signal, Server};
pub use state::AppState;
pub use stats::{InFlight, Outcome, ProxyStats};
pub use supervisor::BackendProcess;
