//! MCP reverse proxy core: configuration service, supervisor/reconciler,
//! per-server connection state machine, and the lock-free state view
//! that backs the external HTTP/SSE surface.
//!
//! This crate is the control plane only. It does not speak the MCP
//! wire protocol, does not run an HTTP server, and does not persist
//! activity or audit records — those are owned by external
//! collaborators that plug into the seams defined here (see
//! `transport::Client`, `activity::ActivityRecord`).
//!
//! Control flow: a `ConfigService` holds the desired state. A
//! `Supervisor` diffs it against what the `UpstreamAdapter` reports as
//! actual state and dispatches connect/disconnect/reconnect actions.
//! Every server has its own `ConnectionStateMachine` tracking fine-grained
//! connection lifecycle and retry/backoff. The `StateView` is the
//! read-only projection everything downstream actually queries.

pub mod activity;
pub mod adapter;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod health;
pub mod model;
pub mod state_view;
pub mod supervisor;
pub mod transport;

pub use adapter::UpstreamAdapter;
pub use config::ConfigService;
pub use connection::{ConnectionInfo, ConnectionState, ConnectionStateMachine};
pub use error::{Error, Result};
pub use events::{Event, EventBus};
pub use health::{calculate_health, HealthConfig, HealthInput, HealthResult};
pub use state_view::StateView;
pub use supervisor::Supervisor;

/// Initializes `tracing` the way the harness binary (and any embedder)
/// is expected to: `RUST_LOG`-driven `EnvFilter`, JSON format when
/// `RUST_LOG_FORMAT=json`, ANSI text otherwise. Library code never
/// calls this on its own — only a binary entry point should.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().with_env_filter(env_filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).with_ansi(true).init();
    }
}
