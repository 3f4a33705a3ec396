//! Shared test fakes. The external MCP client collaborator's wire
//! exchange is out of scope for this crate (spec §1) — this fake
//! stands in for it the same way the teacher's `AppState::new_test()`
//! stands in for a real database in its own integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mcp_proxy_core::connection::{ConnectionInfo, ConnectionState, ConnectionStateMachine};
use mcp_proxy_core::model::ToolMetadata;
use mcp_proxy_core::transport::Client;

/// A `Client` whose `connect()` fails a configurable number of times
/// before succeeding, so tests can exercise reconnect/backoff paths
/// without any real network I/O.
pub struct FakeClient {
    pub state: Arc<ConnectionStateMachine>,
    pub fail_first_n: AtomicUsize,
    pub tool_count: usize,
}

impl FakeClient {
    pub fn new(name: &str, fail_first_n: usize, tool_count: usize) -> Self {
        Self {
            state: Arc::new(ConnectionStateMachine::new(name)),
            fail_first_n: AtomicUsize::new(fail_first_n),
            tool_count,
        }
    }
}

#[async_trait]
impl Client for FakeClient {
    async fn connect(&self) -> Result<(), String> {
        self.state.transition_to(ConnectionState::Connecting);

        let remaining = self.fail_first_n.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first_n.fetch_sub(1, Ordering::SeqCst);
            let msg = "dial tcp: connection refused".to_string();
            self.state.set_error(&msg);
            return Err(msg);
        }

        self.state.transition_to(ConnectionState::Discovering);
        self.state.transition_to(ConnectionState::Ready);
        Ok(())
    }

    async fn disconnect(&self) {
        self.state.transition_to(ConnectionState::Disconnected);
    }

    fn is_connected(&self) -> bool {
        self.state.get_state() == ConnectionState::Ready
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.state.get_connection_info()
    }

    fn config_label(&self) -> String {
        "fake".into()
    }

    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, String> {
        Ok((0..self.tool_count)
            .map(|i| ToolMetadata {
                name: format!("tool_{i}"),
                description: String::new(),
                input_schema: serde_json::json!({}),
                annotations: serde_json::json!({}),
            })
            .collect())
    }

    fn cached_tool_count_nonblocking(&self) -> usize {
        self.tool_count
    }

    fn is_user_logged_out(&self) -> bool {
        self.state.is_user_logged_out()
    }
}
