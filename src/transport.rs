//! The `Client` trait and its lifecycle-only transport implementations.
//!
//! Defining the MCP wire format and any specific transport's framing is
//! explicitly out of scope (spec §1 Non-goals). What lives here is the
//! seam the adapter dispatches through — connect/disconnect/status —
//! generalized from the teacher's `mcp/client.rs` JSON-RPC handshake
//! shape. Actual request/response encode-decode is left to the
//! external MCP client collaborator via `RequestDispatch`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Child;
use tokio::sync::Mutex as AsyncMutex;

use crate::connection::{ConnectionInfo, ConnectionStateMachine};
use crate::model::ToolMetadata;

/// Narrow seam for the actual wire exchange, owned by the external MCP
/// client collaborator (spec §1). The transport structs here only
/// drive lifecycle; they hand off real request/response framing to
/// whatever implements this for a given transport.
#[async_trait]
pub trait RequestDispatch: Send + Sync {
    async fn initialize(&self) -> Result<(), String>;
    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, String>;
    async fn shutdown(&self);
}

/// Lifecycle surface every transport exposes to the adapter (spec §9).
#[async_trait]
pub trait Client: Send + Sync {
    async fn connect(&self) -> Result<(), String>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;
    fn connection_info(&self) -> ConnectionInfo;
    fn config_label(&self) -> String;
    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, String>;
    /// Non-blocking — never performs I/O (spec §4.3).
    fn cached_tool_count_nonblocking(&self) -> usize;
    fn is_user_logged_out(&self) -> bool;
}

struct CachedTools {
    tools: Vec<ToolMetadata>,
}

/// stdio transport: spawns a child process, generalized from the
/// teacher's `McpTransport::Stdio` child/stdin/stdout plumbing.
pub struct StdioClient {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    state: Arc<ConnectionStateMachine>,
    child: AsyncMutex<Option<Child>>,
    tools: AsyncMutex<CachedTools>,
    dispatch: Arc<dyn RequestDispatch>,
}

impl StdioClient {
    pub fn new(
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        state: Arc<ConnectionStateMachine>,
        dispatch: Arc<dyn RequestDispatch>,
    ) -> Self {
        Self {
            command,
            args,
            env,
            state,
            child: AsyncMutex::new(None),
            tools: AsyncMutex::new(CachedTools { tools: Vec::new() }),
            dispatch,
        }
    }
}

#[async_trait]
impl Client for StdioClient {
    async fn connect(&self) -> Result<(), String> {
        use crate::connection::ConnectionState::*;

        self.state.transition_to(Connecting);

        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let child = cmd.spawn().map_err(|e| {
            let msg = format!("failed to spawn '{}': {e}", self.command);
            self.state.set_error(&msg);
            msg
        })?;

        *self.child.lock().await = Some(child);

        self.state.transition_to(Discovering);
        if let Err(e) = self.dispatch.initialize().await {
            self.state.set_error(&e);
            return Err(e);
        }

        match self.dispatch.list_tools().await {
            Ok(tools) => {
                self.tools.lock().await.tools = tools;
                self.state.transition_to(Ready);
                Ok(())
            }
            Err(e) => {
                self.state.set_error(&e);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) {
        self.dispatch.shutdown().await;
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
        }
        self.state.transition_to(crate::connection::ConnectionState::Disconnected);
    }

    fn is_connected(&self) -> bool {
        self.state.get_state() == crate::connection::ConnectionState::Ready
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.state.get_connection_info()
    }

    fn config_label(&self) -> String {
        format!("stdio:{}", self.command)
    }

    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, String> {
        self.dispatch.list_tools().await
    }

    fn cached_tool_count_nonblocking(&self) -> usize {
        self.tools.try_lock().map(|g| g.tools.len()).unwrap_or(0)
    }

    fn is_user_logged_out(&self) -> bool {
        self.state.is_user_logged_out()
    }
}

/// HTTP transport: JSON-RPC 2.0 over HTTP POST, generalized from the
/// teacher's `McpTransport::Http` + bearer-token header pattern.
pub struct HttpClient {
    url: String,
    bearer_ref: Option<String>,
    state: Arc<ConnectionStateMachine>,
    tools: AsyncMutex<CachedTools>,
    dispatch: Arc<dyn RequestDispatch>,
}

impl HttpClient {
    pub fn new(
        url: String,
        bearer_ref: Option<String>,
        state: Arc<ConnectionStateMachine>,
        dispatch: Arc<dyn RequestDispatch>,
    ) -> Self {
        Self {
            url,
            bearer_ref,
            state,
            tools: AsyncMutex::new(CachedTools { tools: Vec::new() }),
            dispatch,
        }
    }
}

#[async_trait]
impl Client for HttpClient {
    async fn connect(&self) -> Result<(), String> {
        use crate::connection::ConnectionState::*;

        self.state.transition_to(Connecting);
        if self.bearer_ref.is_some() {
            self.state.transition_to(PendingAuth);
            self.state.transition_to(Authenticating);
        }
        self.state.transition_to(Discovering);

        if let Err(e) = self.dispatch.initialize().await {
            self.state.set_error(&e);
            return Err(e);
        }

        match self.dispatch.list_tools().await {
            Ok(tools) => {
                self.tools.lock().await.tools = tools;
                self.state.transition_to(Ready);
                Ok(())
            }
            Err(e) => {
                self.state.set_error(&e);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) {
        self.dispatch.shutdown().await;
        self.state.transition_to(crate::connection::ConnectionState::Disconnected);
    }

    fn is_connected(&self) -> bool {
        self.state.get_state() == crate::connection::ConnectionState::Ready
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.state.get_connection_info()
    }

    fn config_label(&self) -> String {
        format!("http:{}", self.url)
    }

    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, String> {
        self.dispatch.list_tools().await
    }

    fn cached_tool_count_nonblocking(&self) -> usize {
        self.tools.try_lock().map(|g| g.tools.len()).unwrap_or(0)
    }

    fn is_user_logged_out(&self) -> bool {
        self.state.is_user_logged_out()
    }
}

/// SSE transport — same lifecycle shape as `HttpClient`; the original
/// teacher had no SSE variant, so this is generalized from it rather
/// than copied (spec §1 lists `sse` as a required transport kind).
pub struct SseClient {
    url: String,
    state: Arc<ConnectionStateMachine>,
    tools: AsyncMutex<CachedTools>,
    dispatch: Arc<dyn RequestDispatch>,
    _timeout: Duration,
}

impl SseClient {
    pub fn new(url: String, state: Arc<ConnectionStateMachine>, dispatch: Arc<dyn RequestDispatch>) -> Self {
        Self {
            url,
            state,
            tools: AsyncMutex::new(CachedTools { tools: Vec::new() }),
            dispatch,
            _timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl Client for SseClient {
    async fn connect(&self) -> Result<(), String> {
        use crate::connection::ConnectionState::*;

        self.state.transition_to(Connecting);
        self.state.transition_to(Discovering);

        if let Err(e) = self.dispatch.initialize().await {
            self.state.set_error(&e);
            return Err(e);
        }

        match self.dispatch.list_tools().await {
            Ok(tools) => {
                self.tools.lock().await.tools = tools;
                self.state.transition_to(Ready);
                Ok(())
            }
            Err(e) => {
                self.state.set_error(&e);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) {
        self.dispatch.shutdown().await;
        self.state.transition_to(crate::connection::ConnectionState::Disconnected);
    }

    fn is_connected(&self) -> bool {
        self.state.get_state() == crate::connection::ConnectionState::Ready
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.state.get_connection_info()
    }

    fn config_label(&self) -> String {
        format!("sse:{}", self.url)
    }

    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, String> {
        self.dispatch.list_tools().await
    }

    fn cached_tool_count_nonblocking(&self) -> usize {
        self.tools.try_lock().map(|g| g.tools.len()).unwrap_or(0)
    }

    fn is_user_logged_out(&self) -> bool {
        self.state.is_user_logged_out()
    }
}
