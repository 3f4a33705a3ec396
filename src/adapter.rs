//! Upstream adapter: the actor pool managing one `Client` per upstream
//! server.
//!
//! Generalized from the teacher's `McpClientManager` registry shape
//! (`RwLock<HashMap<String, Arc<McpConnection>>>`). The single most
//! important invariant carried over from spec §4.3/§5: every accessor
//! here must finish reading the registry *before* a caller acquires
//! its own lock (the supervisor's state mutex) — never hold the
//! registry lock across a call back into the supervisor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::connection::ConnectionInfo;
use crate::events::{Event, EventBus};
use crate::model::ToolMetadata;
use crate::transport::Client;

const ADAPTER_EVENT_BUFFER: usize = 100;

pub struct ManagedClient {
    pub client: Arc<dyn Client>,
}

/// A cheap, non-blocking read of one server's adapter-visible state —
/// exactly what `GetServerState` is allowed to compute (spec §4.3: no
/// I/O, cached tool counts only).
#[derive(Debug, Clone)]
pub struct AdapterServerState {
    pub name: String,
    pub connected: bool,
    pub connection_info: ConnectionInfo,
    pub tool_count: usize,
    pub is_user_logged_out: bool,
}

pub struct UpstreamAdapter {
    clients: RwLock<HashMap<String, ManagedClient>>,
    pub events: Arc<EventBus>,
}

impl UpstreamAdapter {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            events: Arc::new(EventBus::new(ADAPTER_EVENT_BUFFER)),
        }
    }

    /// Adding a server that already exists updates its config in place
    /// (spec §4.3) — the registry entry is simply overwritten.
    pub async fn add_server(&self, name: String, client: Arc<dyn Client>) {
        self.clients.write().await.insert(name.clone(), ManagedClient { client });
        self.events
            .publish(Event::lifecycle(
                "server.added",
                &name,
                serde_json::json!({ "server_name": name }),
            ))
            .await;
    }

    /// Removing an unknown server is a no-op that still emits the
    /// removal event (spec §4.3).
    pub async fn remove_server(&self, name: &str) {
        if let Some(managed) = self.clients.write().await.remove(name) {
            managed.client.disconnect().await;
        }
        self.events
            .publish(Event::lifecycle(
                "server.removed",
                name,
                serde_json::json!({ "server_name": name }),
            ))
            .await;
    }

    pub async fn connect_server(&self, name: &str) -> Result<(), String> {
        let client = {
            let guard = self.clients.read().await;
            guard.get(name).map(|m| m.client.clone())
        };

        let Some(client) = client else {
            return Err(format!("server '{name}' is not registered"));
        };

        match client.connect().await {
            Ok(()) => {
                self.events
                    .publish(Event::lifecycle(
                        "server.connected",
                        name,
                        serde_json::json!({ "connected": true, "title": name, "message": "connected", "level": "info" }),
                    ))
                    .await;
                Ok(())
            }
            Err(e) => {
                self.events
                    .publish(Event::lifecycle(
                        "server.state_changed",
                        name,
                        serde_json::json!({ "connected": false, "title": name, "message": e, "level": "error" }),
                    ))
                    .await;
                Err(e)
            }
        }
    }

    pub async fn disconnect_server(&self, name: &str) {
        let client = {
            let guard = self.clients.read().await;
            guard.get(name).map(|m| m.client.clone())
        };

        if let Some(client) = client {
            client.disconnect().await;
            self.events
                .publish(Event::lifecycle(
                    "server.disconnected",
                    name,
                    serde_json::json!({ "connected": false, "title": name, "message": "disconnected", "level": "info" }),
                ))
                .await;
        }
    }

    pub async fn connect_all(&self) {
        let names: Vec<String> = self.clients.read().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.connect_server(&name).await {
                tracing::warn!(server = %name, error = %e, "adapter: connect_all failed for server");
            }
        }
    }

    /// Non-blocking: no network I/O, cached tool counts only (spec
    /// §4.3).
    pub async fn get_server_state(&self, name: &str) -> Option<AdapterServerState> {
        let guard = self.clients.read().await;
        let managed = guard.get(name)?;
        Some(AdapterServerState {
            name: name.to_string(),
            connected: managed.client.is_connected(),
            connection_info: managed.client.connection_info(),
            tool_count: managed.client.cached_tool_count_nonblocking(),
            is_user_logged_out: managed.client.is_user_logged_out(),
        })
    }

    /// Non-blocking: copies everything it needs out of the registry
    /// lock before returning, never holds it across a caller's own
    /// lock acquisition (spec §5 lock-ordering invariant).
    pub async fn get_all_states(&self) -> Vec<AdapterServerState> {
        let guard = self.clients.read().await;
        guard
            .iter()
            .map(|(name, managed)| AdapterServerState {
                name: name.clone(),
                connected: managed.client.is_connected(),
                connection_info: managed.client.connection_info(),
                tool_count: managed.client.cached_tool_count_nonblocking(),
                is_user_logged_out: managed.client.is_user_logged_out(),
            })
            .collect()
    }

    pub async fn is_user_logged_out(&self, name: &str) -> bool {
        self.clients
            .read()
            .await
            .get(name)
            .map(|m| m.client.is_user_logged_out())
            .unwrap_or(false)
    }

    pub async fn list_tools(&self, name: &str) -> Result<Vec<ToolMetadata>, String> {
        let client = {
            let guard = self.clients.read().await;
            guard.get(name).map(|m| m.client.clone())
        };
        let Some(client) = client else {
            return Err(format!("server '{name}' is not registered"));
        };
        tokio::time::timeout(Duration::from_secs(30), client.list_tools())
            .await
            .map_err(|_| "tools/list timed out".to_string())?
    }

    pub async fn subscribe(&self) -> (u64, tokio::sync::mpsc::Receiver<Arc<Event>>) {
        self.events.subscribe().await
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.events.unsubscribe(id).await;
    }

    pub async fn close(&self) {
        let names: Vec<String> = self.clients.read().await.keys().cloned().collect();
        for name in names {
            self.disconnect_server(&name).await;
        }
        self.clients.write().await.clear();
    }
}

impl Default for UpstreamAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionState, ConnectionStateMachine};
    use async_trait::async_trait;

    struct FakeClient {
        state: Arc<ConnectionStateMachine>,
    }

    #[async_trait]
    impl Client for FakeClient {
        async fn connect(&self) -> Result<(), String> {
            self.state.transition_to(ConnectionState::Connecting);
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
            Ok(vec![])
        }
        fn cached_tool_count_nonblocking(&self) -> usize {
            0
        }
        fn is_user_logged_out(&self) -> bool {
            self.state.is_user_logged_out()
        }
    }

    #[tokio::test]
    async fn get_all_states_never_touches_network() {
        let adapter = UpstreamAdapter::new();
        let fake = Arc::new(FakeClient { state: Arc::new(ConnectionStateMachine::new("svc")) });
        adapter.add_server("svc".into(), fake.clone()).await;
        adapter.connect_server("svc").await.unwrap();

        let states = adapter.get_all_states().await;
        assert_eq!(states.len(), 1);
        assert!(states[0].connected);
    }

    #[tokio::test]
    async fn remove_server_disconnects_and_drops_entry() {
        let adapter = UpstreamAdapter::new();
        let fake = Arc::new(FakeClient { state: Arc::new(ConnectionStateMachine::new("svc")) });
        adapter.add_server("svc".into(), fake).await;
        adapter.connect_server("svc").await.unwrap();
        adapter.remove_server("svc").await;
        assert!(adapter.get_server_state("svc").await.is_none());
    }

    #[tokio::test]
    async fn connect_server_publishes_lifecycle_event() {
        let adapter = UpstreamAdapter::new();
        let fake = Arc::new(FakeClient { state: Arc::new(ConnectionStateMachine::new("svc")) });
        adapter.add_server("svc".into(), fake).await;
        let (_id, mut rx) = adapter.subscribe().await;
        adapter.connect_server("svc").await.unwrap();
        let event = rx.try_recv().expect("event published");
        assert_eq!(event.event_type, "server.connected");
    }
}
