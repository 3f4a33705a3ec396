//! Lock-free read model backing the external HTTP/SSE surface.
//!
//! `Snapshot`/`GetServer`/`GetAll`/`Count*` are all plain atomic loads —
//! a prior snapshot holder never observes a later mutation (spec §4.5
//! invariant). Writers (`UpdateServer`/`RemoveServer`) serialise via an
//! internal mutex, clone-modify-store; readers never block on a
//! writer.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::model::ToolMetadata;

/// Derived, display-ready status for one server (spec §4.4's
/// state-view derivation rules).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub name: String,
    pub label: String,
    pub enabled: bool,
    pub quarantined: bool,
    pub connected: bool,
    pub tool_count: usize,
    pub cached_tools: Vec<ToolMetadata>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_reconcile_time: Option<DateTime<Utc>>,
    pub reconcile_count: u64,
}

type Map = HashMap<String, ServerStatus>;

pub struct StateView {
    current: ArcSwap<Map>,
    write_lock: AsyncMutex<()>,
}

impl StateView {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(HashMap::new()),
            write_lock: AsyncMutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<Map> {
        self.current.load_full()
    }

    pub fn get_server(&self, name: &str) -> Option<ServerStatus> {
        self.current.load().get(name).cloned()
    }

    pub fn get_all(&self) -> Vec<ServerStatus> {
        self.current.load().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.current.load().len()
    }

    pub fn count_by_state(&self, label: &str) -> usize {
        self.current.load().values().filter(|s| s.label == label).count()
    }

    pub fn count_connected(&self) -> usize {
        self.current.load().values().filter(|s| s.connected).count()
    }

    /// Clone the map, clone the target entry (or default it via
    /// `default`), apply `updater`, store atomically. Deep-clones
    /// time/tool/metadata fields — no shared mutable state escapes.
    pub async fn update_server(
        &self,
        name: &str,
        default: impl FnOnce() -> ServerStatus,
        updater: impl FnOnce(&mut ServerStatus),
    ) {
        let _guard = self.write_lock.lock().await;
        let mut next: Map = (*self.current.load_full()).clone();
        let entry = next.entry(name.to_string()).or_insert_with(default);
        updater(entry);
        self.current.store(Arc::new(next));
    }

    pub async fn remove_server(&self, name: &str) {
        let _guard = self.write_lock.lock().await;
        let mut next: Map = (*self.current.load_full()).clone();
        next.remove(name);
        self.current.store(Arc::new(next));
    }
}

impl Default for StateView {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_status(name: &str) -> ServerStatus {
        ServerStatus {
            name: name.to_string(),
            label: "disconnected".into(),
            enabled: true,
            quarantined: false,
            connected: false,
            tool_count: 0,
            cached_tools: Vec::new(),
            last_seen: None,
            last_reconcile_time: None,
            reconcile_count: 0,
        }
    }

    #[tokio::test]
    async fn prior_snapshot_holders_see_no_mutation() {
        let view = StateView::new();
        view.update_server("svc", || default_status("svc"), |s| s.connected = false).await;
        let before = view.snapshot();

        view.update_server("svc", || default_status("svc"), |s| s.connected = true).await;

        assert!(!before.get("svc").unwrap().connected);
        assert!(view.get_server("svc").unwrap().connected);
    }

    #[tokio::test]
    async fn remove_server_is_symmetric_with_update() {
        let view = StateView::new();
        view.update_server("svc", || default_status("svc"), |_| {}).await;
        assert_eq!(view.count(), 1);
        view.remove_server("svc").await;
        assert_eq!(view.count(), 0);
        assert!(view.get_server("svc").is_none());
    }

    #[tokio::test]
    async fn count_helpers_reflect_current_snapshot() {
        let view = StateView::new();
        view.update_server("a", || default_status("a"), |s| {
            s.label = "ready".into();
            s.connected = true;
        })
        .await;
        view.update_server("b", || default_status("b"), |s| s.label = "disconnected".into()).await;

        assert_eq!(view.count(), 2);
        assert_eq!(view.count_connected(), 1);
        assert_eq!(view.count_by_state("ready"), 1);
        assert_eq!(view.count_by_state("disconnected"), 1);
    }
}
