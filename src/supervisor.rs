//! Supervisor / reconciler: the control loop that diffs desired state
//! (the current config snapshot) against actual state (what the
//! adapter reports) and drives the adapter toward convergence.
//!
//! The periodic drift-check and exemption-cleanup loops are shaped
//! after the teacher's `watchdog::spawn` background-task pattern
//! (`tokio::spawn` + `tokio::time::interval`, structured `tracing`
//! summaries). The inspection circuit breaker is `state.rs::CircuitBreaker`
//! generalized from a binary trip/cooldown into the named
//! `CanInspect` tri-state contract (spec §4.4).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::adapter::UpstreamAdapter;
use crate::config::ConfigService;
use crate::events::{Event, EventBus};
use crate::model::{ConfigSnapshot, ToolMetadata};
use crate::state_view::{ServerStatus, StateView};

const RECONCILE_ACTION_TIMEOUT: Duration = Duration::from_secs(30);
const DRIFT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const EXEMPTION_CLEANUP_INTERVAL: Duration = Duration::from_secs(5);
const INITIAL_RECONCILE_DELAY: Duration = Duration::from_millis(500);
const SUPERVISOR_EVENT_BUFFER: usize = 200;

const INSPECTION_FAILURE_THRESHOLD: u32 = 3;
const INSPECTION_COOLDOWN: Duration = Duration::from_secs(5 * 60);
const INSPECTION_SILENT_RESET: Duration = Duration::from_secs(10 * 60);

/// One server's desired-vs-actual reconcile metadata (spec §3).
#[derive(Debug, Clone)]
#[allow(dead_code)]
struct ServerState {
    enabled: bool,
    quarantined: bool,
    connected: bool,
    tool_count: usize,
    cached_tools: Vec<ToolMetadata>,
    last_seen: Option<DateTime<Utc>>,
    last_reconcile_time: Option<DateTime<Utc>>,
    reconcile_count: u64,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            enabled: false,
            quarantined: false,
            connected: false,
            tool_count: 0,
            cached_tools: Vec::new(),
            last_seen: None,
            last_reconcile_time: None,
            reconcile_count: 0,
        }
    }
}

/// The action the reconciler decided a given server needs this cycle
/// (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    None,
    Connect,
    Reconnect,
    Disconnect,
    Remove,
}

#[derive(Debug, Clone)]
pub struct InspectionFailureRecord {
    pub consecutive_failures: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub active_until: Option<DateTime<Utc>>,
}

impl Default for InspectionFailureRecord {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            last_failure_time: None,
            active_until: None,
        }
    }
}

/// Tri-state verdict from `can_inspect` (spec §4.4): either inspection
/// is allowed outright, allowed because the silent-reset window
/// elapsed, or denied until the cooldown expires.
#[derive(Debug, Clone, PartialEq)]
pub enum InspectionGate {
    Allowed,
    AllowedAfterReset,
    Denied { retry_after: DateTime<Utc> },
}

pub type OnConnectedCallback = Arc<dyn Fn(&str) + Send + Sync>;

pub struct Supervisor {
    config: Arc<ConfigService>,
    adapter: Arc<UpstreamAdapter>,
    state: AsyncMutex<HashMap<String, ServerState>>,
    state_view: Arc<StateView>,
    exemptions: AsyncMutex<HashMap<String, DateTime<Utc>>>,
    inspection_failures: AsyncMutex<HashMap<String, InspectionFailureRecord>>,
    pub events: Arc<EventBus>,
    on_connected: AsyncMutex<Option<OnConnectedCallback>>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(config: Arc<ConfigService>, adapter: Arc<UpstreamAdapter>, state_view: Arc<StateView>) -> Arc<Self> {
        Arc::new(Self {
            config,
            adapter,
            state: AsyncMutex::new(HashMap::new()),
            state_view,
            exemptions: AsyncMutex::new(HashMap::new()),
            inspection_failures: AsyncMutex::new(HashMap::new()),
            events: Arc::new(EventBus::new(SUPERVISOR_EVENT_BUFFER)),
            on_connected: AsyncMutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub async fn set_on_connected(&self, callback: OnConnectedCallback) {
        *self.on_connected.lock().await = Some(callback);
    }

    /// Spawns the periodic drift-check loop, the exemption-cleanup
    /// loop, and performs the initial reconcile after
    /// `INITIAL_RECONCILE_DELAY` — mirrors `watchdog::spawn`'s
    /// "sleep-then-loop" shape.
    pub fn spawn_background_loops(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(INITIAL_RECONCILE_DELAY).await;
            this.reconcile().await;

            let mut interval = tokio::time::interval(DRIFT_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => {
                        tracing::info!("supervisor: drift-check loop stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        this.reconcile().await;
                    }
                }
            }
        });

        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EXEMPTION_CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => {
                        tracing::info!("supervisor: exemption-cleanup loop stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        this.cleanup_expired_exemptions().await;
                    }
                }
            }
        });
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Grants a quarantine exemption until `now + duration`. Logs a
    /// security warning and triggers an immediate reconcile (spec
    /// §4.4).
    pub async fn request_inspection_exemption(&self, server: &str, duration: Duration) {
        let until = Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default();
        self.exemptions.lock().await.insert(server.to_string(), until);

        tracing::warn!(
            server = %server,
            until = %until,
            "security: inspection exemption granted for quarantined server"
        );

        self.events
            .publish(Event::lifecycle(
                "quarantine.exemption_granted",
                server,
                serde_json::json!({ "server_name": server, "until": until }),
            ))
            .await;

        self.reconcile().await;
    }

    pub async fn revoke_inspection_exemption(&self, server: &str) {
        self.exemptions.lock().await.remove(server);
        self.reconcile().await;
    }

    async fn has_active_exemption(&self, server: &str) -> bool {
        let exemptions = self.exemptions.lock().await;
        match exemptions.get(server) {
            Some(until) => *until > Utc::now(),
            None => false,
        }
    }

    /// Lazily drops expired exemptions on read, in addition to the 5s
    /// background cleanup loop (spec §4.4).
    async fn cleanup_expired_exemptions(&self) {
        let now = Utc::now();
        let mut expired = Vec::new();
        {
            let mut exemptions = self.exemptions.lock().await;
            exemptions.retain(|server, until| {
                let keep = *until > now;
                if !keep {
                    expired.push(server.clone());
                }
                keep
            });
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "supervisor: quarantine exemptions expired, re-reconciling");
            self.reconcile().await;
        }
    }

    /// `CanInspect` — tri-state gate generalized from
    /// `state.rs::CircuitBreaker::allow_request`.
    pub async fn can_inspect(&self, server: &str) -> InspectionGate {
        let mut failures = self.inspection_failures.lock().await;
        let record = failures.entry(server.to_string()).or_default();

        if let (Some(last_failure), true) = (record.last_failure_time, record.active_until.is_some()) {
            if Utc::now() - last_failure > chrono::Duration::from_std(INSPECTION_SILENT_RESET).unwrap() {
                *record = InspectionFailureRecord::default();
                return InspectionGate::AllowedAfterReset;
            }
        }

        match record.active_until {
            Some(until) if until > Utc::now() => InspectionGate::Denied { retry_after: until },
            Some(_) => {
                record.active_until = None;
                record.consecutive_failures = 0;
                InspectionGate::AllowedAfterReset
            }
            None => InspectionGate::Allowed,
        }
    }

    pub async fn record_inspection_failure(&self, server: &str) {
        let mut failures = self.inspection_failures.lock().await;
        let record = failures.entry(server.to_string()).or_default();
        record.consecutive_failures += 1;
        record.last_failure_time = Some(Utc::now());

        if record.consecutive_failures >= INSPECTION_FAILURE_THRESHOLD {
            let until = Utc::now() + chrono::Duration::from_std(INSPECTION_COOLDOWN).unwrap();
            record.active_until = Some(until);
            tracing::error!(
                server = %server,
                failures = record.consecutive_failures,
                "supervisor: inspection circuit tripped, cooling down until {}",
                until
            );
        }
    }

    pub async fn record_inspection_success(&self, server: &str) {
        let mut failures = self.inspection_failures.lock().await;
        if let Some(record) = failures.get_mut(server) {
            *record = InspectionFailureRecord::default();
        }
    }

    pub async fn get_inspection_stats(&self, server: &str) -> InspectionFailureRecord {
        self.inspection_failures.lock().await.entry(server.to_string()).or_default().clone()
    }

    /// Invoked by the adapter/event layer when fresh tool discovery
    /// completes out of band; updates the cached tool list without a
    /// full reconcile cycle.
    pub async fn refresh_tools_from_discovery(&self, server: &str, tools: Vec<ToolMetadata>) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.get_mut(server) {
            entry.tool_count = tools.len();
            entry.cached_tools = tools.clone();
            entry.last_seen = Some(Utc::now());
        }
        drop(state);

        self.state_view
            .update_server(
                server,
                || ServerStatus {
                    name: server.to_string(),
                    label: "ready".into(),
                    enabled: true,
                    quarantined: false,
                    connected: true,
                    tool_count: tools.len(),
                    cached_tools: tools.clone(),
                    last_seen: Some(Utc::now()),
                    last_reconcile_time: None,
                    reconcile_count: 0,
                },
                |status| {
                    status.tool_count = tools.len();
                    status.cached_tools = tools.clone();
                    status.last_seen = Some(Utc::now());
                },
            )
            .await;
    }

    /// The reconciliation cycle (spec §4.4, 5 steps):
    /// 1. pre-fetch adapter data *outside* any lock of our own.
    /// 2. acquire the state mutex.
    /// 3. compute a `ReconcileAction` per server.
    /// 4. dispatch each action asynchronously with a 30s timeout.
    /// 5. synchronously update the state snapshot and the state view.
    pub async fn reconcile(&self) {
        let desired: Arc<ConfigSnapshot> = self.config.current();
        let actual = self.adapter.get_all_states().await;
        let actual_by_name: HashMap<String, crate::adapter::AdapterServerState> =
            actual.into_iter().map(|s| (s.name.clone(), s)).collect();

        let mut actions: Vec<(String, ReconcileAction)> = Vec::new();

        {
            let mut state = self.state.lock().await;

            let desired_names: std::collections::HashSet<&str> = desired.servers.iter().map(|s| s.name.as_str()).collect();

            // servers removed from desired config
            let to_remove: Vec<String> = state.keys().filter(|name| !desired_names.contains(name.as_str())).cloned().collect();
            for name in &to_remove {
                actions.push((name.clone(), ReconcileAction::Remove));
            }

            for descriptor in &desired.servers {
                let exempted = self.has_active_exemption(&descriptor.name).await;
                let entry = state.entry(descriptor.name.clone()).or_default();
                entry.enabled = descriptor.enabled;
                entry.quarantined = descriptor.quarantined && !exempted;

                let currently_connected = actual_by_name.get(&descriptor.name).map(|a| a.connected).unwrap_or(false);
                entry.connected = currently_connected;
                if let Some(actual_state) = actual_by_name.get(&descriptor.name) {
                    entry.tool_count = actual_state.tool_count;
                }

                let action = if !entry.enabled || entry.quarantined {
                    if currently_connected { ReconcileAction::Disconnect } else { ReconcileAction::None }
                } else if !currently_connected {
                    match actual_by_name.get(&descriptor.name) {
                        Some(actual_state) if !due_for_retry(&actual_state.connection_info) => ReconcileAction::None,
                        Some(_) => ReconcileAction::Reconnect,
                        None => ReconcileAction::Connect,
                    }
                } else {
                    ReconcileAction::None
                };

                actions.push((descriptor.name.clone(), action));
            }

            for name in &to_remove {
                state.remove(name);
            }
        }

        for (name, action) in &actions {
            let result = tokio::time::timeout(RECONCILE_ACTION_TIMEOUT, self.dispatch_action(name, *action)).await;
            if result.is_err() {
                tracing::error!(server = %name, action = ?action, "supervisor: reconcile action timed out after {}s", RECONCILE_ACTION_TIMEOUT.as_secs());
            }
        }

        self.sync_state_view(&desired).await;
    }

    async fn dispatch_action(&self, name: &str, action: ReconcileAction) {
        match action {
            ReconcileAction::None => {}
            ReconcileAction::Connect | ReconcileAction::Reconnect => {
                if let Err(e) = self.adapter.connect_server(name).await {
                    tracing::warn!(server = %name, error = %e, "supervisor: reconcile connect failed");
                } else if let Some(cb) = self.on_connected.lock().await.clone() {
                    cb(name);
                }
            }
            ReconcileAction::Disconnect | ReconcileAction::Remove => {
                self.adapter.disconnect_server(name).await;
                if action == ReconcileAction::Remove {
                    self.adapter.remove_server(name).await;
                    self.state_view.remove_server(name).await;
                }
            }
        }
    }

    /// Re-derive and publish the full state view — always a complete
    /// re-assertion, never a partial patch (spec §4.5 invariant).
    async fn sync_state_view(&self, desired: &ConfigSnapshot) {
        let actual = self.adapter.get_all_states().await;
        let actual_by_name: HashMap<String, crate::adapter::AdapterServerState> =
            actual.into_iter().map(|s| (s.name.clone(), s)).collect();

        // Compute every server's derived snapshot under a single lock
        // acquisition, then release before touching the state view —
        // the two locks are never held at once.
        let derived: Vec<(String, String, ServerState)> = {
            let mut state = self.state.lock().await;
            let mut out = Vec::with_capacity(desired.servers.len());
            for descriptor in &desired.servers {
                let entry = state.entry(descriptor.name.clone()).or_default();
                entry.last_reconcile_time = Some(Utc::now());
                entry.reconcile_count += 1;
                if let Some(actual_state) = actual_by_name.get(&descriptor.name) {
                    if actual_state.connected {
                        entry.last_seen = Some(Utc::now());
                    }
                }
                let label = derive_label(descriptor.enabled, entry.quarantined, entry.connected, actual_by_name.get(&descriptor.name));
                out.push((descriptor.name.clone(), label, entry.clone()));
            }
            out
        };

        for (name, label, snapshot) in derived {
            self.state_view
                .update_server(
                    &name,
                    || ServerStatus {
                        name: name.clone(),
                        label: label.clone(),
                        enabled: snapshot.enabled,
                        quarantined: snapshot.quarantined,
                        connected: snapshot.connected,
                        tool_count: snapshot.tool_count,
                        cached_tools: snapshot.cached_tools.clone(),
                        last_seen: snapshot.last_seen,
                        last_reconcile_time: snapshot.last_reconcile_time,
                        reconcile_count: snapshot.reconcile_count,
                    },
                    |status| {
                        status.label = label.clone();
                        status.enabled = snapshot.enabled;
                        status.quarantined = snapshot.quarantined;
                        status.connected = snapshot.connected;
                        status.tool_count = snapshot.tool_count;
                        status.last_seen = snapshot.last_seen;
                        status.last_reconcile_time = snapshot.last_reconcile_time;
                        status.reconcile_count = snapshot.reconcile_count;
                    },
                )
                .await;
        }
    }

    /// Subscribes to the adapter's lifecycle events and triggers a
    /// fast reconcile whenever a server connects, disconnects, or
    /// changes state out of band — spec §4.4's event-driven refresh,
    /// on top of the 30s periodic drift check.
    pub fn spawn_event_driven_refresh(self: &Arc<Self>) {
        let this = self.clone();
        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            let (_id, mut rx) = adapter.subscribe().await;
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    event = rx.recv() => {
                        match event {
                            Some(event) if matches!(
                                event.event_type.as_str(),
                                "server.connected" | "server.disconnected" | "server.state_changed"
                            ) => {
                                this.reconcile().await;
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
            }
        });
    }
}

/// Whether a server that is currently disconnected/erroring is eligible
/// for a reconnect attempt this cycle (spec §4.2/§4.4). The logout
/// latch always suppresses; outside the `Error` state there is no
/// backoff to wait out (a plain `Disconnected` server, e.g. one just
/// re-enabled by config, reconnects immediately). Inside `Error`, the
/// matching backoff ladder — OAuth or non-OAuth, selected by
/// `is_oauth_error` — gates the attempt so the drift-check loop and the
/// event-driven refresh don't hammer a failing server's `connect()`
/// well inside its backoff window.
fn due_for_retry(info: &crate::connection::ConnectionInfo) -> bool {
    if info.user_logged_out {
        return false;
    }
    if info.state != crate::connection::ConnectionState::Error {
        return true;
    }
    if info.is_oauth_error {
        info.should_retry_oauth()
    } else {
        info.should_retry()
    }
}

fn derive_label(
    enabled: bool,
    quarantined: bool,
    connected: bool,
    actual: Option<&crate::adapter::AdapterServerState>,
) -> String {
    if let Some(actual) = actual {
        return actual.connection_info.state.label().to_string();
    }
    if connected {
        "connected".to_string()
    } else if enabled && !quarantined {
        "connecting".to_string()
    } else if enabled {
        "disconnected".to_string()
    } else {
        "idle".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConfigSnapshot, ServerDescriptor, TransportKind, UpdateKind};

    fn descriptor(name: &str, enabled: bool) -> ServerDescriptor {
        ServerDescriptor {
            name: name.to_string(),
            transport: TransportKind::Http { url: "http://x".into() },
            enabled,
            quarantined: false,
            oauth: None,
            isolation: None,
        }
    }

    async fn make_supervisor() -> Arc<Supervisor> {
        let config = Arc::new(ConfigService::new(ConfigSnapshot::empty(None)));
        let adapter = Arc::new(UpstreamAdapter::new());
        let state_view = Arc::new(StateView::new());
        Supervisor::new(config, adapter, state_view)
    }

    #[tokio::test]
    async fn reconcile_adds_disabled_server_with_no_action() {
        let sup = make_supervisor().await;
        let mut next = (*sup.config.current()).clone();
        next.servers.push(descriptor("svc", false));
        sup.config.update(next, UpdateKind::Programmatic, "test".into()).await;

        sup.reconcile().await;

        let status = sup.state_view.get_server("svc").expect("server present in state view");
        assert!(!status.connected);
    }

    #[tokio::test]
    async fn inspection_circuit_trips_after_three_failures() {
        let sup = make_supervisor().await;
        for _ in 0..3 {
            sup.record_inspection_failure("svc").await;
        }
        let gate = sup.can_inspect("svc").await;
        assert!(matches!(gate, InspectionGate::Denied { .. }));
    }

    #[tokio::test]
    async fn inspection_circuit_allows_before_threshold() {
        let sup = make_supervisor().await;
        sup.record_inspection_failure("svc").await;
        sup.record_inspection_failure("svc").await;
        let gate = sup.can_inspect("svc").await;
        assert_eq!(gate, InspectionGate::Allowed);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let sup = make_supervisor().await;
        sup.record_inspection_failure("svc").await;
        sup.record_inspection_failure("svc").await;
        sup.record_inspection_success("svc").await;
        let stats = sup.get_inspection_stats("svc").await;
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn exemption_lets_quarantined_server_reconcile_as_unquarantined() {
        let sup = make_supervisor().await;
        let mut next = (*sup.config.current()).clone();
        let mut desc = descriptor("svc", true);
        desc.quarantined = true;
        next.servers.push(desc);
        sup.config.update(next, UpdateKind::Programmatic, "test".into()).await;

        sup.request_inspection_exemption("svc", Duration::from_secs(60)).await;

        let status = sup.state_view.get_server("svc").expect("present");
        assert!(!status.quarantined);
    }

    #[tokio::test]
    async fn revoking_exemption_restores_quarantine() {
        let sup = make_supervisor().await;
        let mut next = (*sup.config.current()).clone();
        let mut desc = descriptor("svc", true);
        desc.quarantined = true;
        next.servers.push(desc);
        sup.config.update(next, UpdateKind::Programmatic, "test".into()).await;

        sup.request_inspection_exemption("svc", Duration::from_secs(60)).await;
        sup.revoke_inspection_exemption("svc").await;

        let status = sup.state_view.get_server("svc").expect("present");
        assert!(status.quarantined);
    }
}
