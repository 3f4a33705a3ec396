//! Per-server connection state machine.
//!
//! One `ConnectionStateMachine` per upstream server. Guarded by a single
//! `parking_lot::Mutex` — a synchronous critical section with no
//! `.await` ever taken while held, matching spec §5's "per-server mutex
//! never held across callbacks or I/O" invariant. The registered
//! state-change callback is always invoked *after* the lock is
//! released.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::model::truncate_with_ellipsis;

const MAX_LAST_ERROR_CHARS: usize = 500;
const MAX_RETRY_COUNT: u32 = 30;
const NON_OAUTH_MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// OAuth backoff ladder indexed by `oauthRetryCount.min(5)`.
const OAUTH_BACKOFF_LADDER: [Duration; 6] = [
    Duration::from_secs(0),
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(4 * 60 * 60),
    Duration::from_secs(24 * 60 * 60),
];

/// The finite set of connection states (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    PendingAuth,
    Authenticating,
    Discovering,
    Ready,
    Error,
}

impl ConnectionState {
    /// Lower-cased state name, used verbatim by the state-view label
    /// derivation rule in spec §4.4.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::PendingAuth => "pending_auth",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Discovering => "discovering",
            ConnectionState::Ready => "ready",
            ConnectionState::Error => "error",
        }
    }

    /// The valid-transition table from spec §3. Self-transitions are
    /// never valid (a transition always means "something changed").
    fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Disconnected, Connecting) => true,
            (Connecting, PendingAuth | Authenticating | Discovering | Ready | Error | Disconnected) => true,
            // PendingAuth is a parked state; it returns to Connecting when
            // the user initiates login (§3).
            (PendingAuth, Connecting | Authenticating | Error | Disconnected) => true,
            (Authenticating, Connecting | Discovering | Ready | Error | Disconnected) => true,
            (Discovering, Ready | Error | Disconnected) => true,
            (Ready, Disconnected | Error) => true,
            (Error, Connecting | Disconnected) => true,
            _ => false,
        }
    }
}

/// Mutable per-server connection info (spec §3). Cloned out of the
/// mutex for every accessor — never shared by reference.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub last_retry_time: Option<DateTime<Utc>>,
    pub discovered_name: Option<String>,
    pub discovered_version: Option<String>,
    pub last_oauth_attempt: Option<DateTime<Utc>>,
    pub oauth_retry_count: u32,
    pub is_oauth_error: bool,
    pub user_logged_out: bool,
}

impl ConnectionInfo {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_error: None,
            retry_count: 0,
            last_retry_time: None,
            discovered_name: None,
            discovered_version: None,
            last_oauth_attempt: None,
            oauth_retry_count: 0,
            is_oauth_error: false,
            user_logged_out: false,
        }
    }

    /// Ready clears all error/retry/OAuth/logout fields (spec §3
    /// invariant).
    fn clear_on_ready(&mut self) {
        self.last_error = None;
        self.retry_count = 0;
        self.last_retry_time = None;
        self.last_oauth_attempt = None;
        self.oauth_retry_count = 0;
        self.is_oauth_error = false;
        self.user_logged_out = false;
    }

    /// `min(2^(retryCount-1) sec, 5 min)` gate, computed from a plain
    /// snapshot so callers outside the owning `ConnectionStateMachine`
    /// (the supervisor's reconcile loop, in particular) can decide
    /// whether a reconnect attempt is due without reaching back into
    /// the per-server mutex. Per spec §4.2/§8: the logout latch and
    /// current state gate retries before the backoff math is even
    /// consulted.
    pub fn should_retry(&self) -> bool {
        if self.user_logged_out || self.state != ConnectionState::Error {
            return false;
        }
        if self.retry_count == 0 {
            return true;
        }
        let Some(last) = self.last_retry_time else {
            return true;
        };
        elapsed_since(last) >= non_oauth_backoff(self.retry_count)
    }

    /// OAuth backoff ladder gate — same rationale as `should_retry`.
    pub fn should_retry_oauth(&self) -> bool {
        if self.user_logged_out || !self.is_oauth_error || self.state != ConnectionState::Error {
            return false;
        }
        if self.oauth_retry_count == 0 {
            return true;
        }
        let Some(last) = self.last_oauth_attempt else {
            return true;
        };
        elapsed_since(last) >= oauth_backoff(self.oauth_retry_count)
    }
}

/// Callback invoked after every state transition, outside the
/// per-server mutex: `(old_state, new_state, connection_info_copy)`.
pub type StateChangeCallback = Arc<dyn Fn(ConnectionState, ConnectionState, ConnectionInfo) + Send + Sync>;

struct Inner {
    info: ConnectionInfo,
    callback: Option<StateChangeCallback>,
}

pub struct ConnectionStateMachine {
    name: String,
    inner: Mutex<Inner>,
}

impl ConnectionStateMachine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                info: ConnectionInfo::new(),
                callback: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the single state-change callback. Replaces any prior
    /// registration (spec §4.2 names exactly one callback slot).
    pub fn on_state_change(&self, callback: StateChangeCallback) {
        self.inner.lock().callback = Some(callback);
    }

    pub fn get_state(&self) -> ConnectionState {
        self.inner.lock().info.state
    }

    pub fn get_connection_info(&self) -> ConnectionInfo {
        self.inner.lock().info.clone()
    }

    pub fn is_user_logged_out(&self) -> bool {
        self.inner.lock().info.user_logged_out
    }

    /// Move to `next`. Invalid transitions are rejected in debug builds
    /// (`debug_assert!`) and logged-and-applied in release (DESIGN.md
    /// Open Question #1).
    pub fn transition_to(&self, next: ConnectionState) {
        let (old, info, callback) = {
            let mut guard = self.inner.lock();
            let old = guard.info.state;

            if old == next {
                return;
            }

            if !old.can_transition_to(next) {
                debug_assert!(
                    false,
                    "invalid connection state transition for '{}': {:?} -> {:?}",
                    self.name, old, next
                );
                tracing::warn!(
                    server = %self.name,
                    from = old.label(),
                    to = next.label(),
                    "applying connection state transition outside the declared table"
                );
            }

            guard.info.state = next;
            if next == ConnectionState::Ready {
                guard.info.clear_on_ready();
            }

            (old, guard.info.clone(), guard.callback.clone())
        };

        tracing::debug!(server = %self.name, from = old.label(), to = next.label(), "connection state changed");

        if let Some(cb) = callback {
            cb(old, next, info);
        }
    }

    /// Non-OAuth error path: increments `retry_count` + timestamp only
    /// (spec §3 invariant).
    pub fn set_error(&self, message: impl Into<String>) {
        let (old, info, callback) = {
            let mut guard = self.inner.lock();
            let old = guard.info.state;
            let msg = message.into();
            guard.info.state = ConnectionState::Error;
            guard.info.last_error = Some(truncate_with_ellipsis(&msg, MAX_LAST_ERROR_CHARS));
            guard.info.retry_count = (guard.info.retry_count + 1).min(MAX_RETRY_COUNT);
            guard.info.last_retry_time = Some(Utc::now());
            (old, guard.info.clone(), guard.callback.clone())
        };

        tracing::warn!(server = %self.name, error = %info.last_error.as_deref().unwrap_or(""), "connection error recorded");

        if let Some(cb) = callback {
            cb(old, ConnectionState::Error, info);
        }
    }

    /// OAuth error path: increments `oauth_retry_count` + timestamp +
    /// `is_oauth_error` only (spec §3 invariant) — `retry_count` is
    /// untouched.
    pub fn set_oauth_error(&self, message: impl Into<String>) {
        let (old, info, callback) = {
            let mut guard = self.inner.lock();
            let old = guard.info.state;
            let msg = message.into();
            guard.info.state = ConnectionState::Error;
            guard.info.last_error = Some(truncate_with_ellipsis(&msg, MAX_LAST_ERROR_CHARS));
            guard.info.oauth_retry_count = (guard.info.oauth_retry_count + 1).min(MAX_RETRY_COUNT);
            guard.info.last_oauth_attempt = Some(Utc::now());
            guard.info.is_oauth_error = true;
            (old, guard.info.clone(), guard.callback.clone())
        };

        tracing::warn!(server = %self.name, error = %info.last_error.as_deref().unwrap_or(""), "oauth error recorded");

        if let Some(cb) = callback {
            cb(old, ConnectionState::Error, info);
        }
    }

    pub fn set_server_info(&self, name: Option<String>, version: Option<String>) {
        let mut guard = self.inner.lock();
        guard.info.discovered_name = name;
        guard.info.discovered_version = version;
    }

    /// Latches `user_logged_out`. Only cleared by `reset()` or a
    /// successful `Ready` transition.
    pub fn set_user_logged_out(&self, logged_out: bool) {
        self.inner.lock().info.user_logged_out = logged_out;
    }

    /// `min(2^(retryCount-1) sec, 5 min)`, clamped to `retryCount <= 30`
    /// (spec §4.2/§8). `retry_count == 0` always allows an immediate
    /// retry.
    pub fn should_retry(&self) -> bool {
        self.inner.lock().info.should_retry()
    }

    /// OAuth backoff ladder lookup (spec §4.2/§8).
    pub fn should_retry_oauth(&self) -> bool {
        self.inner.lock().info.should_retry_oauth()
    }

    /// Clears all error/retry/OAuth/logout state and returns to
    /// `Disconnected`, without invoking the state-change callback twice
    /// for two logically distinct effects — one transition, one
    /// notification.
    pub fn reset(&self) {
        let (old, info, callback) = {
            let mut guard = self.inner.lock();
            let old = guard.info.state;
            guard.info = ConnectionInfo::new();
            (old, guard.info.clone(), guard.callback.clone())
        };

        if old != ConnectionState::Disconnected {
            if let Some(cb) = callback {
                cb(old, ConnectionState::Disconnected, info);
            }
        }
    }
}

fn non_oauth_backoff(retry_count: u32) -> Duration {
    let clamped = retry_count.min(MAX_RETRY_COUNT);
    let exp = clamped.saturating_sub(1);
    // 2^exp seconds, saturating before the cast to avoid overflow for
    // large exponents — the min() against the ceiling makes the exact
    // magnitude irrelevant past a handful of doublings.
    let secs = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(NON_OAUTH_MAX_BACKOFF)
}

fn oauth_backoff(oauth_retry_count: u32) -> Duration {
    let idx = (oauth_retry_count as usize).min(OAUTH_BACKOFF_LADDER.len() - 1);
    OAUTH_BACKOFF_LADDER[idx]
}

fn elapsed_since(t: DateTime<Utc>) -> Duration {
    let now = Utc::now();
    (now - t).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fresh_machine_starts_disconnected() {
        let m = ConnectionStateMachine::new("svc");
        assert_eq!(m.get_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn ready_clears_error_and_retry_state() {
        let m = ConnectionStateMachine::new("svc");
        m.transition_to(ConnectionState::Connecting);
        m.set_error("boom");
        assert_eq!(m.get_connection_info().retry_count, 1);
        m.transition_to(ConnectionState::Connecting);
        m.transition_to(ConnectionState::Discovering);
        m.transition_to(ConnectionState::Ready);
        let info = m.get_connection_info();
        assert_eq!(info.retry_count, 0);
        assert!(info.last_error.is_none());
        assert!(!info.is_oauth_error);
    }

    #[test]
    fn non_oauth_error_never_touches_oauth_fields() {
        let m = ConnectionStateMachine::new("svc");
        m.set_error("connection refused");
        let info = m.get_connection_info();
        assert_eq!(info.oauth_retry_count, 0);
        assert!(!info.is_oauth_error);
        assert_eq!(info.retry_count, 1);
    }

    #[test]
    fn oauth_error_never_touches_retry_count() {
        let m = ConnectionStateMachine::new("svc");
        m.set_oauth_error("token expired");
        let info = m.get_connection_info();
        assert_eq!(info.retry_count, 0);
        assert_eq!(info.oauth_retry_count, 1);
        assert!(info.is_oauth_error);
    }

    #[test]
    fn retry_count_clamps_at_thirty() {
        let m = ConnectionStateMachine::new("svc");
        for _ in 0..40 {
            m.set_error("fail");
        }
        assert_eq!(m.get_connection_info().retry_count, MAX_RETRY_COUNT);
    }

    #[test]
    fn last_error_is_truncated_with_ellipsis() {
        let m = ConnectionStateMachine::new("svc");
        m.set_error("x".repeat(600));
        let info = m.get_connection_info();
        let err = info.last_error.unwrap();
        assert_eq!(err.chars().count(), 503);
        assert!(err.ends_with("..."));
    }

    #[test]
    fn callback_fires_after_lock_release_with_old_and_new_state() {
        let m = ConnectionStateMachine::new("svc");
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        m.on_state_change(Arc::new(move |old, new, _info| {
            assert_eq!(old, ConnectionState::Disconnected);
            assert_eq!(new, ConnectionState::Connecting);
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        m.transition_to(ConnectionState::Connecting);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn should_retry_is_immediate_at_zero_retries() {
        let m = ConnectionStateMachine::new("svc");
        m.set_error("boom");
        assert!(m.should_retry());
    }

    #[test]
    fn should_retry_false_outside_error_state() {
        let m = ConnectionStateMachine::new("svc");
        assert!(!m.should_retry());
        m.transition_to(ConnectionState::Connecting);
        assert!(!m.should_retry());
    }

    #[test]
    fn should_retry_false_when_logged_out() {
        let m = ConnectionStateMachine::new("svc");
        m.set_error("boom");
        m.set_user_logged_out(true);
        assert!(!m.should_retry());
        assert!(!m.should_retry_oauth());
    }

    #[test]
    fn should_retry_oauth_false_for_non_oauth_error() {
        let m = ConnectionStateMachine::new("svc");
        m.set_error("boom");
        assert!(!m.should_retry_oauth());
    }

    #[test]
    fn oauth_backoff_ladder_matches_spec() {
        assert_eq!(oauth_backoff(0), Duration::from_secs(0));
        assert_eq!(oauth_backoff(1), Duration::from_secs(5 * 60));
        assert_eq!(oauth_backoff(2), Duration::from_secs(15 * 60));
        assert_eq!(oauth_backoff(3), Duration::from_secs(60 * 60));
        assert_eq!(oauth_backoff(4), Duration::from_secs(4 * 60 * 60));
        assert_eq!(oauth_backoff(5), Duration::from_secs(24 * 60 * 60));
        assert_eq!(oauth_backoff(9), Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn non_oauth_backoff_caps_at_five_minutes() {
        assert_eq!(non_oauth_backoff(1), Duration::from_secs(1));
        assert_eq!(non_oauth_backoff(2), Duration::from_secs(2));
        assert_eq!(non_oauth_backoff(10), NON_OAUTH_MAX_BACKOFF);
        assert_eq!(non_oauth_backoff(30), NON_OAUTH_MAX_BACKOFF);
    }

    #[test]
    fn reset_returns_to_disconnected_and_clears_logout_latch() {
        let m = ConnectionStateMachine::new("svc");
        m.set_user_logged_out(true);
        m.set_error("boom");
        m.reset();
        let info = m.get_connection_info();
        assert_eq!(info.state, ConnectionState::Disconnected);
        assert!(!info.user_logged_out);
        assert_eq!(info.retry_count, 0);
    }
}
