//! Health calculator — a pure function from `(HealthInput, HealthConfig)`
//! to a display-ready health result. No I/O, no async; every branch is
//! independently unit-testable.
//!
//! The deterministic error-substring table and missing-secret/OAuth
//! extraction generalize the literal substring checks the teacher's
//! `oauth.rs` makes against provider error strings.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionInfo, ConnectionState};
use crate::model::truncate_with_ellipsis;

const MAX_SUMMARY_CHARS: usize = 50;
const TOKEN_EXPIRING_WINDOW: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminState {
    Enabled,
    Disabled,
    Quarantined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthAction {
    None,
    Enable,
    Approve,
    Restart,
    Login,
    SetSecret,
    Configure,
    ViewLogs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
    pub level: HealthLevel,
    pub admin_state: AdminState,
    pub summary: String,
    pub detail: Option<String>,
    pub action: HealthAction,
}

/// Everything the calculator needs about one server, assembled by the
/// caller from `ServerState` + `ConnectionInfo` (spec §4.6).
pub struct HealthInput<'a> {
    pub enabled: bool,
    pub quarantined: bool,
    pub connected: bool,
    pub tool_count: usize,
    pub connection_info: &'a ConnectionInfo,
    pub has_refresh_token: bool,
    pub refresh_retrying: bool,
    pub refresh_failed: bool,
    pub token_expires_in: Option<Duration>,
}

/// Placeholder for future tunables (none required by spec §4.6 today)
/// kept so the function signature matches the contract's
/// `(input, config)` shape without inventing fields nobody reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthConfig;

static MISSING_SECRET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)environment variable ([A-Z0-9_]+) not found or empty|\$\{env:([A-Za-z0-9_]+)\}"#).unwrap()
});

static OAUTH_CONFIG_ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)requires 'resource' parameter|missing client_id"#).unwrap());

pub fn extract_missing_secret(err: &str) -> Option<String> {
    let caps = MISSING_SECRET_RE.captures(err)?;
    caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str().to_string())
}

pub fn extract_oauth_config_error(err: &str) -> Option<&'static str> {
    if OAUTH_CONFIG_ERROR_RE.is_match(err) {
        Some("OAuth configuration error")
    } else {
        None
    }
}

/// Priority-ordered branch table (spec §4.6). Earlier branches win.
pub fn calculate_health(input: &HealthInput<'_>, _config: &HealthConfig) -> HealthResult {
    if !input.enabled {
        return HealthResult {
            level: HealthLevel::Healthy,
            admin_state: AdminState::Disabled,
            summary: "Disabled".into(),
            detail: None,
            action: HealthAction::Enable,
        };
    }

    if input.quarantined {
        return HealthResult {
            level: HealthLevel::Healthy,
            admin_state: AdminState::Quarantined,
            summary: "Quarantined for review".into(),
            detail: None,
            action: HealthAction::Approve,
        };
    }

    if let Some(err) = input.connection_info.last_error.as_deref() {
        if let Some(var) = extract_missing_secret(err) {
            return HealthResult {
                level: HealthLevel::Unhealthy,
                admin_state: AdminState::Enabled,
                summary: "Missing secret".into(),
                detail: Some(format!("Environment variable {var} not found or empty")),
                action: HealthAction::SetSecret,
            };
        }

        if extract_oauth_config_error(err).is_some() {
            return HealthResult {
                level: HealthLevel::Unhealthy,
                admin_state: AdminState::Enabled,
                summary: "OAuth configuration error".into(),
                detail: Some(err.to_string()),
                action: HealthAction::Configure,
            };
        }
    }

    if matches!(input.connection_info.state, ConnectionState::Error | ConnectionState::Disconnected)
        && !input.connection_info.is_oauth_error
        && !input.connection_info.user_logged_out
        && input.connection_info.last_error.is_some()
    {
        let err = input.connection_info.last_error.as_deref().unwrap_or("");
        return HealthResult {
            level: HealthLevel::Unhealthy,
            admin_state: AdminState::Enabled,
            summary: summarize_connection_error(err),
            detail: Some(truncate_with_ellipsis(err, 500)),
            action: HealthAction::Restart,
        };
    }

    if input.connection_info.state == ConnectionState::PendingAuth && !input.connection_info.is_oauth_error {
        return HealthResult {
            level: HealthLevel::Unhealthy,
            admin_state: AdminState::Enabled,
            summary: "Authentication required".into(),
            detail: None,
            action: HealthAction::Login,
        };
    }

    if input.connection_info.is_oauth_error {
        if input.refresh_failed {
            return HealthResult {
                level: HealthLevel::Unhealthy,
                admin_state: AdminState::Enabled,
                summary: "Refresh token expired".into(),
                detail: input.connection_info.last_error.clone(),
                action: HealthAction::Login,
            };
        }

        if input.refresh_retrying {
            return HealthResult {
                level: HealthLevel::Degraded,
                admin_state: AdminState::Enabled,
                summary: "Token refresh pending".into(),
                detail: None,
                action: HealthAction::ViewLogs,
            };
        }

        return HealthResult {
            level: HealthLevel::Unhealthy,
            admin_state: AdminState::Enabled,
            summary: "OAuth error".into(),
            detail: input.connection_info.last_error.clone(),
            action: HealthAction::Login,
        };
    }

    if input.connection_info.user_logged_out {
        return HealthResult {
            level: HealthLevel::Unhealthy,
            admin_state: AdminState::Enabled,
            summary: "Logged out".into(),
            detail: None,
            action: HealthAction::Login,
        };
    }

    if let Some(remaining) = input.token_expires_in {
        if remaining <= TOKEN_EXPIRING_WINDOW && !input.has_refresh_token {
            return HealthResult {
                level: HealthLevel::Degraded,
                admin_state: AdminState::Enabled,
                summary: format_expiring(remaining),
                detail: None,
                action: HealthAction::Login,
            };
        }
    }

    if matches!(
        input.connection_info.state,
        ConnectionState::Connecting | ConnectionState::PendingAuth | ConnectionState::Authenticating | ConnectionState::Discovering
    ) {
        return HealthResult {
            level: HealthLevel::Degraded,
            admin_state: AdminState::Enabled,
            summary: "Connecting...".into(),
            detail: None,
            action: HealthAction::None,
        };
    }

    if input.connection_info.state == ConnectionState::Ready || input.connected {
        return HealthResult {
            level: HealthLevel::Healthy,
            admin_state: AdminState::Enabled,
            summary: format_connected_summary(input.tool_count),
            detail: None,
            action: HealthAction::None,
        };
    }

    HealthResult {
        level: HealthLevel::Degraded,
        admin_state: AdminState::Enabled,
        summary: "Connecting...".into(),
        detail: None,
        action: HealthAction::None,
    }
}

fn format_connected_summary(tool_count: usize) -> String {
    if tool_count == 1 {
        "Connected (1 tool)".to_string()
    } else {
        format!("Connected ({tool_count} tools)")
    }
}

fn format_expiring(remaining: Duration) -> String {
    let secs = remaining.as_secs();
    if secs < 3600 {
        let mins = (secs / 60).max(1);
        truncate_with_ellipsis(&format!("Token expiring in {mins}m"), MAX_SUMMARY_CHARS)
    } else {
        let hours = (secs / 3600).max(1);
        truncate_with_ellipsis(&format!("Token expiring in {hours}h"), MAX_SUMMARY_CHARS)
    }
}

/// Deterministic substring-to-summary mapping (spec §4.6/§7). Checked
/// in order; first match wins.
fn summarize_connection_error(err: &str) -> String {
    let lower = err.to_lowercase();
    let mapped = if lower.contains("connection refused") {
        "Connection refused"
    } else if lower.contains("no such host") {
        "Host not found"
    } else if lower.contains("connection reset") {
        "Connection reset"
    } else if lower.contains("deadline") || lower.contains("timeout") {
        "Connection timeout"
    } else if lower.contains("unexpected eof") {
        "Connection closed"
    } else if lower.contains("oauth:") {
        "OAuth error"
    } else if lower.contains("x509") {
        "Certificate error"
    } else if lower.contains("dial tcp") {
        "Cannot connect"
    } else {
        "Connection error"
    };
    truncate_with_ellipsis(mapped, MAX_SUMMARY_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_info() -> ConnectionInfo {
        crate::connection::ConnectionStateMachine::new("svc").get_connection_info()
    }

    fn base_input(info: &ConnectionInfo) -> HealthInput<'_> {
        HealthInput {
            enabled: true,
            quarantined: false,
            connected: false,
            tool_count: 0,
            connection_info: info,
            has_refresh_token: true,
            refresh_retrying: false,
            refresh_failed: false,
            token_expires_in: None,
        }
    }

    #[test]
    fn disabled_wins_over_everything_else() {
        let info = base_info();
        let mut input = base_input(&info);
        input.enabled = false;
        input.quarantined = true;
        let result = calculate_health(&input, &HealthConfig);
        assert_eq!(result.admin_state, AdminState::Disabled);
        assert_eq!(result.action, HealthAction::Enable);
    }

    #[test]
    fn quarantined_beats_connection_errors() {
        let info = base_info();
        let mut input = base_input(&info);
        input.quarantined = true;
        let result = calculate_health(&input, &HealthConfig);
        assert_eq!(result.admin_state, AdminState::Quarantined);
        assert_eq!(result.summary, "Quarantined for review");
    }

    #[test]
    fn missing_secret_is_extracted_and_unhealthy() {
        let machine = crate::connection::ConnectionStateMachine::new("svc");
        machine.set_error("environment variable GITHUB_TOKEN not found or empty");
        let info = machine.get_connection_info();
        let input = base_input(&info);
        let result = calculate_health(&input, &HealthConfig);
        assert_eq!(result.summary, "Missing secret");
        assert_eq!(result.action, HealthAction::SetSecret);
        assert!(result.detail.unwrap().contains("GITHUB_TOKEN"));
    }

    #[test]
    fn connection_refused_maps_to_known_summary() {
        let machine = crate::connection::ConnectionStateMachine::new("svc");
        machine.set_error("dial tcp 127.0.0.1:9: connection refused");
        let info = machine.get_connection_info();
        let input = base_input(&info);
        let result = calculate_health(&input, &HealthConfig);
        assert_eq!(result.summary, "Connection refused");
        assert_eq!(result.action, HealthAction::Restart);
    }

    #[test]
    fn ready_state_reports_tool_count_pluralized() {
        let machine = crate::connection::ConnectionStateMachine::new("svc");
        machine.transition_to(ConnectionState::Connecting);
        machine.transition_to(ConnectionState::Discovering);
        machine.transition_to(ConnectionState::Ready);
        let info = machine.get_connection_info();
        let mut input = base_input(&info);
        input.connected = true;
        input.tool_count = 1;
        let result = calculate_health(&input, &HealthConfig);
        assert_eq!(result.summary, "Connected (1 tool)");

        input.tool_count = 3;
        let result = calculate_health(&input, &HealthConfig);
        assert_eq!(result.summary, "Connected (3 tools)");
    }

    #[test]
    fn summary_never_exceeds_fifty_chars() {
        let out = format_expiring(Duration::from_secs(59));
        assert!(out.chars().count() <= MAX_SUMMARY_CHARS);
    }

    #[test]
    fn logged_out_latch_takes_login_action() {
        let machine = crate::connection::ConnectionStateMachine::new("svc");
        machine.set_user_logged_out(true);
        let info = machine.get_connection_info();
        let input = base_input(&info);
        let result = calculate_health(&input, &HealthConfig);
        assert_eq!(result.summary, "Logged out");
        assert_eq!(result.action, HealthAction::Login);
    }
}
