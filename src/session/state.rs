use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::InvalidTransition;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Application close code the server uses for a rejected token.
pub const CLOSE_AUTH_FAILED: u16 = 4001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    AuthFailed,
    Error,
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::AuthFailed => "auth_failed",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Failed => "failed",
        }
    }

    /// A transport is being opened or is open.
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionStatus::Connecting | ConnectionStatus::Connected)
    }

    pub fn apply(self, transition: Transition) -> Result<ConnectionStatus, InvalidTransition> {
        use ConnectionStatus::*;
        use Transition::*;

        let next = match (self, transition) {
            (Disconnected | Reconnecting | Error | Failed, Dial) => Connecting,
            (Connecting, Opened) => Connected,
            (Connecting | Connected | Error, ClosedNormally) => Disconnected,
            (Connecting | Connected | Error | Reconnecting, AuthRejected) => AuthFailed,
            (Connecting | Connected, Faulted) => Error,
            (Connecting | Connected | Error, BackoffScheduled) => Reconnecting,
            (Connecting | Connected | Error | Reconnecting, RetriesExhausted) => Failed,
            // Auth failure survives a plain disconnect; only a new identity clears it.
            (AuthFailed, Reset) => AuthFailed,
            (_, Reset) => Disconnected,
            (_, IdentityChanged) => Disconnected,
            (from, transition) => return Err(InvalidTransition { from, transition }),
        };
        Ok(next)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A transport is being opened.
    Dial,
    Opened,
    ClosedNormally,
    AuthRejected,
    /// Transport-level error on the current connection.
    Faulted,
    BackoffScheduled,
    RetriesExhausted,
    /// Explicit disconnect or sign-out.
    Reset,
    /// Signed in as someone new, or signed out.
    IdentityChanged,
}

/// How a closed transport should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Normal,
    AuthFailure,
    Abnormal,
}

pub fn classify_close(code: u16, reason: &str) -> CloseKind {
    if code == CLOSE_POLICY_VIOLATION
        || code == CLOSE_AUTH_FAILED
        || reason.to_ascii_lowercase().contains("auth")
    {
        CloseKind::AuthFailure
    } else if code == CLOSE_NORMAL {
        CloseKind::Normal
    } else {
        CloseKind::Abnormal
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub api_base_url: String,
    pub language: String,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub typing_idle: Duration,
}

impl SessionSettings {
    pub fn new(api_base_url: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            language: language.into(),
            ..Self::default()
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000".to_string(),
            language: "en".to_string(),
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_reconnect_attempts: 5,
            typing_idle: Duration::from_secs(1),
        }
    }
}

/// Delay before reconnect attempt number `attempt + 1`:
/// `min(base * 2^attempt, max)`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionStatus::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_millis(1000);
        let max = Duration::from_millis(30_000);
        let delays: Vec<u128> = (0..7).map(|n| backoff_delay(n, base, max).as_millis()).collect();
        assert_eq!(delays, [1000, 2000, 4000, 8000, 16000, 30000, 30000]);
        assert_eq!(backoff_delay(64, base, max), max);
    }

    #[test]
    fn close_classification() {
        assert_eq!(classify_close(1008, ""), CloseKind::AuthFailure);
        assert_eq!(classify_close(4001, ""), CloseKind::AuthFailure);
        assert_eq!(classify_close(1011, "Auth token expired"), CloseKind::AuthFailure);
        assert_eq!(classify_close(1000, "Manual disconnect"), CloseKind::Normal);
        assert_eq!(classify_close(1006, ""), CloseKind::Abnormal);
        assert_eq!(classify_close(1001, "going away"), CloseKind::Abnormal);
    }

    #[test]
    fn happy_path() {
        let s = Disconnected.apply(Transition::Dial).unwrap();
        assert_eq!(s, Connecting);
        let s = s.apply(Transition::Opened).unwrap();
        assert_eq!(s, Connected);
        assert_eq!(s.apply(Transition::ClosedNormally).unwrap(), Disconnected);
    }

    #[test]
    fn reconnect_cycle() {
        let s = Connected.apply(Transition::BackoffScheduled).unwrap();
        assert_eq!(s, Reconnecting);
        assert_eq!(s.apply(Transition::Dial).unwrap(), Connecting);
        assert_eq!(Error.apply(Transition::BackoffScheduled).unwrap(), Reconnecting);
        assert_eq!(Connecting.apply(Transition::RetriesExhausted).unwrap(), Failed);
    }

    #[test]
    fn auth_failed_is_sticky() {
        assert!(AuthFailed.apply(Transition::Dial).is_err());
        assert!(AuthFailed.apply(Transition::BackoffScheduled).is_err());
        assert_eq!(AuthFailed.apply(Transition::Reset).unwrap(), AuthFailed);
        assert_eq!(AuthFailed.apply(Transition::IdentityChanged).unwrap(), Disconnected);
    }

    #[test]
    fn rejects_nonsense_edges() {
        assert!(Connected.apply(Transition::Dial).is_err());
        assert!(Disconnected.apply(Transition::Opened).is_err());
        assert!(Disconnected.apply(Transition::Faulted).is_err());
        assert!(Failed.apply(Transition::BackoffScheduled).is_err());
    }

    #[test]
    fn status_names() {
        assert_eq!(AuthFailed.to_string(), "auth_failed");
        assert_eq!(serde_json::to_string(&Reconnecting).unwrap(), "\"reconnecting\"");
    }
}
