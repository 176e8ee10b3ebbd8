//! Service lifecycle states shared by stateful components.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a stateful service
///
/// Transitions: Uninitialized → Initializing → Running → Stopped; any
/// state may move to `Error` on unrecoverable failure; `Error` →
/// Stopped is permitted via cleanup; Running → Running is allowed for
/// refreshes. No other skips are legal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Not yet initialized
    Uninitialized,
    /// Initialization in progress
    Initializing,
    /// Ready to serve
    Running,
    /// Unrecoverable failure with the reason
    Error(String),
    /// Shut down; may be re-initialized
    Stopped,
}

impl ServiceState {
    /// Whether a transition from `self` to `next` is legal
    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        match (self, next) {
            // Any state may fail
            (_, Self::Error(_)) => true,
            (Self::Uninitialized, Self::Initializing) => true,
            (Self::Initializing, Self::Running) => true,
            // Refresh keeps the service running
            (Self::Running, Self::Running) => true,
            (Self::Running, Self::Stopped) => true,
            (Self::Error(_), Self::Stopped) => true,
            (Self::Stopped, Self::Initializing) => true,
            (Self::Stopped, Self::Stopped) => true,
            _ => false,
        }
    }

    /// True when the service can accept work
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::Error(reason) => write!(f, "error({reason})"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
