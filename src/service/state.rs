use std::fmt;

/// Node lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Created,
    Configured,
    Clustering,
    Listening,
    Closing,
    Closed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Configured => "configured",
            LifecycleState::Clustering => "clustering",
            LifecycleState::Listening => "listening",
            LifecycleState::Closing => "closing",
            LifecycleState::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Closed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
