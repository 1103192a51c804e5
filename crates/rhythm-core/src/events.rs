use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session lifecycle. Visited strictly in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    /// Countdown before the first rep
    Preparing,
    Training,
    Finished,
}

impl SessionState {
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Preparing => "Get ready",
            Self::Training => "Training",
            Self::Finished => "Finished",
        }
    }

    /// Whether the session still owns timers or the sensor
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Preparing | Self::Training)
    }
}

/// Facts produced by a running session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    Started,
    /// Local only, drives the rep counter display
    RepCompleted { index: u32 },
    ComplianceWarning { cumulative_warnings: u32 },
    Finished { total_reps: u32, total_warnings: u32 },
}

impl SessionEvent {
    /// Whether the companion device should hear about this event
    #[must_use]
    pub const fn is_remote(&self) -> bool {
        !matches!(self, Self::RepCompleted { .. })
    }
}

/// A remote-bound event tagged with its session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFact {
    pub session_id: Uuid,
    pub event: SessionEvent,
}

/// Display state, republished after every change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub count: u32,
    pub total_reps: u32,
    pub countdown: u32,
    pub warning_count: u32,
    pub sensor_available: bool,
}

impl SessionSnapshot {
    #[must_use]
    pub const fn idle(total_reps: u32, countdown_from: u32) -> Self {
        Self {
            state: SessionState::Idle,
            count: 0,
            total_reps,
            countdown: countdown_from,
            warning_count: 0,
            sensor_available: true,
        }
    }
}

/// How a session task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed { total_reps: u32, total_warnings: u32 },
    /// Cancelled by `force_stop` or by dropping every handle
    Stopped { state: SessionState, reps: u32, warnings: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rep_completed_is_local_only() {
        assert!(!SessionEvent::RepCompleted { index: 1 }.is_remote());
        assert!(SessionEvent::Started.is_remote());
        assert!(SessionEvent::ComplianceWarning {
            cumulative_warnings: 1
        }
        .is_remote());
        assert!(SessionEvent::Finished {
            total_reps: 20,
            total_warnings: 0
        }
        .is_remote());
    }

    #[test]
    fn test_active_states() {
        assert!(!SessionState::Idle.is_active());
        assert!(SessionState::Preparing.is_active());
        assert!(SessionState::Training.is_active());
        assert!(!SessionState::Finished.is_active());
    }
}
