use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Activity name recorded for cadence sessions
pub const GRIP_ACTIVITY: &str = "grip";

/// One completed session as seen by the receiver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub session_id: Option<Uuid>,
    pub activity: String,
    pub total_reps: u32,
    pub warnings: u32,
    /// Seconds between the observed start and finish, when both were seen
    pub duration_secs: Option<u64>,
    pub recorded_at: DateTime<Utc>,
}

impl TrainingRecord {
    #[must_use]
    pub fn new(session_id: Option<Uuid>, total_reps: u32, warnings: u32) -> Self {
        Self {
            session_id,
            activity: GRIP_ACTIVITY.to_string(),
            total_reps,
            warnings,
            duration_secs: None,
            recorded_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn with_duration(mut self, secs: u64) -> Self {
        self.duration_secs = Some(secs);
        self
    }
}

/// Destination for finished-session statistics
pub trait StatsRecorder: Send {
    fn record(&mut self, record: TrainingRecord);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSummary {
    pub sessions: usize,
    pub total_reps: u64,
    pub total_warnings: u64,
}

#[derive(Debug, Default)]
pub struct MemoryStatsRecorder {
    records: Vec<TrainingRecord>,
}

impl MemoryStatsRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> &[TrainingRecord] {
        &self.records
    }

    #[must_use]
    pub fn summary(&self) -> StatsSummary {
        self.records
            .iter()
            .fold(StatsSummary::default(), |mut acc, record| {
                acc.sessions += 1;
                acc.total_reps += u64::from(record.total_reps);
                acc.total_warnings += u64::from(record.warnings);
                acc
            })
    }
}

impl StatsRecorder for MemoryStatsRecorder {
    fn record(&mut self, record: TrainingRecord) {
        log::info!(
            "Recorded {} session: {} reps, {} warnings",
            record.activity,
            record.total_reps,
            record.warnings
        );
        self.records.push(record);
    }
}
