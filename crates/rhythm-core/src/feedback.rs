use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Local haptic/audio cue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CueKind {
    /// Countdown step
    Click,
    /// Cadence beat: perform a rep now
    RhythmTick,
    /// Missed rep
    Warning,
    /// Session complete
    Success,
}

impl CueKind {
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::RhythmTick => "rhythm",
            Self::Warning => "warning",
            Self::Success => "success",
        }
    }
}

/// Output device for cues. Fire-and-forget: the engine never waits on it.
pub trait FeedbackSink: Send + Sync {
    fn play_cue(&self, kind: CueKind);
}

/// Writes cues to the log
#[derive(Debug, Default)]
pub struct LogFeedbackSink;

impl FeedbackSink for LogFeedbackSink {
    fn play_cue(&self, kind: CueKind) {
        log::debug!("cue: {}", kind.description());
    }
}

/// Keeps every cue in order, for inspection
#[derive(Debug, Default, Clone)]
pub struct RecordingFeedbackSink {
    cues: Arc<Mutex<Vec<CueKind>>>,
}

impl RecordingFeedbackSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn cues(&self) -> Vec<CueKind> {
        self.cues.lock().map(|c| c.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn count(&self, kind: CueKind) -> usize {
        self.cues().iter().filter(|c| **c == kind).count()
    }
}

impl FeedbackSink for RecordingFeedbackSink {
    fn play_cue(&self, kind: CueKind) {
        if let Ok(mut cues) = self.cues.lock() {
            cues.push(kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingFeedbackSink::new();
        let shared: Arc<dyn FeedbackSink> = Arc::new(sink.clone());

        shared.play_cue(CueKind::Click);
        shared.play_cue(CueKind::RhythmTick);
        shared.play_cue(CueKind::Click);

        assert_eq!(
            sink.cues(),
            vec![CueKind::Click, CueKind::RhythmTick, CueKind::Click]
        );
        assert_eq!(sink.count(CueKind::Click), 2);
        assert_eq!(sink.count(CueKind::Success), 0);
    }
}
