pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod feedback;
pub mod motion;

pub use config::{SessionConfig, Settings};
pub use engine::{SessionHandle, TrainingSessionEngine};
pub use error::{MotionError, SessionError};
pub use events::{SessionEvent, SessionFact, SessionOutcome, SessionSnapshot, SessionState};
pub use feedback::{CueKind, FeedbackSink, LogFeedbackSink, RecordingFeedbackSink};
pub use motion::{
    MotionComplianceMonitor, MotionPattern, MotionSample, MotionSource, SamplingProfile,
    SimulatedMotionSource, UnavailableMotionSource,
};
