//! Wire format for cross-device facts.
//!
//! A fact travels as a flat JSON object: a `command` string plus the
//! command's fields, e.g. `{"command":"training_finished","totalReps":20,"warnings":3}`.
//! Receivers accept payloads without the optional id fields.

use rhythm_core::{SessionEvent, SessionFact};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

const TRAINING_STARTED: &str = "training_started";
const TRAINING_FINISHED: &str = "training_finished";
const PLAY_ENCOURAGEMENT: &str = "play_jiayou";
const START_REQUEST: &str = "start_grip_training";

const FIELD_SESSION_ID: &str = "sessionId";
const FIELD_TOTAL_REPS: &str = "totalReps";
const FIELD_WARNINGS: &str = "warnings";
const FIELD_REQUEST_ID: &str = "requestId";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("field `{field}` missing or invalid in `{command}`")]
    InvalidField {
        command: &'static str,
        field: &'static str,
    },
}

/// Tagged record as it appears on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub command: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Which transport paths a fact uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Transient send plus durable publish
    Dual,
    TransientOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactKind {
    TrainingStarted,
    TrainingFinished,
    Encouragement,
    StartRequest,
}

impl FactKind {
    #[must_use]
    pub const fn command(&self) -> &'static str {
        match self {
            Self::TrainingStarted => TRAINING_STARTED,
            Self::TrainingFinished => TRAINING_FINISHED,
            Self::Encouragement => PLAY_ENCOURAGEMENT,
            Self::StartRequest => START_REQUEST,
        }
    }

    /// Durable slot name: one pending value per kind
    #[must_use]
    pub const fn slot(&self) -> &'static str {
        self.command()
    }

    #[must_use]
    pub const fn delivery(&self) -> Delivery {
        match self {
            Self::TrainingStarted | Self::TrainingFinished => Delivery::Dual,
            Self::Encouragement | Self::StartRequest => Delivery::TransientOnly,
        }
    }
}

/// A fact exchanged between the wrist device and its companion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fact {
    TrainingStarted {
        session_id: Option<Uuid>,
    },
    TrainingFinished {
        session_id: Option<Uuid>,
        total_reps: u32,
        warnings: u32,
    },
    /// Companion should cheer the wearer on after a missed rep
    PlayEncouragement,
    /// Companion asks the wrist device to start a session
    StartRequest {
        request_id: Option<u64>,
    },
}

impl Fact {
    #[must_use]
    pub const fn kind(&self) -> FactKind {
        match self {
            Self::TrainingStarted { .. } => FactKind::TrainingStarted,
            Self::TrainingFinished { .. } => FactKind::TrainingFinished,
            Self::PlayEncouragement => FactKind::Encouragement,
            Self::StartRequest { .. } => FactKind::StartRequest,
        }
    }

    #[must_use]
    pub const fn session_id(&self) -> Option<Uuid> {
        match self {
            Self::TrainingStarted { session_id } | Self::TrainingFinished { session_id, .. } => {
                *session_id
            }
            Self::PlayEncouragement | Self::StartRequest { .. } => None,
        }
    }

    /// Map an engine fact to its wire form. Local-only events map to `None`.
    #[must_use]
    pub fn from_session_fact(fact: &SessionFact) -> Option<Self> {
        let session_id = Some(fact.session_id);
        match fact.event {
            SessionEvent::Started => Some(Self::TrainingStarted { session_id }),
            SessionEvent::Finished {
                total_reps,
                total_warnings,
            } => Some(Self::TrainingFinished {
                session_id,
                total_reps,
                warnings: total_warnings,
            }),
            SessionEvent::ComplianceWarning { .. } => Some(Self::PlayEncouragement),
            SessionEvent::RepCompleted { .. } => None,
        }
    }

    #[must_use]
    pub fn to_message(&self) -> WireMessage {
        let mut fields = Map::new();
        match *self {
            Self::TrainingStarted { session_id } => {
                insert_session_id(&mut fields, session_id);
            }
            Self::TrainingFinished {
                session_id,
                total_reps,
                warnings,
            } => {
                insert_session_id(&mut fields, session_id);
                fields.insert(FIELD_TOTAL_REPS.to_string(), Value::from(total_reps));
                fields.insert(FIELD_WARNINGS.to_string(), Value::from(warnings));
            }
            Self::PlayEncouragement => {}
            Self::StartRequest { request_id } => {
                if let Some(id) = request_id {
                    fields.insert(FIELD_REQUEST_ID.to_string(), Value::from(id));
                }
            }
        }
        WireMessage {
            command: self.kind().command().to_string(),
            fields,
        }
    }

    /// # Errors
    ///
    /// Returns `CodecError` for unknown commands or missing/invalid fields.
    pub fn from_message(message: &WireMessage) -> Result<Self, CodecError> {
        match message.command.as_str() {
            TRAINING_STARTED => Ok(Self::TrainingStarted {
                session_id: session_id(&message.fields, TRAINING_STARTED)?,
            }),
            TRAINING_FINISHED => Ok(Self::TrainingFinished {
                session_id: session_id(&message.fields, TRAINING_FINISHED)?,
                total_reps: required_u32(&message.fields, TRAINING_FINISHED, FIELD_TOTAL_REPS)?,
                warnings: required_u32(&message.fields, TRAINING_FINISHED, FIELD_WARNINGS)?,
            }),
            PLAY_ENCOURAGEMENT => Ok(Self::PlayEncouragement),
            START_REQUEST => {
                let request_id = match message.fields.get(FIELD_REQUEST_ID) {
                    None | Some(Value::Null) => None,
                    Some(value) => Some(value.as_u64().ok_or(CodecError::InvalidField {
                        command: START_REQUEST,
                        field: FIELD_REQUEST_ID,
                    })?),
                };
                Ok(Self::StartRequest { request_id })
            }
            other => Err(CodecError::UnknownCommand(other.to_string())),
        }
    }

    /// # Errors
    ///
    /// Returns `CodecError::Json` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(&self.to_message())?)
    }

    /// # Errors
    ///
    /// Returns `CodecError` if the payload is not a valid fact.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let message: WireMessage = serde_json::from_slice(payload)?;
        Self::from_message(&message)
    }
}

fn insert_session_id(fields: &mut Map<String, Value>, session_id: Option<Uuid>) {
    if let Some(id) = session_id {
        fields.insert(FIELD_SESSION_ID.to_string(), Value::from(id.to_string()));
    }
}

fn session_id(
    fields: &Map<String, Value>,
    command: &'static str,
) -> Result<Option<Uuid>, CodecError> {
    match fields.get(FIELD_SESSION_ID) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .map(Some)
            .ok_or(CodecError::InvalidField {
                command,
                field: FIELD_SESSION_ID,
            }),
    }
}

fn required_u32(
    fields: &Map<String, Value>,
    command: &'static str,
    field: &'static str,
) -> Result<u32, CodecError> {
    fields
        .get(field)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or(CodecError::InvalidField { command, field })
}
