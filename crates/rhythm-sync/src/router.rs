//! Receiver side: turns inbound facts into display intents and statistics.
//!
//! The receiver never trusts the order or number of deliveries. Every rule
//! below is safe to apply twice, and a local safety timeout leaves the
//! in-progress screen if the wrist device goes quiet.

use chrono::Utc;
use lru::LruCache;
use std::{future::pending, num::NonZeroUsize};
use tokio::{
    sync::mpsc,
    time::{sleep_until, Duration, Instant},
};
use uuid::Uuid;

use crate::channel::Inbound;
use crate::publisher::InboundNormalizer;
use crate::stats::{StatsRecorder, TrainingRecord};
use crate::wire::Fact;


const FINISHED_CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(32) {
    Some(v) => v,
    None => unreachable!(),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    /// A start request was sent; waiting for the session to begin
    AwaitingStart { request_id: u64, since: Instant },
    InProgress {
        session_id: Option<Uuid>,
        since: Instant,
    },
}

impl ReceiverState {
    const fn since(&self) -> Option<Instant> {
        match self {
            Self::Idle => None,
            Self::AwaitingStart { since, .. } | Self::InProgress { since, .. } => Some(*since),
        }
    }
}

/// What the receiver's UI should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterIntent {
    ShowInProgress,
    ShowResults(TrainingRecord),
    SpeakEncouragement,
    /// Safety timeout fired; back to the idle screen
    TimedOut,
}

pub struct SessionEventRouter<R> {
    recorder: R,
    safety_timeout: Duration,
    state: ReceiverState,
    finished: LruCache<Uuid, ()>,
    /// Totals of the last recorded session that carried no id
    last_anonymous_finished: Option<(u32, u32)>,
    last_request_id: u64,
}

impl<R: StatsRecorder> SessionEventRouter<R> {
    #[must_use]
    pub fn new(recorder: R, safety_timeout: Duration) -> Self {
        Self {
            recorder,
            safety_timeout,
            state: ReceiverState::Idle,
            finished: LruCache::new(FINISHED_CACHE_SIZE),
            last_anonymous_finished: None,
            last_request_id: 0,
        }
    }

    #[must_use]
    pub const fn state(&self) -> ReceiverState {
        self.state
    }

    #[must_use]
    pub const fn recorder(&self) -> &R {
        &self.recorder
    }

    pub fn into_recorder(self) -> R {
        self.recorder
    }

    /// When the safety timeout fires for the current state, if it can
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.state.since().map(|since| since + self.safety_timeout)
    }

    /// Apply one fact. Returns the intent to surface, if any.
    pub fn apply(&mut self, fact: Fact, now: Instant) -> Option<RouterIntent> {
        match fact {
            Fact::TrainingStarted { session_id } => self.on_started(session_id, now),
            Fact::TrainingFinished {
                session_id,
                total_reps,
                warnings,
            } => self.on_finished(session_id, total_reps, warnings, now),
            Fact::PlayEncouragement => Some(RouterIntent::SpeakEncouragement),
            Fact::StartRequest { .. } => {
                log::debug!("Ignoring start request addressed to the wrist device");
                None
            }
        }
    }

    /// Enter `AwaitingStart` and build the request to send.
    ///
    /// Request ids increase across calls and across restarts.
    pub fn request_start(&mut self, now: Instant) -> Fact {
        let request_id = fresh_request_id(self.last_request_id);
        self.last_request_id = request_id;

        log::info!("Requesting session start ({request_id})");
        self.state = ReceiverState::AwaitingStart {
            request_id,
            since: now,
        };
        Fact::StartRequest {
            request_id: Some(request_id),
        }
    }

    /// Leave a stuck state once the safety timeout has elapsed.
    pub fn check_timeout(&mut self, now: Instant) -> Option<RouterIntent> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        log::warn!(
            "No session update for {}s, leaving {:?}",
            self.safety_timeout.as_secs(),
            self.state
        );
        self.state = ReceiverState::Idle;
        Some(RouterIntent::TimedOut)
    }

    /// Consume inbound deliveries until the channel closes or `intents` is dropped.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        intents: mpsc::UnboundedSender<RouterIntent>,
    ) -> Self {
        let mut normalizer = InboundNormalizer::new();

        loop {
            let deadline = self.deadline();
            let intent = tokio::select! {
                delivery = inbound.recv() => {
                    let Some(delivery) = delivery else { break };
                    normalizer
                        .accept(&delivery)
                        .and_then(|fact| self.apply(fact, Instant::now()))
                }
                () = wait_until(deadline) => self.check_timeout(Instant::now()),
            };

            if let Some(intent) = intent {
                if intents.send(intent).is_err() {
                    break;
                }
            }
        }
        self
    }

    fn on_started(&mut self, session_id: Option<Uuid>, now: Instant) -> Option<RouterIntent> {
        if let Some(id) = session_id {
            if self.finished.contains(&id) {
                log::debug!("Ignoring late start of completed session {id}");
                return None;
            }
        }

        if let ReceiverState::InProgress {
            session_id: current,
            ..
        } = self.state
        {
            if session_id.is_none() || current == session_id {
                return None;
            }
        }

        match session_id {
            Some(id) => log::info!("Session {id} in progress"),
            None => log::info!("Session in progress"),
        }
        self.state = ReceiverState::InProgress {
            session_id,
            since: now,
        };
        Some(RouterIntent::ShowInProgress)
    }

    fn on_finished(
        &mut self,
        session_id: Option<Uuid>,
        total_reps: u32,
        warnings: u32,
        now: Instant,
    ) -> Option<RouterIntent> {
        let (in_progress, ends_current) = match self.state {
            ReceiverState::InProgress {
                session_id: current,
                since,
            } if current == session_id => (Some(since), true),
            // A late finish of another session must not end the one on screen
            ReceiverState::InProgress {
                session_id: current,
                ..
            } => (None, current.is_none()),
            _ => (None, true),
        };

        match session_id {
            Some(id) => {
                if self.finished.put(id, ()).is_some() {
                    return None;
                }
            }
            None => {
                let totals = (total_reps, warnings);
                if in_progress.is_none() && self.last_anonymous_finished == Some(totals) {
                    return None;
                }
                self.last_anonymous_finished = Some(totals);
            }
        }

        let mut record = TrainingRecord::new(session_id, total_reps, warnings);
        if let Some(since) = in_progress {
            record = record.with_duration(now.saturating_duration_since(since).as_secs());
        }
        self.recorder.record(record.clone());
        if !ends_current {
            log::info!(
                "Recorded finish of an earlier session, still in {:?}",
                self.state
            );
            return None;
        }
        self.state = ReceiverState::Idle;
        Some(RouterIntent::ShowResults(record))
    }
}

/// Accepts each remote start request at most once, in request-id order
#[derive(Debug, Default)]
pub struct StartRequestGate {
    last: Option<u64>,
}

impl StartRequestGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests without an id are always accepted.
    pub fn accept(&mut self, request_id: Option<u64>) -> bool {
        let Some(id) = request_id else {
            return true;
        };
        if self.last.is_some_and(|last| id <= last) {
            log::debug!("Ignoring stale start request {id}");
            return false;
        }
        self.last = Some(id);
        true
    }
}

/// A start request id greater than `after`, based on wall-clock milliseconds
/// so ids keep increasing when the requesting process restarts.
#[must_use]
pub fn fresh_request_id(after: u64) -> u64 {
    let wall_clock = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
    wall_clock.max(after + 1)
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
