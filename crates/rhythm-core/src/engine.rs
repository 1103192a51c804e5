//! Training session engine.
//!
//! One tokio task per session owns every piece of mutable state. Timers,
//! motion samples and control commands are multiplexed onto that task with
//! `tokio::select!`, so the rep timer and the sensor never race.

use anyhow::Result;
use std::{future::pending, pin::Pin, sync::Arc};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{interval_at, sleep, Duration, Instant, Interval, MissedTickBehavior, Sleep},
};
use uuid::Uuid;

use crate::{
    config::SessionConfig,
    error::SessionError,
    events::{SessionEvent, SessionFact, SessionOutcome, SessionSnapshot, SessionState},
    feedback::{CueKind, FeedbackSink},
    motion::{MotionComplianceMonitor, MotionSample, MotionSource},
};


/// Control messages from a `SessionHandle` to its session task
enum EngineCommand {
    Stop(oneshot::Sender<()>),
}

/// Result of feeding one timer tick to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    BeginTraining,
    Finished,
    /// Tick arrived in a state that does not own that timer
    Ignored,
}

/// Builds and launches one training session.
pub struct TrainingSessionEngine {
    config: SessionConfig,
    source: Box<dyn MotionSource>,
    feedback: Arc<dyn FeedbackSink>,
    outbox: Option<mpsc::UnboundedSender<SessionFact>>,
}

impl TrainingSessionEngine {
    /// # Errors
    ///
    /// Returns `SessionError::InvalidConfig` if the config does not validate.
    pub fn new(
        config: SessionConfig,
        source: Box<dyn MotionSource>,
        feedback: Arc<dyn FeedbackSink>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            config,
            source,
            feedback,
            outbox: None,
        })
    }

    /// Route remote-bound facts (`Started`, warnings, `Finished`) to `outbox`.
    #[must_use]
    pub fn with_outbox(mut self, outbox: mpsc::UnboundedSender<SessionFact>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// `Idle -> Preparing`, then hand the session to its own task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(self) -> SessionHandle {
        let session_id = Uuid::new_v4();
        let now = Instant::now();
        let config = self.config;

        let (events_tx, events_rx) = broadcast::channel(event_capacity(config.total_reps));
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::idle(
            config.total_reps,
            config.countdown_from,
        ));
        let (dismiss_tx, dismiss_rx) = oneshot::channel();
        let (command_tx, command_rx) = mpsc::channel(4);

        let monitor = MotionComplianceMonitor::new(self.source, config.sampling, now);
        let mut run = SessionRun::new(
            session_id,
            config,
            monitor,
            self.feedback,
            events_tx,
            snapshot_tx,
            self.outbox,
        );
        run.begin_preparing(now);

        let task = tokio::spawn(run.run(command_rx, dismiss_tx));

        SessionHandle {
            session_id,
            events: events_rx,
            snapshots: snapshot_rx,
            dismiss: Some(dismiss_rx),
            commands: command_tx,
            task,
        }
    }
}

/// Caller-side view of a running session.
///
/// Dropping the handle cancels the session.
pub struct SessionHandle {
    session_id: Uuid,
    events: broadcast::Receiver<SessionEvent>,
    snapshots: watch::Receiver<SessionSnapshot>,
    dismiss: Option<oneshot::Receiver<()>>,
    commands: mpsc::Sender<EngineCommand>,
    task: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Event stream starting at `start()`.
    ///
    /// Buffers up to `2 * total_reps + 2` events, capped at 4096. A receiver that
    /// falls further behind gets `RecvError::Lagged` and resumes at the oldest kept event.
    pub fn events(&mut self) -> &mut broadcast::Receiver<SessionEvent> {
        &mut self.events
    }

    /// Additional event stream, starting at the next event
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.resubscribe()
    }

    #[must_use]
    pub fn snapshots(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        *self.snapshots.borrow()
    }

    /// One-shot signal sent once the post-`Finished` grace delay has passed.
    ///
    /// Returns `None` after the first call.
    pub fn take_dismiss_signal(&mut self) -> Option<oneshot::Receiver<()>> {
        self.dismiss.take()
    }

    /// Cancel the session and wait until its task has released timers and sensor.
    ///
    /// Calling this on a session that already ended is a no-op.
    pub async fn force_stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(EngineCommand::Stop(ack_tx)).await.is_err() {
            return;
        }
        // The task drops the ack only if it ended on its own in the meantime
        let _ = ack_rx.await;
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session task to end.
    ///
    /// # Errors
    ///
    /// Returns an error if the session task panicked.
    pub async fn join(self) -> Result<SessionOutcome> {
        Ok(self.task.await?)
    }
}

/// State owned by the session task
struct SessionRun {
    session_id: Uuid,
    config: SessionConfig,
    state: SessionState,
    countdown: u32,
    count: u32,
    warnings: u32,
    monitor: MotionComplianceMonitor,
    feedback: Arc<dyn FeedbackSink>,
    events: broadcast::Sender<SessionEvent>,
    snapshots: watch::Sender<SessionSnapshot>,
    outbox: Option<mpsc::UnboundedSender<SessionFact>>,
}

impl SessionRun {
    fn new(
        session_id: Uuid,
        config: SessionConfig,
        monitor: MotionComplianceMonitor,
        feedback: Arc<dyn FeedbackSink>,
        events: broadcast::Sender<SessionEvent>,
        snapshots: watch::Sender<SessionSnapshot>,
        outbox: Option<mpsc::UnboundedSender<SessionFact>>,
    ) -> Self {
        Self {
            session_id,
            countdown: config.countdown_from,
            config,
            state: SessionState::Idle,
            count: 0,
            warnings: 0,
            monitor,
            feedback,
            events,
            snapshots,
            outbox,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        dismiss: oneshot::Sender<()>,
    ) -> SessionOutcome {
        let mut dismiss = Some(dismiss);
        let mut countdown_timer = Some(periodic(self.config.countdown_tick));
        let mut rep_timer: Option<Interval> = None;
        let mut samples: Option<mpsc::Receiver<MotionSample>> = None;
        let mut dismiss_timer: Option<Pin<Box<Sleep>>> = None;

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => {
                    let outcome = self.cancel();
                    match command {
                        Some(EngineCommand::Stop(ack)) => {
                            let _ = ack.send(());
                        }
                        None => log::debug!("Session {} handle dropped", self.session_id),
                    }
                    return outcome;
                }
                sample = next_sample(&mut samples) => match sample {
                    Some(sample) => {
                        if self.monitor.observe(sample) {
                            log::trace!("activity at rep {}", self.count);
                        }
                    }
                    None => {
                        log::warn!("Motion source closed its sample stream");
                        samples = None;
                    }
                },
                () = next_tick(&mut countdown_timer) => {
                    if self.on_countdown_tick() == Step::BeginTraining {
                        countdown_timer = None;
                        samples = self.begin_training();
                        rep_timer = Some(periodic(self.config.rep_interval));
                    }
                }
                () = next_tick(&mut rep_timer) => {
                    if self.on_rep_tick(Instant::now()) == Step::Finished {
                        rep_timer = None;
                        samples = None;
                        dismiss_timer = Some(Box::pin(sleep(self.config.dismiss_delay)));
                    }
                }
                () = elapsed(&mut dismiss_timer) => {
                    if let Some(signal) = dismiss.take() {
                        if signal.send(()).is_err() {
                            log::debug!("Dismiss signal had no listener");
                        }
                    }
                    log::info!("Session {} may be dismissed", self.session_id);
                    return self.outcome();
                }
            }
        }
    }

    /// `Idle -> Preparing`
    fn begin_preparing(&mut self, now: Instant) {
        if self.state != SessionState::Idle {
            return;
        }
        self.count = 0;
        self.warnings = 0;
        self.countdown = self.config.countdown_from;
        self.monitor.reset(now);
        self.state = SessionState::Preparing;
        log::info!(
            "Session {} preparing: {} reps every {:?}",
            self.session_id,
            self.config.total_reps,
            self.config.rep_interval
        );
        self.publish_snapshot();
    }

    fn on_countdown_tick(&mut self) -> Step {
        if self.state != SessionState::Preparing {
            return Step::Ignored;
        }
        if self.countdown > 1 {
            self.countdown -= 1;
            self.feedback.play_cue(CueKind::Click);
            self.publish_snapshot();
            Step::Continue
        } else {
            self.countdown = 0;
            Step::BeginTraining
        }
    }

    /// `Preparing -> Training`. Returns the sample funnel if the sensor started.
    fn begin_training(&mut self) -> Option<mpsc::Receiver<MotionSample>> {
        self.state = SessionState::Training;
        self.count = 0;
        log::info!("Session {} training started", self.session_id);
        self.emit(SessionEvent::Started);

        let samples = self.monitor.start();
        self.publish_snapshot();
        self.feedback.play_cue(CueKind::RhythmTick);
        samples
    }

    fn on_rep_tick(&mut self, now: Instant) -> Step {
        if self.state != SessionState::Training {
            return Step::Ignored;
        }

        self.count += 1;
        self.emit(SessionEvent::RepCompleted { index: self.count });
        self.check_compliance(now);

        if self.count >= self.config.total_reps {
            self.finish();
            return Step::Finished;
        }

        self.feedback.play_cue(CueKind::RhythmTick);
        self.publish_snapshot();
        Step::Continue
    }

    fn check_compliance(&mut self, now: Instant) {
        let idle = self.monitor.idle_for(now);
        if idle <= self.config.compliance_window() {
            return;
        }

        self.warnings += 1;
        self.monitor.restart_window(now);
        log::info!(
            "No activity for {idle:?} at rep {}/{} (warning {})",
            self.count,
            self.config.total_reps,
            self.warnings
        );
        self.feedback.play_cue(CueKind::Warning);
        self.emit(SessionEvent::ComplianceWarning {
            cumulative_warnings: self.warnings,
        });
    }

    /// `Training -> Finished`
    fn finish(&mut self) {
        self.monitor.stop();
        self.state = SessionState::Finished;
        log::info!(
            "Session {} finished: {} reps, {} warnings",
            self.session_id,
            self.count,
            self.warnings
        );
        self.emit(SessionEvent::Finished {
            total_reps: self.count,
            total_warnings: self.warnings,
        });
        self.feedback.play_cue(CueKind::Success);
        self.publish_snapshot();
    }

    /// Release the sensor. Never emits `Finished`.
    fn cancel(&mut self) -> SessionOutcome {
        self.monitor.stop();
        if self.state.is_active() {
            log::info!(
                "Session {} stopped while {:?} at rep {}/{}",
                self.session_id,
                self.state,
                self.count,
                self.config.total_reps
            );
        }
        self.outcome()
    }

    fn outcome(&self) -> SessionOutcome {
        match self.state {
            SessionState::Finished => SessionOutcome::Completed {
                total_reps: self.count,
                total_warnings: self.warnings,
            },
            state => SessionOutcome::Stopped {
                state,
                reps: self.count,
                warnings: self.warnings,
            },
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);

        if !event.is_remote() {
            return;
        }
        if let Some(outbox) = &self.outbox {
            let fact = SessionFact {
                session_id: self.session_id,
                event,
            };
            if outbox.send(fact).is_err() {
                log::debug!("Fact outbox closed, {event:?} stays local");
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            count: self.count,
            total_reps: self.config.total_reps,
            countdown: self.countdown,
            warning_count: self.warnings,
            sensor_available: self.monitor.sensor_available(),
        }
    }

    fn publish_snapshot(&self) {
        self.snapshots.send_replace(self.snapshot());
    }
}

/// Repeating timer whose first tick is one `period` from now
/// Two events per rep plus start and finish, within bounds
fn event_capacity(total_reps: u32) -> usize {
    usize::try_from(total_reps)
        .unwrap_or(usize::MAX)
        .saturating_mul(2)
        .saturating_add(2)
        .clamp(16, 4096)
}

fn periodic(period: Duration) -> Interval {
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => pending().await,
    }
}

async fn next_sample(samples: &mut Option<mpsc::Receiver<MotionSample>>) -> Option<MotionSample> {
    match samples {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}
