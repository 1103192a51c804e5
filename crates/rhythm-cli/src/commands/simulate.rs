/// In-process simulation: wrist engine, loopback link and companion receiver
use anyhow::Result;
use rhythm_core::{
    LogFeedbackSink, SessionOutcome, SessionSnapshot, SessionState, Settings,
    TrainingSessionEngine,
};
use rhythm_sync::{DualChannelPublisher, LoopbackChannel, MemoryStatsRecorder, SessionEventRouter};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::companion::{print_intents, print_records};
use super::motion_source;

#[derive(Debug, Clone, Copy, Default)]
pub struct SimulateOptions {
    pub offline: bool,
    pub still: bool,
    pub no_sensor: bool,
    pub reps: Option<u32>,
}

pub async fn run(settings: &Settings, options: SimulateOptions) -> Result<()> {
    let mut config = settings.session_config()?;
    if let Some(reps) = options.reps {
        config.total_reps = reps;
        config.validate()?;
    }
    let source = motion_source(options.still, options.no_sensor, config.rep_interval);

    let ((watch_end, _), (phone_end, phone_rx)) = LoopbackChannel::pair();
    if options.offline {
        log::info!("Companion is out of range");
        phone_end.set_listening(false);
    }

    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let publisher = DualChannelPublisher::new(Arc::new(watch_end));
    let forward = tokio::spawn(async move { publisher.forward(outbox_rx).await });

    let (intents_tx, intents_rx) = mpsc::unbounded_channel();
    let router = SessionEventRouter::new(MemoryStatsRecorder::new(), settings.safety_timeout());
    let receiver = tokio::spawn(router.run(phone_rx, intents_tx));
    let printer = tokio::spawn(print_intents(intents_rx));

    let engine = TrainingSessionEngine::new(config, source, Arc::new(LogFeedbackSink))?
        .with_outbox(outbox_tx);
    let mut handle = engine.start();
    let dismiss = handle.take_dismiss_signal();
    let mut snapshots = handle.snapshots();

    tokio::select! {
        () = show_progress(&mut snapshots) => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received Ctrl-C, stopping session...");
            handle.force_stop().await;
        }
    }

    if let Some(dismiss) = dismiss {
        if dismiss.await.is_ok() {
            println!("Session can be dismissed.");
        }
    }
    let outcome = handle.join().await?;
    forward.await?;

    if options.offline {
        log::info!("Companion is back in range");
        phone_end.set_listening(true);
    }
    // Last end of the link; the receiver drains what it was handed and stops
    drop(phone_end);
    let router = receiver.await?;
    printer.await?;

    match outcome {
        SessionOutcome::Completed { .. } => print_records(router.recorder()),
        SessionOutcome::Stopped {
            state,
            reps,
            warnings,
        } => println!(
            "Session stopped during {}: {reps} reps, {warnings} warnings",
            state.description()
        ),
    }
    Ok(())
}

/// Print countdown and rep progress until the session finishes or goes away.
async fn show_progress(snapshots: &mut watch::Receiver<SessionSnapshot>) {
    let mut last_line = String::new();
    loop {
        let snapshot = *snapshots.borrow_and_update();
        let line = progress_line(&snapshot);
        if line != last_line {
            println!("{line}");
            last_line = line;
        }
        if snapshot.state == SessionState::Finished || snapshots.changed().await.is_err() {
            return;
        }
    }
}

fn progress_line(snapshot: &SessionSnapshot) -> String {
    match snapshot.state {
        SessionState::Preparing => format!("Get ready... {}", snapshot.countdown),
        SessionState::Training | SessionState::Finished => {
            let mut line = format!("Rep {}/{}", snapshot.count, snapshot.total_reps);
            if snapshot.warning_count > 0 {
                line.push_str(&format!(" ({} warnings)", snapshot.warning_count));
            }
            if !snapshot.sensor_available {
                line.push_str(" [no sensor]");
            }
            line
        }
        SessionState::Idle => SessionState::Idle.description().to_string(),
    }
}
