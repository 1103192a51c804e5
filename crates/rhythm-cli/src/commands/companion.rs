/// Companion receiver and remote start command handlers
use anyhow::{Context, Result};
use chrono::Local;
use rhythm_core::Settings;
use rhythm_sync::{
    fresh_request_id, socket, Fact, MemoryStatsRecorder, RouterIntent, SessionEventRouter,
    SocketChannel, SyncChannel, TrainingRecord,
};
use tabled::{Table, Tabled};
use tokio::{sync::mpsc, time::Instant};

#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Finished at")]
    finished_at: String,
    #[tabled(rename = "Activity")]
    activity: String,
    #[tabled(rename = "Reps")]
    reps: u32,
    #[tabled(rename = "Warnings")]
    warnings: u32,
    #[tabled(rename = "Duration")]
    duration: String,
}

impl From<&TrainingRecord> for RecordRow {
    fn from(record: &TrainingRecord) -> Self {
        Self {
            finished_at: record
                .recorded_at
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            activity: record.activity.clone(),
            reps: record.total_reps,
            warnings: record.warnings,
            duration: record
                .duration_secs
                .map_or_else(|| "-".to_string(), format_duration),
        }
    }
}

/// Listen for facts from the wrist agent until Ctrl-C, then print statistics.
pub async fn run(settings: &Settings, request_start: bool) -> Result<()> {
    let companion_sock = settings.transport.companion_socket_path()?;
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let listener = socket::bind(&companion_sock)
        .with_context(|| format!("Failed to bind {}", companion_sock.display()))?;
    log::info!("Companion listening on {}", companion_sock.display());
    let server = tokio::spawn(socket::serve(listener, inbound_tx));

    let mut router = SessionEventRouter::new(MemoryStatsRecorder::new(), settings.safety_timeout());
    if request_start {
        let fact = router.request_start(Instant::now());
        if let Err(e) = send_to_watch(settings, &fact).await {
            log::warn!("{e:#}");
        }
    }

    let (intents_tx, intents_rx) = mpsc::unbounded_channel();
    let receiver = tokio::spawn(router.run(inbound_rx, intents_tx));
    let printer = tokio::spawn(print_intents(intents_rx));

    tokio::signal::ctrl_c().await?;
    log::info!("Received Ctrl-C, shutting down...");

    server.abort();
    // Cancelled is the expected outcome; what matters is that the sender is gone
    let _ = server.await;
    let router = receiver.await?;
    printer.await?;

    print_records(router.recorder());
    Ok(())
}

/// Send a single start request and exit.
pub async fn send_start_request(settings: &Settings) -> Result<()> {
    let fact = Fact::StartRequest {
        request_id: Some(fresh_request_id(0)),
    };
    send_to_watch(settings, &fact).await?;
    println!("Start request sent.");
    Ok(())
}

async fn send_to_watch(settings: &Settings, fact: &Fact) -> Result<()> {
    let watch_sock = settings.transport.watch_socket_path()?;
    let channel = SocketChannel::new(&watch_sock, settings.transport.connect_timeout());
    channel
        .send_transient(&fact.encode()?)
        .await
        .with_context(|| format!("Wrist agent not reachable at {}", watch_sock.display()))
}

/// Print intents as the companion UI would show them, until the router stops.
pub async fn print_intents(mut intents: mpsc::UnboundedReceiver<RouterIntent>) {
    while let Some(intent) = intents.recv().await {
        match intent {
            RouterIntent::ShowInProgress => println!("Training in progress..."),
            RouterIntent::SpeakEncouragement => println!("Keep going!"),
            RouterIntent::ShowResults(record) => println!(
                "Training complete: {} reps, {} warnings",
                record.total_reps, record.warnings
            ),
            RouterIntent::TimedOut => println!("Lost track of the session, back to idle."),
        }
    }
}

pub fn print_records(recorder: &MemoryStatsRecorder) {
    let records = recorder.records();
    if records.is_empty() {
        println!("No sessions recorded.");
        return;
    }

    let rows: Vec<RecordRow> = records.iter().map(RecordRow::from).collect();
    println!("\n{}", Table::new(rows));

    let summary = recorder.summary();
    println!(
        "{} session(s), {} reps, {} warnings",
        summary.sessions, summary.total_reps, summary.total_warnings
    );
}

fn format_duration(secs: u64) -> String {
    if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(60), "1m 00s");
        assert_eq!(format_duration(127), "2m 07s");
    }

    #[test]
    fn test_record_row() {
        let row = RecordRow::from(&TrainingRecord::new(None, 20, 3));
        assert_eq!(row.reps, 20);
        assert_eq!(row.warnings, 3);
        assert_eq!(row.duration, "-");
        assert_eq!(row.activity, "grip");

        let row = RecordRow::from(&TrainingRecord::new(None, 20, 3).with_duration(75));
        assert_eq!(row.duration, "1m 15s");
    }
}
