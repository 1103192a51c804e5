/// Wrist-side agent: runs sessions and reports them to the companion
use anyhow::{Context, Result};
use rhythm_core::{LogFeedbackSink, SessionConfig, SessionHandle, Settings, TrainingSessionEngine};
use rhythm_sync::{
    socket, DualChannelPublisher, Fact, InboundNormalizer, SocketChannel, StartRequestGate,
};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};

use super::motion_source;

struct ActiveSession {
    handle: SessionHandle,
    forward: JoinHandle<()>,
}

impl ActiveSession {
    fn start(
        config: &SessionConfig,
        still: bool,
        publisher: &Arc<DualChannelPublisher>,
    ) -> Result<Self> {
        let source = motion_source(still, false, config.rep_interval);
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let engine = TrainingSessionEngine::new(config.clone(), source, Arc::new(LogFeedbackSink))?
            .with_outbox(outbox_tx);

        let publisher = Arc::clone(publisher);
        let forward = tokio::spawn(async move { publisher.forward(outbox_rx).await });
        let handle = engine.start();
        log::info!("Session {} started", handle.session_id());
        Ok(Self { handle, forward })
    }

    async fn stop(self) {
        self.handle.force_stop().await;
        if let Err(e) = self.forward.await {
            log::error!("Publisher task failed: {e}");
        }
    }
}

pub async fn run(settings: &Settings, start_now: bool, still: bool) -> Result<()> {
    let config = settings.session_config()?;
    let watch_sock = settings.transport.watch_socket_path()?;
    let companion_sock = settings.transport.companion_socket_path()?;

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let listener = socket::bind(&watch_sock)
        .with_context(|| format!("Failed to bind {}", watch_sock.display()))?;
    log::info!("Wrist agent listening on {}", watch_sock.display());
    let server = tokio::spawn(socket::serve(listener, inbound_tx));

    let channel = Arc::new(SocketChannel::new(
        &companion_sock,
        settings.transport.connect_timeout(),
    ));
    let retry = channel.spawn_retry(settings.transport.retry_interval());
    let publisher = Arc::new(DualChannelPublisher::new(channel));

    let mut normalizer = InboundNormalizer::new();
    let mut gate = StartRequestGate::new();
    let mut active = if start_now {
        Some(ActiveSession::start(&config, still, &publisher)?)
    } else {
        None
    };

    loop {
        tokio::select! {
            delivery = inbound_rx.recv() => {
                let Some(delivery) = delivery else { break };
                let Some(fact) = normalizer.accept(&delivery) else { continue };

                let Fact::StartRequest { request_id } = fact else {
                    log::debug!("Ignoring `{}` on the wrist side", fact.kind().command());
                    continue;
                };
                if !gate.accept(request_id) {
                    continue;
                }
                if active.as_ref().is_some_and(|s| !s.handle.is_finished()) {
                    log::info!("Session already running, ignoring start request");
                    continue;
                }
                active = Some(ActiveSession::start(&config, still, &publisher)?);
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received Ctrl-C, shutting down...");
                break;
            }
        }
    }

    if let Some(session) = active.take() {
        session.stop().await;
    }
    retry.abort();
    server.abort();
    Ok(())
}
