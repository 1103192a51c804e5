//! Unix domain socket transport.
//!
//! Every delivery is one connection carrying one bincode frame. The frame
//! records which path (transient or durable) the payload took. Durable
//! values stay in local slots until a delivery succeeds; `spawn_retry`
//! keeps trying in the background.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{interval, timeout, MissedTickBehavior},
};

use crate::channel::{ChannelError, DeliveryPath, DurableSlots, Inbound, SyncChannel};

/// Upper bound on one frame; facts are a few hundred bytes
const MAX_FRAME_BYTES: u64 = 64 * 1024;

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
enum Frame {
    Transient(Vec<u8>),
    Durable { slot: String, payload: Vec<u8> },
}

impl Frame {
    fn into_inbound(self) -> Inbound {
        match self {
            Self::Transient(payload) => Inbound {
                path: DeliveryPath::Transient,
                payload,
            },
            Self::Durable { slot, payload } => {
                log::debug!("Received durable `{slot}`");
                Inbound {
                    path: DeliveryPath::Durable,
                    payload,
                }
            }
        }
    }
}

/// Sending half: delivers to the peer's socket
pub struct SocketChannel {
    peer_path: PathBuf,
    connect_timeout: Duration,
    pending: Mutex<DurableSlots>,
    reachable: AtomicBool,
}

impl SocketChannel {
    #[must_use]
    pub fn new(peer_path: &Path, connect_timeout: Duration) -> Self {
        Self {
            peer_path: peer_path.to_path_buf(),
            connect_timeout,
            pending: Mutex::new(DurableSlots::new()),
            reachable: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn peer_path(&self) -> &Path {
        &self.peer_path
    }

    /// Number of durable values not yet delivered
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Deliver pending durable values in order, stopping at the first failure.
    ///
    /// Returns how many were delivered.
    pub async fn flush_pending(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let mut delivered = 0;

        while let Some((slot, payload)) = pending.front().cloned() {
            let frame = Frame::Durable {
                slot: slot.clone(),
                payload,
            };
            match self.deliver(&frame).await {
                Ok(()) => {
                    pending.pop_front();
                    delivered += 1;
                }
                Err(e) => {
                    log::debug!("Durable `{slot}` still pending: {e}");
                    break;
                }
            }
        }
        delivered
    }

    /// Retry pending durable values every `every` until the task is aborted.
    pub fn spawn_retry(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if channel.pending_len().await == 0 {
                    continue;
                }
                let delivered = channel.flush_pending().await;
                if delivered > 0 {
                    log::info!(
                        "Delivered {delivered} pending value(s) to {}",
                        channel.peer_path.display()
                    );
                }
            }
        })
    }

    async fn deliver(&self, frame: &Frame) -> Result<(), ChannelError> {
        let result = self.try_deliver(frame).await;
        self.reachable.store(result.is_ok(), Ordering::SeqCst);
        result
    }

    async fn try_deliver(&self, frame: &Frame) -> Result<(), ChannelError> {
        let encoded = bincode::serialize(frame)?;

        let mut stream =
            match timeout(self.connect_timeout, UnixStream::connect(&self.peer_path)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    log::debug!("Connect to {} failed: {e}", self.peer_path.display());
                    return Err(ChannelError::Unreachable);
                }
                Err(_) => return Err(ChannelError::Unreachable),
            };

        stream.write_all(&encoded).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl SyncChannel for SocketChannel {
    async fn send_transient(&self, payload: &[u8]) -> Result<(), ChannelError> {
        self.deliver(&Frame::Transient(payload.to_vec())).await
    }

    async fn publish_durable(&self, slot: &str, payload: &[u8]) -> Result<(), ChannelError> {
        self.pending.lock().await.put(slot, payload);
        self.flush_pending().await;
        Ok(())
    }

    fn reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "unix-socket"
    }
}

/// Bind the receiving socket, replacing a stale socket file.
///
/// # Errors
///
/// Returns an error if the stale file cannot be removed or binding fails.
pub fn bind(sock_path: &Path) -> io::Result<UnixListener> {
    if sock_path.exists() {
        fs::remove_file(sock_path)?;
    }
    if let Some(parent) = sock_path.parent() {
        fs::create_dir_all(parent)?;
    }
    UnixListener::bind(sock_path)
}

/// Accept frames and forward them to `inbound` until its receiver is dropped.
pub async fn serve(listener: UnixListener, inbound: mpsc::UnboundedSender<Inbound>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let inbound = inbound.clone();
                    tokio::spawn(async move {
                        if let Some(frame) = read_frame(stream).await {
                            if inbound.send(frame.into_inbound()).is_err() {
                                log::debug!("Inbound receiver gone, dropping frame");
                            }
                        }
                    });
                }
                Err(e) => {
                    log::error!("Socket accept error: {e}");
                }
            },
            () = inbound.closed() => return,
        }
    }
}

/// `bind` then `serve`.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound.
pub async fn listen(sock_path: &Path, inbound: mpsc::UnboundedSender<Inbound>) -> io::Result<()> {
    let listener = bind(sock_path)?;
    log::info!("Listening on {}", sock_path.display());
    serve(listener, inbound).await;
    Ok(())
}

async fn read_frame(stream: UnixStream) -> Option<Frame> {
    let mut buf = Vec::new();
    let mut reader = stream.take(MAX_FRAME_BYTES);
    match reader.read_to_end(&mut buf).await {
        Ok(0) => None,
        Ok(_) => match bincode::deserialize::<Frame>(&buf) {
            Ok(frame) => Some(frame),
            Err(e) => {
                log::warn!("Dropping undecodable frame: {e}");
                None
            }
        },
        Err(e) => {
            log::error!("Socket read error: {e}");
            None
        }
    }
}
