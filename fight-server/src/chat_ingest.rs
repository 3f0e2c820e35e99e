//! Owns the single upstream chat connection and turns it into a stream of
//! normalized [`ChatEvent`]s plus a connectivity signal.
//!
//! The lifecycle is an explicit state machine: the ingestor holds an
//! [`IngestState`] and every move goes through one `transition` point,
//! Disconnected -> Connecting -> Connected, falling back through Backoff on
//! any transport error and into Terminal once the reconnect budget is
//! spent. One task drives the whole thing, so there is never more than one
//! live connection or pending reconnect, no matter how often `start` is
//! called.

use futures_util::{SinkExt, StreamExt};
use protocol::ChatEvent;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Reconnects before the ingestor gives up for good.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Fixed pause between reconnect attempts.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Connection lifecycle of the ingestor. Terminal is absorbing; everything
/// else cycles while the connection comes and goes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IngestState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
    Terminal,
}

/// What the ingestor emits. Transport errors never leave this module, they
/// only show up as status changes.
#[derive(Debug)]
pub enum IngestEvent {
    Chat(ChatEvent),
    Status { connected: bool },
    /// The reconnect budget is exhausted, the ingestor has stopped.
    MaxReconnectAttemptsReached,
}

/// How one connection attempt ended.
enum SessionEnd {
    /// Transport closed or errored; the state machine decides about a retry.
    Closed,
    /// The orchestrator dropped its receiver, nothing left to do.
    ReceiverGone,
}

pub struct ChatIngestor {
    url: String,
    room: String,
    started: AtomicBool,
    state: Mutex<IngestState>,
    events: mpsc::Sender<IngestEvent>,
}

impl ChatIngestor {
    pub fn new(url: String, room: String, events: mpsc::Sender<IngestEvent>) -> Arc<Self> {
        Arc::new(ChatIngestor {
            url,
            room,
            started: AtomicBool::new(false),
            state: Mutex::new(IngestState::Disconnected),
            events,
        })
    }

    /// The current lifecycle state.
    pub fn state(&self) -> IngestState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every state change goes through here so the lifecycle is traceable
    /// in one place.
    fn transition(&self, to: IngestState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != to {
            tracing::debug!(from = ?*state, to = ?to, "chat ingest state change");
            *state = to;
        }
    }

    /// Spawns the connection task. Idempotent: later calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::debug!("chat ingestor already running");
            return;
        }
        let ingestor = self.clone();
        tokio::spawn(async move { ingestor.run_loop().await });
    }

    async fn run_loop(self: Arc<Self>) {
        let mut reconnect_attempts = 0u32;
        loop {
            self.transition(IngestState::Connecting);
            let end = self.run_connection(&mut reconnect_attempts).await;
            self.transition(IngestState::Disconnected);
            match end {
                SessionEnd::ReceiverGone => return,
                SessionEnd::Closed => {
                    if self
                        .events
                        .send(IngestEvent::Status { connected: false })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            if reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
                self.transition(IngestState::Terminal);
                tracing::error!(
                    attempts = reconnect_attempts,
                    "giving up on upstream chat, reconnect budget spent"
                );
                let _ = self.events.send(IngestEvent::MaxReconnectAttemptsReached).await;
                return;
            }
            reconnect_attempts += 1;
            self.transition(IngestState::Backoff);
            tracing::info!(
                attempt = reconnect_attempts,
                backoff_s = RECONNECT_BACKOFF.as_secs(),
                "chat reconnect scheduled"
            );
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    /// One full connection lifecycle: connect, join the room, pump messages
    /// until the transport dies. A successful join resets the reconnect
    /// counter.
    async fn run_connection(&self, reconnect_attempts: &mut u32) -> SessionEnd {
        tracing::debug!(url = %self.url, "connecting to upstream chat");
        let (stream, _response) = match connect_async(self.url.as_str()).await {
            Ok(ok) => ok,
            Err(err) => {
                tracing::warn!(%err, "chat connect failed");
                return SessionEnd::Closed;
            }
        };
        let (mut write, mut read) = stream.split();

        let join = serde_json::json!({ "type": "join", "room": self.room }).to_string();
        if let Err(err) = write.send(Message::text(join)).await {
            tracing::warn!(%err, "chat join failed");
            return SessionEnd::Closed;
        }

        self.transition(IngestState::Connected);
        *reconnect_attempts = 0;
        if self
            .events
            .send(IngestEvent::Status { connected: true })
            .await
            .is_err()
        {
            return SessionEnd::ReceiverGone;
        }
        tracing::info!(room = %self.room, "upstream chat connected");

        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    // No filtering, no dedup, no reordering; source
                    // timestamps pass through untouched.
                    let Some(event) = parse_chat_frame(text.as_str()) else {
                        tracing::trace!("skipping unparseable chat frame");
                        continue;
                    };
                    if self.events.send(IngestEvent::Chat(event)).await.is_err() {
                        return SessionEnd::ReceiverGone;
                    }
                }
                Ok(Message::Ping(payload)) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Ok(Message::Close(frame)) => {
                    tracing::info!(?frame, "chat server closed the connection");
                    return SessionEnd::Closed;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(%err, "chat transport error");
                    return SessionEnd::Closed;
                }
            }
        }
        tracing::info!("chat stream ended");
        SessionEnd::Closed
    }
}

/// Lenient view of an incoming room frame. The provider mixes message
/// frames with presence and housekeeping frames, only the former carry a
/// username and a message body.
#[derive(Deserialize)]
struct WireFrame {
    username: Option<String>,
    message: Option<String>,
    timestamp: Option<i64>,
}

fn parse_chat_frame(raw: &str) -> Option<ChatEvent> {
    let frame: WireFrame = serde_json::from_str(raw).ok()?;
    let username = frame.username?;
    let message = frame.message?;
    let ts_ms = frame
        .timestamp
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
    Some(ChatEvent { username, message, ts_ms })
}
