//! Outbound command relay to the game server.
//!
//! A background task keeps one WebSocket connection open to the enforcement
//! target, reconnecting after a fixed delay forever. Sending never blocks and
//! never fails: while disconnected a command is logged and dropped.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::models::ModAction;

pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Command sent to the enforcement target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayCommand {
    pub action: ModAction,
    pub player_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Seconds, the unit the game server expects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
}

impl RelayCommand {
    pub fn new(action: ModAction, player_name: &str) -> Self {
        Self {
            action,
            player_name: player_name.to_string(),
            reason: None,
            duration: None,
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    /// Converts milliseconds to whole seconds, rounding up.
    pub fn with_duration_ms(mut self, duration_ms: Option<i64>) -> Self {
        self.duration = duration_ms.map(|ms| ms / 1000 + i64::from(ms % 1000 != 0));
        self
    }
}

/// Fire-and-forget sink for moderation commands.
pub trait CommandRelay: Send + Sync {
    fn send(&self, command: RelayCommand);

    fn state(&self) -> RelayState;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct RelayClient {
    url: String,
    retry_delay: Duration,
    state: watch::Sender<RelayState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    notifications: broadcast::Sender<serde_json::Value>,
}

/// Owns the relay's background task; dropping it leaves the task running.
pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Stop the connection loop, including any pending reconnect timer.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!("Relay task ended abnormally: {e}");
        }
    }
}

impl RelayClient {
    pub fn new(url: impl Into<String>, retry_delay: Duration) -> Arc<Self> {
        let (state, _) = watch::channel(RelayState::Disconnected);
        let (notifications, _) = broadcast::channel(64);
        Arc::new(Self {
            url: url.into(),
            retry_delay,
            state,
            outbound: Mutex::new(None),
            notifications,
        })
    }

    /// Inbound JSON messages from the game server. Informational only.
    pub fn subscribe(&self) -> broadcast::Receiver<serde_json::Value> {
        self.notifications.subscribe()
    }

    pub fn spawn(self: &Arc<Self>) -> RelayHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let client = Arc::clone(self);
        let task = tokio::spawn(client.run(shutdown_rx));
        RelayHandle { shutdown, task }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.state.send_replace(RelayState::Connecting);
            tracing::info!("Connecting to game server relay at {}", self.url);

            tokio::select! {
                _ = shutdown.changed() => {
                    self.disconnect();
                    break;
                }
                result = self.connect_once() => match result {
                    Ok(()) => tracing::info!("Game server relay closed the connection"),
                    Err(e) => tracing::warn!("Game server relay connection failed: {e}"),
                },
            }

            self.disconnect();

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
        tracing::info!("Relay stopped");
    }

    fn disconnect(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.state.send_replace(RelayState::Disconnected);
    }

    /// Drive one connection until it closes or errors.
    async fn connect_once(&self) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let (socket, _) = connect_async(self.url.as_str()).await?;
        let (mut sink, mut stream) = socket.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        self.state.send_replace(RelayState::Connected);
        tracing::info!("Connected to game server relay");

        loop {
            tokio::select! {
                Some(payload) = rx.recv() => {
                    sink.send(Message::Text(payload.into())).await?;
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e),
                },
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => {
                // No subscribers is fine
                let _ = self.notifications.send(value);
            }
            Err(e) => tracing::warn!("Discarding non-JSON relay message: {e}"),
        }
    }
}

impl CommandRelay for RelayClient {
    fn send(&self, command: RelayCommand) {
        let payload = match serde_json::to_string(&command) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("Failed to serialize relay command: {e}");
                return;
            }
        };

        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(tx) if tx.send(payload).is_ok() => {
                tracing::info!("Relayed {} for {}", command.action, command.player_name);
            }
            _ => tracing::warn!(
                "Relay not connected, dropping {} for {}",
                command.action,
                command.player_name
            ),
        }
    }

    fn state(&self) -> RelayState {
        *self.state.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn wait_for(client: &RelayClient, wanted: RelayState) {
        let mut rx = client.state.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == wanted))
            .await
            .expect("relay state timeout")
            .unwrap();
    }

    #[test]
    fn wire_format_omits_absent_fields() {
        let cmd = RelayCommand::new(ModAction::Unban, "Steve");
        assert_eq!(
            serde_json::to_string(&cmd).unwrap(),
            r#"{"action":"unban","playerName":"Steve"}"#
        );

        let cmd = RelayCommand::new(ModAction::TempBan, "Steve")
            .with_reason("grief")
            .with_duration_ms(Some(90_500));
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            serde_json::json!({"action":"tempban","playerName":"Steve","reason":"grief","duration":91})
        );
    }

    #[test]
    fn duration_rounds_up_to_whole_seconds() {
        let secs = |ms| {
            RelayCommand::new(ModAction::Mute, "Steve")
                .with_duration_ms(Some(ms))
                .duration
        };
        assert_eq!(secs(1), Some(1));
        assert_eq!(secs(1_000), Some(1));
        assert_eq!(secs(1_001), Some(2));
        assert_eq!(secs(i64::MAX), Some(i64::MAX / 1000 + 1));
    }

    #[tokio::test]
    async fn send_while_disconnected_is_dropped() {
        let client = RelayClient::new("ws://127.0.0.1:1", RECONNECT_DELAY);
        assert_eq!(client.state(), RelayState::Disconnected);
        client.send(RelayCommand::new(ModAction::Kick, "Steve"));
        assert_eq!(client.state(), RelayState::Disconnected);
    }

    #[tokio::test]
    async fn relays_commands_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, mut received_rx) = mpsc::unbounded_channel::<String>();
        let (reconnected_tx, mut reconnected_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            // First connection: read one command then hang up
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"{"type":"connected"}"#.into()))
                .await
                .unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                received_tx.send(text.to_string()).unwrap();
            }
            drop(ws);

            // Second connection after the retry delay
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            reconnected_tx.send(()).unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                received_tx.send(text.to_string()).unwrap();
            }
        });

        let client = RelayClient::new(format!("ws://{addr}"), Duration::from_millis(50));
        let mut notifications = client.subscribe();
        let handle = client.spawn();

        wait_for(&client, RelayState::Connected).await;
        let greeting = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(greeting["type"], "connected");

        client.send(RelayCommand::new(ModAction::Ban, "Steve").with_reason("x"));
        let first = received_rx.recv().await.unwrap();
        assert_eq!(first, r#"{"action":"ban","playerName":"Steve","reason":"x"}"#);

        // The hang-up is only visible once the server sees the next handshake
        reconnected_rx.recv().await.unwrap();
        wait_for(&client, RelayState::Connected).await;
        client.send(RelayCommand::new(ModAction::Unmute, "Alex"));
        let second = received_rx.recv().await.unwrap();
        assert_eq!(second, r#"{"action":"unmute","playerName":"Alex"}"#);

        handle.shutdown().await;
        assert_eq!(client.state(), RelayState::Disconnected);
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_retry() {
        // Nothing listens here, so the client sits in its retry timer
        let client = RelayClient::new("ws://127.0.0.1:1", Duration::from_secs(3600));
        let handle = client.spawn();
        wait_for(&client, RelayState::Disconnected).await;

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("shutdown should not wait for the retry timer");
    }
}
