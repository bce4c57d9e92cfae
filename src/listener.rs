//! Change capture: Postgres `LISTEN/NOTIFY` to typed change events.
//!
//! A trigger on each watched table publishes a JSON payload on the
//! configured channel (see [`crate::provision`]). The listener turns those
//! payloads into [`ChangeEvent`]s and hands them, one at a time and in
//! arrival order, to a [`ChangeHandler`].

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::postgres::PgListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::envelope::Operation;
use crate::error::{ReplicatorError, Result};
use crate::shutdown::ShutdownToken;

/// One captured row mutation
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub operation: Operation,
    /// Row after the change; for DELETE the trigger sends the deleted row here
    pub data: Value,
    pub old_data: Option<Value>,
}

#[derive(Deserialize)]
struct RawNotification {
    table: String,
    operation: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    old_data: Value,
}

/// Parse a notification payload.
pub fn parse_notification(payload: &str) -> Result<ChangeEvent> {
    let raw: RawNotification = serde_json::from_str(payload)
        .map_err(|e| ReplicatorError::MalformedNotification(e.to_string()))?;

    if raw.table.is_empty() {
        return Err(ReplicatorError::MalformedNotification("empty table name".into()));
    }
    let operation: Operation = raw.operation.parse()?;

    let data = match raw.data {
        Value::Null => Value::Object(Map::new()),
        data @ Value::Object(_) => data,
        other => {
            return Err(ReplicatorError::MalformedNotification(format!(
                "data must be an object, got {}",
                json_type(&other)
            )))
        }
    };
    let old_data = match raw.old_data {
        Value::Null => None,
        old @ Value::Object(_) => Some(old),
        other => {
            return Err(ReplicatorError::MalformedNotification(format!(
                "old_data must be an object, got {}",
                json_type(&other)
            )))
        }
    };

    Ok(ChangeEvent {
        table: raw.table,
        operation,
        data,
        old_data,
    })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Where raw notification payloads come from.
#[async_trait]
pub trait NotificationSource: Send {
    async fn connect(&mut self) -> Result<()>;

    /// Next payload. `Ok(None)` means the source is closed for good.
    async fn recv(&mut self) -> Result<Option<String>>;

    async fn disconnect(&mut self) -> Result<()>;
}

/// Postgres `LISTEN` on one channel
pub struct PgNotificationSource {
    database_url: String,
    channel: String,
    listener: Option<PgListener>,
}

impl PgNotificationSource {
    pub fn new(database_url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            channel: channel.into(),
            listener: None,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn connect(&mut self) -> Result<()> {
        let mut listener = PgListener::connect(&self.database_url).await?;
        listener.listen(&self.channel).await?;
        info!(channel = %self.channel, "Listening for notifications");
        self.listener = Some(listener);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        let listener = self
            .listener
            .as_mut()
            .ok_or(ReplicatorError::NotConnected("notification source"))?;

        loop {
            match listener.try_recv().await? {
                Some(notification) => return Ok(Some(notification.payload().to_string())),
                // the next try_recv reconnects and re-issues LISTEN
                None => warn!(channel = %self.channel, "Database connection lost, reconnecting"),
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut listener) = self.listener.take() {
            listener.unlisten_all().await?;
            info!(channel = %self.channel, "Stopped listening");
        }
        Ok(())
    }
}

/// In-process source fed through a tokio channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<String>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }

    /// Source plus the sender that feeds it.
    pub fn channel(buffer: usize) -> (mpsc::Sender<String>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl NotificationSource for ChannelSource {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        Ok(self.rx.recv().await)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.rx.close();
        Ok(())
    }
}

/// Receives parsed change events.
#[async_trait]
pub trait ChangeHandler: Send {
    async fn on_change(&mut self, event: ChangeEvent) -> Result<()>;

    /// Called when a poll interval passes with no notification.
    async fn on_idle(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Counters for one `listen` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenStats {
    pub received: u64,
    pub processed: u64,
    pub malformed: u64,
    pub failed: u64,
}

pub struct ChangeListener<S: NotificationSource> {
    source: S,
    connected: bool,
    shutdown: ShutdownToken,
}

impl<S: NotificationSource> ChangeListener<S> {
    pub fn new(source: S) -> Self {
        Self::with_shutdown_token(source, ShutdownToken::new())
    }

    pub fn with_shutdown_token(source: S, shutdown: ShutdownToken) -> Self {
        Self {
            source,
            connected: false,
            shutdown,
        }
    }

    pub async fn connect(&mut self) -> Result<()> {
        self.source.connect().await?;
        self.connected = true;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Deliver events to `handler` until stopped or the source closes.
    ///
    /// Waits at most `poll_interval` per cycle so a stop request is seen
    /// promptly even on a quiet channel.
    pub async fn listen<H: ChangeHandler>(
        &mut self,
        handler: &mut H,
        poll_interval: Duration,
    ) -> Result<ListenStats> {
        if !self.connected {
            return Err(ReplicatorError::NotConnected("change listener"));
        }

        let mut stats = ListenStats::default();
        loop {
            if self.shutdown.is_cancelled() {
                info!("Listener stopping");
                break;
            }

            let payload = tokio::select! {
                _ = self.shutdown.cancelled() => continue,
                received = tokio::time::timeout(poll_interval, self.source.recv()) => match received {
                    Err(_) => {
                        if let Err(e) = handler.on_idle().await {
                            warn!(error = %e, "Idle housekeeping failed");
                        }
                        continue;
                    }
                    Ok(Ok(Some(payload))) => payload,
                    Ok(Ok(None)) => {
                        info!("Notification source closed");
                        break;
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "Notification source failed");
                        return Err(e);
                    }
                },
            };

            stats.received += 1;
            let event = match parse_notification(&payload) {
                Ok(event) => event,
                Err(e) => {
                    stats.malformed += 1;
                    warn!(error = %e, "Skipping malformed notification");
                    continue;
                }
            };

            let table = event.table.clone();
            let operation = event.operation;
            debug!(table = %table, operation = %operation, "Received change");
            match handler.on_change(event).await {
                Ok(()) => stats.processed += 1,
                Err(e) => {
                    stats.failed += 1;
                    error!(table = %table, operation = %operation, error = %e, "Failed to process change");
                }
            }
        }

        Ok(stats)
    }

    /// Ask a running `listen` to return at the next cycle.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        if self.connected {
            self.connected = false;
            self.source.disconnect().await?;
        }
        Ok(())
    }
}
