//! Coordinator: listener → encryptor → sender, plus startup and drain.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info};

use crate::error::Result;
use crate::key_manager::KeyRotationManager;
use crate::listener::{ChangeEvent, ChangeHandler, ChangeListener, ListenStats, NotificationSource};
use crate::sender::{DeliverySender, DeliveryStats, SendResult};
use crate::shutdown::ShutdownToken;
use crate::storage::KeyStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    Stopped,
    Listening,
    Draining,
}

/// What a completed `run` did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub listen: ListenStats,
    /// Result of the flush performed while draining
    pub final_flush: SendResult,
    pub delivery: DeliveryStats,
}

/// Per-event work: encrypt with the active key, then hand to the sender.
struct Pipeline<K: KeyStore> {
    keys: KeyRotationManager<K>,
    sender: DeliverySender,
}

#[async_trait]
impl<K: KeyStore + 'static> ChangeHandler for Pipeline<K> {
    async fn on_change(&mut self, event: ChangeEvent) -> Result<()> {
        let envelope = self
            .keys
            .active_encryptor()?
            .encrypt(&event.data, &event.table, event.operation)?;
        self.sender.send(envelope).await?;
        Ok(())
    }

    async fn on_idle(&mut self) -> Result<()> {
        self.sender.flush_if_due().await?;
        Ok(())
    }
}

pub struct Replicator<S: NotificationSource, K: KeyStore> {
    listener: ChangeListener<S>,
    pipeline: Pipeline<K>,
    poll_interval: Duration,
    state: ReplicatorState,
}

impl<S: NotificationSource, K: KeyStore + 'static> Replicator<S, K> {
    /// `keys` should already be loaded.
    pub fn new(source: S, keys: KeyRotationManager<K>, sender: DeliverySender, poll_interval: Duration) -> Self {
        Self {
            listener: ChangeListener::new(source),
            pipeline: Pipeline { keys, sender },
            poll_interval,
            state: ReplicatorState::Stopped,
        }
    }

    pub fn state(&self) -> ReplicatorState {
        self.state
    }

    /// Token that ends a running [`run`](Self::run) when cancelled.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.listener.shutdown_token()
    }

    pub fn key_manager(&self) -> &KeyRotationManager<K> {
        &self.pipeline.keys
    }

    /// Replicate until the shutdown token fires or the source closes,
    /// then drain the sender.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let key_id = self.pipeline.keys.active_encryptor()?.key_id().to_string();
        info!(key_id = %key_id, "Starting replicator");

        self.pipeline.sender.connect()?;
        if let Err(e) = self.listener.connect().await {
            self.pipeline.sender.disconnect().await?;
            return Err(e);
        }

        self.state = ReplicatorState::Listening;
        let listened = self
            .listener
            .listen(&mut self.pipeline, self.poll_interval)
            .await;

        self.state = ReplicatorState::Draining;
        info!("Draining");
        if let Err(e) = self.listener.disconnect().await {
            error!(error = %e, "Failed to disconnect listener");
        }
        let final_flush = self.pipeline.sender.disconnect().await;
        self.state = ReplicatorState::Stopped;

        let listen = listened?;
        let final_flush = final_flush?;
        let delivery = self.pipeline.sender.stats();
        info!(
            received = listen.received,
            processed = listen.processed,
            malformed = listen.malformed,
            failed = listen.failed,
            sent = delivery.sent,
            undelivered = delivery.failed,
            "Replicator stopped"
        );

        Ok(RunSummary {
            listen,
            final_flush,
            delivery,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplicatorError;
    use crate::listener::ChannelSource;
    use crate::sender::{RetryPolicy, SenderConfig};
    use crate::storage::InMemoryKeyStore;
    use std::sync::Arc;

    fn dry_run_sender(batch_size: usize) -> DeliverySender {
        DeliverySender::new(SenderConfig {
            endpoint: None,
            token: None,
            batch_size,
            flush_interval: Duration::from_secs(3600),
            retry: RetryPolicy::new(0, Duration::from_millis(1)),
            request_timeout: Duration::from_secs(1),
            dry_run: true,
        })
    }

    fn keys(with_key: bool) -> KeyRotationManager<InMemoryKeyStore> {
        let mut manager = KeyRotationManager::new(Arc::new(InMemoryKeyStore::new()));
        if with_key {
            manager.rotate(Some("key-test")).unwrap();
        } else {
            manager.load().unwrap();
        }
        manager
    }

    #[tokio::test]
    async fn test_run_without_key_is_fatal() {
        let (_tx, source) = ChannelSource::channel(1);
        let mut replicator = Replicator::new(source, keys(false), dry_run_sender(10), Duration::from_millis(10));

        assert!(matches!(replicator.run().await, Err(ReplicatorError::NoActiveKey)));
        assert_eq!(replicator.state(), ReplicatorState::Stopped);
        assert!(replicator.key_manager().is_empty());
    }

    #[tokio::test]
    async fn test_run_until_source_closes() {
        let (tx, source) = ChannelSource::channel(8);
        let mut replicator = Replicator::new(source, keys(true), dry_run_sender(2), Duration::from_millis(20));

        for n in 0..3 {
            tx.send(format!(r#"{{"table":"orders","operation":"INSERT","data":{{"id":{n}}}}}"#))
                .await
                .unwrap();
        }
        tx.send("not json".into()).await.unwrap();
        drop(tx);

        let summary = replicator.run().await.unwrap();
        assert_eq!(summary.listen.received, 4);
        assert_eq!(summary.listen.processed, 3);
        assert_eq!(summary.listen.malformed, 1);
        // two went out with the full batch, the third on drain
        assert_eq!(summary.final_flush.sent_count, 1);
        assert_eq!(summary.delivery.sent, 3);
        assert_eq!(replicator.state(), ReplicatorState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_token_drains() {
        let (tx, source) = ChannelSource::channel(8);
        let mut replicator = Replicator::new(source, keys(true), dry_run_sender(100), Duration::from_millis(20));
        let token = replicator.shutdown_token();

        tx.send(r#"{"table":"orders","operation":"DELETE","data":{"id":1}}"#.into())
            .await
            .unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let summary = replicator.run().await.unwrap();
        assert_eq!(summary.listen.processed, 1);
        assert_eq!(summary.final_flush.sent_count, 1);
        drop(tx);
    }
}
