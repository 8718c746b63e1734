use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use super::consumer::{GroupClient, KafkaGroupClient, MessageHandler};
use crate::config::ConsumerGroupConfig;
use crate::{Error, Result};

/// Keeps a consumer-group session alive, starting a new one whenever the
/// previous one ends.
pub struct ConsumerGroup<C: GroupClient, H: MessageHandler> {
    client: Arc<C>,
    handler: Arc<H>,
    sleep_after_rebalance: Duration,
    token: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl<H: MessageHandler> ConsumerGroup<KafkaGroupClient, H> {
    pub fn connect(config: &ConsumerGroupConfig, handler: H) -> Result<Self> {
        let client = KafkaGroupClient::new(config)?;
        Ok(Self::new(client, handler, config.sleep_after_rebalance))
    }
}

impl<C: GroupClient, H: MessageHandler> ConsumerGroup<C, H> {
    pub fn new(client: C, handler: H, sleep_after_rebalance: Duration) -> Self {
        Self {
            client: Arc::new(client),
            handler: Arc::new(handler),
            sleep_after_rebalance,
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns the error reader and the consume loop, then returns.
    ///
    /// Runs once; later calls do nothing.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) || self.token.is_cancelled() {
            warn!("consumer group already started");
            return;
        }

        match self.client.take_errors() {
            Some(errors) => {
                self.tracker.spawn(read_errors(errors, self.token.clone()));
            }
            None => warn!("consumer group errors already taken, not reading them"),
        }

        self.tracker.spawn(consume(
            self.client.clone(),
            self.handler.clone(),
            self.sleep_after_rebalance,
            self.token.clone(),
        ));
    }

    /// Cancels both tasks, waits for them and closes the client, all within `timeout`.
    ///
    /// On timeout the shutdown carries on in the background.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        self.token.cancel();
        self.tracker.close();

        let (done_tx, done_rx) = oneshot::channel();
        let tracker = self.tracker.clone();
        let client = self.client.clone();

        tokio::spawn(async move {
            tracker.wait().await;
            let _ = done_tx.send(client.close().await);
        });

        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(Ok(()))) | Ok(Ok(Err(Error::ClosedByCancel))) => {
                info!("consumer group stopped");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::ChannelClosed {
                message: "consumer group close".to_string(),
            }),
            Err(_) => {
                warn!("consumer group did not stop in time");
                Err(Error::ShutdownTimeout {
                    message: "consumer group".to_string(),
                })
            }
        }
    }
}

async fn read_errors(mut errors: mpsc::UnboundedReceiver<Error>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("cancelled, exit consumer group errors-reader");
                return;
            }
            err = errors.recv() => match err {
                Some(err) => error!(error = %err, "consumer group error"),
                None => {
                    info!("consumer group errors channel closed, exit reading errors");
                    return;
                }
            },
        }
    }
}

async fn consume<C: GroupClient, H: MessageHandler>(
    client: Arc<C>,
    handler: Arc<H>,
    sleep_after_rebalance: Duration,
    token: CancellationToken,
) {
    loop {
        if token.is_cancelled() {
            info!("cancelled, exit consuming");
            return;
        }

        if let Err(e) = client.consume(handler.as_ref(), &token).await {
            error!(error = %e, "consume session ended");

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!("cancelled during backoff, exit consuming");
                    return;
                }
                _ = tokio::time::sleep(sleep_after_rebalance) => {}
            }
        }
    }
}
