use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Headers, Message};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::producer::take_once;
use crate::config::ConsumerGroupConfig;
use crate::{Error, Result};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// An owned copy of a consumed broker message.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub payload: Option<Bytes>,
    pub headers: Vec<(String, Bytes)>,
}

impl ConsumedMessage {
    pub fn from_kafka<M: Message>(message: &M) -> Self {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|h| {
                        (
                            h.key.to_string(),
                            h.value.map(Bytes::copy_from_slice).unwrap_or_default(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(Bytes::copy_from_slice),
            payload: message.payload().map(Bytes::copy_from_slice),
            headers,
        }
    }

    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_ref())
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// An error ends the current consume session. The message is delivered
    /// again once the next session starts.
    async fn handle(&self, message: ConsumedMessage) -> Result<()>;
}

/// A consumer-group membership as seen by [`super::ConsumerGroup`].
#[async_trait]
pub trait GroupClient: Send + Sync + 'static {
    /// Runs one consume session, returning when it ends for any reason:
    /// cancellation, a disconnect or rebalance, or a handler error.
    async fn consume<H: MessageHandler>(&self, handler: &H, token: &CancellationToken) -> Result<()>;

    /// Client errors surfaced outside of a session. Handed out once.
    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<Error>>;

    async fn close(&self) -> Result<()>;
}

/// Consumer position bookkeeping around one handled message.
pub(crate) trait OffsetTracker {
    /// The message was handled; resume after it.
    fn mark(&self, message: &ConsumedMessage) -> Result<()>;

    /// The message was not handled; the next session must see it again.
    fn rewind(&self, message: &ConsumedMessage) -> Result<()>;
}

/// Hands `message` to `handler`, then moves the position past it on success
/// or back onto it on failure. Handler failures come back as [`Error::Handler`].
pub(crate) async fn dispatch<H, T>(handler: &H, tracker: &T, message: ConsumedMessage) -> Result<()>
where
    H: MessageHandler,
    T: OffsetTracker + Sync,
{
    match handler.handle(message.clone()).await {
        Ok(()) => tracker.mark(&message),
        Err(e) => {
            if let Err(rewind_err) = tracker.rewind(&message) {
                error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %rewind_err,
                    "failed to rewind after handler error, message may be skipped"
                );
            }

            Err(match e {
                Error::Handler(_) => e,
                other => Error::Handler(other.to_string()),
            })
        }
    }
}

struct GroupContext {
    errors: mpsc::UnboundedSender<Error>,
}

impl ClientContext for GroupContext {
    fn error(&self, error: KafkaError, reason: &str) {
        debug!(reason, "Kafka consumer client error");
        let _ = self.errors.send(Error::Kafka(error));
    }
}

impl ConsumerContext for GroupContext {}

/// rdkafka-backed [`GroupClient`].
///
/// Reads from the oldest unread offset with uncommitted reads visible.
/// Every handled message is recorded as consumed: with auto-commit on its
/// offset is stored and librdkafka commits it periodically, with auto-commit
/// off it is committed right away. A message whose handler fails is seeked
/// back to, so the next session receives it again.
pub struct KafkaGroupClient {
    consumer: StreamConsumer<GroupContext>,
    auto_commit: bool,
    errors: Mutex<Option<mpsc::UnboundedReceiver<Error>>>,
}

impl KafkaGroupClient {
    pub fn new(config: &ConsumerGroupConfig) -> Result<Self> {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        let consumer: StreamConsumer<GroupContext> = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("group.id", &config.group_id)
            .set("auto.offset.reset", "earliest")
            .set("isolation.level", "read_uncommitted")
            .set("enable.auto.commit", config.auto_commit.to_string())
            .set("enable.auto.offset.store", "false")
            .create_with_context(GroupContext { errors: errors_tx })?;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;

        info!(
            group_id = %config.group_id,
            topics = ?config.topics,
            auto_commit = config.auto_commit,
            "Kafka consumer group joined"
        );

        Ok(Self {
            consumer,
            auto_commit: config.auto_commit,
            errors: Mutex::new(Some(errors_rx)),
        })
    }
}

impl OffsetTracker for KafkaGroupClient {
    fn mark(&self, message: &ConsumedMessage) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(&message.topic, message.partition, Offset::Offset(message.offset + 1))?;

        if self.auto_commit {
            self.consumer.store_offsets(&offsets)?;
        } else {
            self.consumer.commit(&offsets, CommitMode::Async)?;
        }
        Ok(())
    }

    fn rewind(&self, message: &ConsumedMessage) -> Result<()> {
        self.consumer.seek(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset),
            SEEK_TIMEOUT,
        )?;
        debug!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "rewound to unhandled message"
        );
        Ok(())
    }
}

#[async_trait]
impl GroupClient for KafkaGroupClient {
    async fn consume<H: MessageHandler>(&self, handler: &H, token: &CancellationToken) -> Result<()> {
        loop {
            let message = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                received = self.consumer.recv() => ConsumedMessage::from_kafka(&received?),
            };

            dispatch(handler, self, message).await?;
        }
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        take_once(&self.errors)
    }

    async fn close(&self) -> Result<()> {
        self.consumer.unsubscribe();
        info!("Kafka consumer group left");
        Ok(())
    }
}
