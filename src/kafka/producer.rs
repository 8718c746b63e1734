use bytes::Bytes;
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::{Header, Message, OwnedHeaders};
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer as _, ProducerContext, ThreadedProducer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientConfig, ClientContext};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{FlushConfig, KafkaConfig};
use crate::model::MessageMetadata;
use crate::Result;

const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(10);

/// An outgoing broker message.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerMessage {
    pub topic: String,
    pub key: String,
    pub payload: Bytes,
    pub headers: Vec<(String, Bytes)>,
    /// Round-tripped untouched to the success or error outcome.
    pub metadata: Option<MessageMetadata>,
}

impl ProducerMessage {
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_ref())
    }
}

/// The broker acknowledged a message.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerSuccess {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub metadata: Option<MessageMetadata>,
}

/// A message was rejected by the broker or could not be enqueued.
#[derive(Debug, Clone)]
pub struct ProducerError {
    pub topic: String,
    pub metadata: Option<MessageMetadata>,
    pub error: KafkaError,
}

/// What the publisher needs from a broker client: an input for outgoing
/// messages and two outcome sources.
///
/// Each outcome receiver is handed out once; later calls get `None`.
pub trait Producer: Send + Sync + 'static {
    fn input(&self) -> &mpsc::Sender<ProducerMessage>;

    fn take_successes(&self) -> Option<mpsc::UnboundedReceiver<ProducerSuccess>>;

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<ProducerError>>;
}

impl<P: Producer> Producer for Arc<P> {
    fn input(&self) -> &mpsc::Sender<ProducerMessage> {
        (**self).input()
    }

    fn take_successes(&self) -> Option<mpsc::UnboundedReceiver<ProducerSuccess>> {
        (**self).take_successes()
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<ProducerError>> {
        (**self).take_errors()
    }
}

pub(crate) fn take_once<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}

struct OutcomeContext {
    successes: mpsc::UnboundedSender<ProducerSuccess>,
    errors: mpsc::UnboundedSender<ProducerError>,
}

impl ClientContext for OutcomeContext {
    fn error(&self, error: KafkaError, reason: &str) {
        warn!(error = %error, reason, "Kafka producer client error");
    }
}

impl ProducerContext for OutcomeContext {
    type DeliveryOpaque = Box<Option<MessageMetadata>>;

    fn delivery(&self, result: &DeliveryResult<'_>, metadata: Self::DeliveryOpaque) {
        match result {
            Ok(message) => {
                let _ = self.successes.send(ProducerSuccess {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    metadata: *metadata,
                });
            }
            Err((error, message)) => {
                let _ = self.errors.send(ProducerError {
                    topic: message.topic().to_string(),
                    metadata: *metadata,
                    error: error.clone(),
                });
            }
        }
    }
}

/// rdkafka-backed [`Producer`].
///
/// A pump task moves messages from the bounded input into librdkafka's
/// queue; delivery reports come back through the producer context.
/// Must be created inside a Tokio runtime.
pub struct KafkaProducer {
    producer: Arc<ThreadedProducer<OutcomeContext>>,
    input: mpsc::Sender<ProducerMessage>,
    successes: Mutex<Option<mpsc::UnboundedReceiver<ProducerSuccess>>>,
    errors: Mutex<Option<mpsc::UnboundedReceiver<ProducerError>>>,
    pump: JoinHandle<()>,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig, flush: FlushConfig) -> Result<Self> {
        let (successes_tx, successes_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        let context = OutcomeContext {
            successes: successes_tx,
            errors: errors_tx.clone(),
        };

        let producer: ThreadedProducer<OutcomeContext> = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("compression.type", &config.compression)
            .set("acks", &config.acks)
            .set("batch.num.messages", flush.max_messages.to_string())
            .set("linger.ms", flush.frequency.as_millis().to_string())
            .create_with_context(context)?;
        let producer = Arc::new(producer);

        info!(
            brokers = ?config.brokers,
            max_messages = flush.max_messages,
            frequency = ?flush.frequency,
            "Kafka producer created"
        );

        let (input, input_rx) = mpsc::channel(flush.max_messages);
        let pump = tokio::spawn(pump(producer.clone(), input_rx, errors_tx));

        Ok(Self {
            producer,
            input,
            successes: Mutex::new(Some(successes_rx)),
            errors: Mutex::new(Some(errors_rx)),
            pump,
        })
    }

    /// Waits for queued messages to be delivered.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        self.producer.flush(timeout)?;
        Ok(())
    }
}

impl Producer for KafkaProducer {
    fn input(&self) -> &mpsc::Sender<ProducerMessage> {
        &self.input
    }

    fn take_successes(&self) -> Option<mpsc::UnboundedReceiver<ProducerSuccess>> {
        take_once(&self.successes)
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<ProducerError>> {
        take_once(&self.errors)
    }
}

impl Drop for KafkaProducer {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump(
    producer: Arc<ThreadedProducer<OutcomeContext>>,
    mut input: mpsc::Receiver<ProducerMessage>,
    errors: mpsc::UnboundedSender<ProducerError>,
) {
    while let Some(message) = input.recv().await {
        loop {
            match enqueue(&producer, &message) {
                Ok(()) => break,
                Err(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull)) => {
                    tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
                }
                Err(error) => {
                    let _ = errors.send(ProducerError {
                        topic: message.topic.clone(),
                        metadata: message.metadata.clone(),
                        error,
                    });
                    break;
                }
            }
        }
    }

    debug!("producer input closed");
}

fn enqueue(producer: &ThreadedProducer<OutcomeContext>, message: &ProducerMessage) -> KafkaResult<()> {
    let headers = message
        .headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(message.headers.len()), |headers, (key, value)| {
            headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_ref()),
            })
        });

    let record = BaseRecord::with_opaque_to(&message.topic, Box::new(message.metadata.clone()))
        .key(message.key.as_str())
        .payload(message.payload.as_ref())
        .headers(headers);

    producer.send(record).map_err(|(error, _)| error)
}
