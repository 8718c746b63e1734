//! Hands outbox events to the broker client and turns its asynchronous
//! delivery reports back into per-event outcomes.

use bytes::Bytes;
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bounded::bounded;
use crate::kafka::{Producer, ProducerError, ProducerMessage, ProducerSuccess};
use crate::model::{DeliveredEvent, FailedEvent, MessageMetadata, OutboxEvent};
use crate::{Error, Result};

const OUTCOME_BUFFER: usize = 128;

/// Receiving end of a demultiplexed outcome channel.
///
/// Clones share one underlying channel; each outcome is seen by one reader.
pub struct OutcomeStream<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for OutcomeStream<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> OutcomeStream<T> {
    fn new(rx: mpsc::Receiver<T>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Next outcome, or `None` once the demultiplexer has stopped.
    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}

pub struct Publisher<P: Producer> {
    producer: P,
    header_event_id: String,
    header_event_type: String,
    successes: OnceLock<OutcomeStream<DeliveredEvent>>,
    errors: OnceLock<OutcomeStream<FailedEvent>>,
}

impl<P: Producer> Publisher<P> {
    pub fn new(producer: P, header_event_id: impl Into<String>, header_event_type: impl Into<String>) -> Self {
        Self {
            producer,
            header_event_id: header_event_id.into(),
            header_event_type: header_event_type.into(),
            successes: OnceLock::new(),
            errors: OnceLock::new(),
        }
    }

    pub fn producer(&self) -> &P {
        &self.producer
    }

    /// Enqueues `event` on the producer input.
    ///
    /// Only waits for room in the input, not for the broker acknowledgement.
    /// Fails with [`Error::Timeout`] if the input stays full past `deadline`.
    pub async fn publish(&self, event: &OutboxEvent, deadline: Instant, token: &CancellationToken) -> Result<()> {
        let message = self.message_for(event);
        let op = format!("publish event {}", event.id);

        bounded(token, deadline, &op, async move {
            self.producer
                .input()
                .send(message)
                .await
                .map_err(|_| Error::ChannelClosed {
                    message: "producer input".to_string(),
                })
        })
        .await
    }

    fn message_for(&self, event: &OutboxEvent) -> ProducerMessage {
        ProducerMessage {
            topic: event.topic.clone(),
            key: event.aggregate_id.clone(),
            payload: event.payload.clone(),
            headers: vec![
                (self.header_event_id.clone(), Bytes::from(event.id.clone())),
                (self.header_event_type.clone(), Bytes::from(event.event_type.clone())),
            ],
            metadata: Some(MessageMetadata {
                id: event.id.clone(),
                event_type: event.event_type.clone(),
            }),
        }
    }

    /// Delivered events. The demultiplexer starts on the first call and
    /// runs until `token` is cancelled or the producer closes its success source.
    pub fn successes(&self, token: &CancellationToken) -> OutcomeStream<DeliveredEvent> {
        self.successes
            .get_or_init(|| {
                let (tx, rx) = mpsc::channel(OUTCOME_BUFFER);
                match self.producer.take_successes() {
                    Some(source) => {
                        tokio::spawn(demultiplex(source, tx, token.clone(), "successes", success_outcome));
                    }
                    None => warn!("producer success source already taken"),
                }
                OutcomeStream::new(rx)
            })
            .clone()
    }

    /// Failed events, started the same way as [`Publisher::successes`].
    pub fn errors(&self, token: &CancellationToken) -> OutcomeStream<FailedEvent> {
        self.errors
            .get_or_init(|| {
                let (tx, rx) = mpsc::channel(OUTCOME_BUFFER);
                match self.producer.take_errors() {
                    Some(source) => {
                        tokio::spawn(demultiplex(source, tx, token.clone(), "errors", error_outcome));
                    }
                    None => warn!("producer error source already taken"),
                }
                OutcomeStream::new(rx)
            })
            .clone()
    }
}

fn success_outcome(success: ProducerSuccess) -> Option<DeliveredEvent> {
    success.metadata.map(DeliveredEvent::from)
}

fn error_outcome(failure: ProducerError) -> Option<FailedEvent> {
    let ProducerError { metadata, error, .. } = failure;
    metadata.map(|m| FailedEvent {
        id: m.id,
        event_type: m.event_type,
        error: Error::Kafka(error),
    })
}

async fn demultiplex<R, T>(
    mut source: mpsc::UnboundedReceiver<R>,
    output: mpsc::Sender<T>,
    token: CancellationToken,
    kind: &'static str,
    convert: fn(R) -> Option<T>,
) {
    loop {
        let raw = tokio::select! {
            _ = token.cancelled() => {
                debug!(kind, "demultiplexer stopped: cancelled");
                return;
            }
            raw = source.recv() => match raw {
                Some(raw) => raw,
                None => {
                    debug!(kind, "demultiplexer stopped: source closed");
                    return;
                }
            },
        };

        let Some(outcome) = convert(raw) else {
            warn!(kind, "dropping broker outcome without correlation metadata");
            continue;
        };

        tokio::select! {
            _ = token.cancelled() => return,
            sent = output.send(outcome) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}
