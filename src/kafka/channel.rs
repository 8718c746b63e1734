//! In-process [`Producer`] whose broker side is driven by the caller.

use rdkafka::error::KafkaError;
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::producer::{take_once, Producer, ProducerError, ProducerMessage, ProducerSuccess};

pub struct ChannelProducer {
    input: mpsc::Sender<ProducerMessage>,
    successes: Mutex<Option<mpsc::UnboundedReceiver<ProducerSuccess>>>,
    errors: Mutex<Option<mpsc::UnboundedReceiver<ProducerError>>>,
}

/// The broker end of a [`ChannelProducer`].
pub struct BrokerHandle {
    input: mpsc::Receiver<ProducerMessage>,
    successes: mpsc::UnboundedSender<ProducerSuccess>,
    errors: mpsc::UnboundedSender<ProducerError>,
    offset: i64,
}

impl ChannelProducer {
    /// `capacity` bounds how many messages may wait for the broker side.
    pub fn new(capacity: usize) -> (Self, BrokerHandle) {
        let (input, input_rx) = mpsc::channel(capacity);
        let (successes_tx, successes_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        let producer = Self {
            input,
            successes: Mutex::new(Some(successes_rx)),
            errors: Mutex::new(Some(errors_rx)),
        };

        let broker = BrokerHandle {
            input: input_rx,
            successes: successes_tx,
            errors: errors_tx,
            offset: 0,
        };

        (producer, broker)
    }
}

impl Producer for ChannelProducer {
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

impl BrokerHandle {
    pub async fn recv(&mut self) -> Option<ProducerMessage> {
        self.input.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProducerMessage> {
        self.input.try_recv().ok()
    }

    /// Reports `message` as delivered. Returns `false` once nobody listens.
    pub fn ack(&mut self, message: &ProducerMessage) -> bool {
        self.offset += 1;
        self.successes
            .send(ProducerSuccess {
                topic: message.topic.clone(),
                partition: 0,
                offset: self.offset,
                metadata: message.metadata.clone(),
            })
            .is_ok()
    }

    /// Reports `message` as rejected with `error`.
    pub fn fail(&mut self, message: &ProducerMessage, error: KafkaError) -> bool {
        self.errors
            .send(ProducerError {
                topic: message.topic.clone(),
                metadata: message.metadata.clone(),
                error,
            })
            .is_ok()
    }

    /// Pushes a raw success outcome, metadata included or not.
    pub fn send_success(&self, success: ProducerSuccess) -> bool {
        self.successes.send(success).is_ok()
    }

    /// Pushes a raw error outcome, metadata included or not.
    pub fn send_error(&self, error: ProducerError) -> bool {
        self.errors.send(error).is_ok()
    }

    /// Drops both outcome senders, closing the streams the publisher reads.
    pub fn close_outcomes(self) -> mpsc::Receiver<ProducerMessage> {
        self.input
    }
}
