pub mod channel;
pub mod consumer;
pub mod consumer_group;
pub mod producer;


pub use channel::{BrokerHandle, ChannelProducer};
pub use consumer::{ConsumedMessage, GroupClient, KafkaGroupClient, MessageHandler};
pub use consumer_group::ConsumerGroup;
pub use producer::{KafkaProducer, Producer, ProducerError, ProducerMessage, ProducerSuccess};
