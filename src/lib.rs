//! Transactional outbox relay: events written next to a business change in
//! PostgreSQL are delivered, at least once, to Kafka.

pub mod config;
pub mod error;
pub mod kafka;
pub mod model;
pub mod postgres;
pub mod publisher;
pub mod relay;
pub mod store;

mod bounded;

pub use config::{FlushConfig, OutboxConfig};
pub use error::{Error, Result};
pub use model::{EventStatus, NewEvent, OutboxEvent};
pub use publisher::Publisher;
pub use relay::Relay;
pub use store::{InMemoryStore, ReservationStore};
