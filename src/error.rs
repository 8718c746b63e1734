//! Error types and result handling for pg-outbox.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use pg_outbox::{Error, Result};
//!
//! fn reserve() -> Result<()> {
//!     Err(Error::Timeout {
//!         message: "reserve new events".to_string(),
//!     })
//! }
//!
//! match reserve() {
//!     Ok(()) => println!("Reserved"),
//!     Err(e) if e.is_timeout() => eprintln!("Backpressure: {}", e),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for pg-outbox operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Engine configuration rejected at construction. Every violation is listed.
    #[error("invalid config:\n - {}", .violations.join("\n - "))]
    InvalidConfig {
        /// One entry per violated constraint
        violations: Vec<String>,
    },

    /// Configuration file or environment could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client or query error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Kafka client, producer or consumer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic connection error not covered by specific types.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A bounded store or broker call did not finish before its deadline.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// Stop was asked to wait for background tasks but its deadline elapsed first.
    ///
    /// The tasks keep shutting down in the background.
    #[error("Shutdown timed out: {message}")]
    ShutdownTimeout {
        /// Which component did not stop in time
        message: String,
    },

    /// The owning lifetime was cancelled while a call was pending.
    #[error("Operation cancelled")]
    Cancelled,

    /// A channel to or from the broker client is closed.
    #[error("Channel closed: {message}")]
    ChannelClosed {
        /// Which channel closed
        message: String,
    },

    /// The consumer was closed while its session was being cancelled.
    #[error("Consumer handler closed by cancellation")]
    ClosedByCancel,

    /// A message handler failed and ended the consume session.
    #[error("Handler error: {0}")]
    Handler(String),
}

impl Error {
    /// Returns `true` for deadline failures, as opposed to hard infrastructure errors.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::ShutdownTimeout { .. })
    }
}

/// A convenient Result type alias for pg-outbox operations.
///
/// This is equivalent to `std::result::Result<T, pg_outbox::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
