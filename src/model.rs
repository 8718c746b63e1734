use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    New,
    Done,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::New => "new",
            EventStatus::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(EventStatus::New),
            "done" => Some(EventStatus::Done),
            _ => None,
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted outbox record.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    pub id: String,
    pub aggregate_id: String,
    pub topic: String,
    pub event_type: String,
    pub payload: Bytes,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub reserved_to: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// New, and either never reserved or with a lapsed reservation.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == EventStatus::New && self.reserved_to.map_or(true, |until| until < now)
    }
}

/// Input of `create_event`: the record as written next to a business mutation.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub aggregate_id: String,
    pub topic: String,
    pub event_type: String,
    pub payload: Bytes,
    pub created_at: DateTime<Utc>,
}

impl NewEvent {
    pub fn new(
        aggregate_id: impl Into<String>,
        topic: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            topic: topic.into(),
            event_type: event_type.into(),
            payload: payload.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Attached to every outgoing message so an asynchronous broker outcome
/// can be traced back to its outbox record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    pub id: String,
    pub event_type: String,
}

/// The broker acknowledged the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredEvent {
    pub id: String,
    pub event_type: String,
}

/// The broker rejected the event, or it never left the producer.
#[derive(Debug)]
pub struct FailedEvent {
    pub id: String,
    pub event_type: String,
    pub error: Error,
}

impl From<MessageMetadata> for DeliveredEvent {
    fn from(m: MessageMetadata) -> Self {
        Self {
            id: m.id,
            event_type: m.event_type,
        }
    }
}
