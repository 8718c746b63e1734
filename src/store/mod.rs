//! Reservation contract between the delivery engine and the event storage.
//!
//! A record is eligible for reservation while its status is `new` and it
//! either has no reservation or its reservation already lapsed. Finding and
//! reserving eligible records must happen as one atomic unit so that two
//! engines polling the same storage never reserve the same record.

pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::model::OutboxEvent;
use crate::{Error, Result};

pub use memory::InMemoryStore;

#[async_trait]
pub trait ReservationStore: Send + Sync + 'static {
    /// Reserves up to `limit` eligible events, oldest first, for `reserve_for`.
    async fn reserve_new_events(&self, limit: usize, reserve_for: Duration) -> Result<Vec<OutboxEvent>>;

    /// Marks an event delivered. Confirming a delivered event is a no-op.
    async fn confirm_event(&self, id: &str) -> Result<()>;

    /// Clears the reservation so the next poll picks the event up again.
    /// Clearing an absent reservation is a no-op.
    async fn unreserve_event(&self, id: &str) -> Result<()>;
}

#[async_trait]
impl<S: ReservationStore> ReservationStore for Arc<S> {
    async fn reserve_new_events(&self, limit: usize, reserve_for: Duration) -> Result<Vec<OutboxEvent>> {
        (**self).reserve_new_events(limit, reserve_for).await
    }

    async fn confirm_event(&self, id: &str) -> Result<()> {
        (**self).confirm_event(id).await
    }

    async fn unreserve_event(&self, id: &str) -> Result<()> {
        (**self).unreserve_event(id).await
    }
}

pub(crate) fn chrono_duration(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(|_| Error::InvalidConfig {
        violations: vec![format!("reserve duration {:?} out of range", d)],
    })
}
