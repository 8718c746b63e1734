use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::{chrono_duration, ReservationStore};
use crate::model::{EventStatus, NewEvent, OutboxEvent};
use crate::Result;

/// Process-local event storage honouring the reservation contract.
///
/// Find and reserve run under a single lock, which gives the same mutual
/// exclusion a row-locking transaction gives [`crate::postgres::PgEventStore`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    events: Vec<OutboxEvent>,
    next_id: u64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_event(&self, event: NewEvent) -> String {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id.to_string();

        inner.events.push(OutboxEvent {
            id: id.clone(),
            aggregate_id: event.aggregate_id,
            topic: event.topic,
            event_type: event.event_type,
            payload: event.payload,
            status: EventStatus::New,
            created_at: event.created_at,
            reserved_to: None,
        });

        id
    }

    pub fn get(&self, id: &str) -> Option<OutboxEvent> {
        self.lock().events.iter().find(|e| e.id == id).cloned()
    }

    /// Eligible events, oldest first, without reserving them.
    pub fn find_eligible(&self, limit: usize) -> Vec<OutboxEvent> {
        Self::eligible(&self.lock(), limit)
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn eligible(inner: &Inner, limit: usize) -> Vec<OutboxEvent> {
        let now = Utc::now();
        let mut eligible: Vec<OutboxEvent> = inner
            .events
            .iter()
            .filter(|e| e.is_eligible(now))
            .cloned()
            .collect();

        eligible.sort_by_key(|e| e.created_at);
        eligible.truncate(limit);
        eligible
    }

    fn update<F>(&self, id: &str, f: F)
    where
        F: FnOnce(&mut OutboxEvent),
    {
        let mut inner = self.lock();
        if let Some(event) = inner.events.iter_mut().find(|e| e.id == id) {
            f(event);
        }
    }
}

#[async_trait]
impl ReservationStore for InMemoryStore {
    async fn reserve_new_events(&self, limit: usize, reserve_for: Duration) -> Result<Vec<OutboxEvent>> {
        let until = Utc::now() + chrono_duration(reserve_for)?;

        let mut inner = self.lock();
        let mut reserved = Self::eligible(&inner, limit);

        for event in reserved.iter_mut() {
            event.reserved_to = Some(until);
            if let Some(stored) = inner.events.iter_mut().find(|e| e.id == event.id) {
                stored.reserved_to = Some(until);
            }
        }

        debug!(count = reserved.len(), "reserved events");
        Ok(reserved)
    }

    async fn confirm_event(&self, id: &str) -> Result<()> {
        self.update(id, |e| e.status = EventStatus::Done);
        Ok(())
    }

    async fn unreserve_event(&self, id: &str) -> Result<()> {
        self.update(id, |e| e.reserved_to = None);
        Ok(())
    }
}
