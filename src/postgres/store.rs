use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_postgres::{Client, GenericClient, NoTls, Row};
use tracing::{debug, error, info};

use crate::model::{EventStatus, NewEvent, OutboxEvent};
use crate::store::{chrono_duration, ReservationStore};
use crate::{Error, Result};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_events (
    id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    aggregate_id text NOT NULL,
    event_topic text NOT NULL,
    event_type text NOT NULL,
    payload bytea NOT NULL,
    status text NOT NULL DEFAULT 'new',
    created_at timestamptz NOT NULL DEFAULT now(),
    reserved_to timestamptz
);
CREATE INDEX IF NOT EXISTS outbox_events_eligible_idx
    ON outbox_events (created_at) WHERE status = 'new';
"#;

const FIND_NEW_AND_NOT_RESERVED: &str = "SELECT id::text, aggregate_id, event_topic, event_type, \
     payload, status, created_at, reserved_to \
     FROM outbox_events \
     WHERE status = $1 AND (reserved_to IS NULL OR reserved_to < $2) \
     ORDER BY created_at ASC \
     LIMIT $3 \
     FOR UPDATE SKIP LOCKED";

const SET_RESERVED_TO: &str =
    "UPDATE outbox_events SET reserved_to = $1 WHERE id = ANY($2::text[]::uuid[])";

const SET_STATUS_DONE: &str = "UPDATE outbox_events SET status = $1 WHERE id = $2::text::uuid";

const REMOVE_RESERVE: &str = "UPDATE outbox_events SET reserved_to = NULL WHERE id = $1::text::uuid";

const INSERT_EVENT: &str = "INSERT INTO outbox_events \
     (aggregate_id, event_topic, event_type, payload, created_at) \
     VALUES ($1, $2, $3, $4, $5) RETURNING id::text";

/// Outbox storage on a single PostgreSQL connection.
///
/// Reservation runs in its own transaction and locks the selected rows with
/// `FOR UPDATE SKIP LOCKED`, so concurrent relays polling the same table
/// split the backlog instead of sharing it.
pub struct PgEventStore {
    client: Mutex<Client>,
}

impl PgEventStore {
    pub fn new(client: Client) -> Self {
        Self {
            client: Mutex::new(client),
        }
    }

    pub async fn connect(connection_string: &str) -> Result<Self> {
        info!("Connecting to PostgreSQL");

        let (client, connection) = tokio_postgres::connect(connection_string, NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Connection error: {}", e);
            }
        });

        info!("Successfully connected to PostgreSQL");
        Ok(Self::new(client))
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        info!("Ensuring outbox schema exists");
        self.client.lock().await.batch_execute(SCHEMA).await?;
        Ok(())
    }
}

/// Inserts a new outbox event through `client`.
///
/// Pass the caller's [`tokio_postgres::Transaction`] to make the event part of
/// the same commit as the business change that produced it.
pub async fn create_event<C: GenericClient + Sync>(client: &C, event: &NewEvent) -> Result<String> {
    let row = client
        .query_one(
            INSERT_EVENT,
            &[
                &event.aggregate_id,
                &event.topic,
                &event.event_type,
                &event.payload.as_ref(),
                &event.created_at,
            ],
        )
        .await?;

    let id: String = row.try_get(0)?;
    debug!(event_id = %id, event_type = %event.event_type, "created outbox event");
    Ok(id)
}

async fn find_new_and_not_reserved<C: GenericClient + Sync>(
    client: &C,
    limit: usize,
    now: DateTime<Utc>,
) -> Result<Vec<OutboxEvent>> {
    let rows = client
        .query(
            FIND_NEW_AND_NOT_RESERVED,
            &[&EventStatus::New.as_str(), &now, &(limit as i64)],
        )
        .await?;

    rows.iter().map(event_from_row).collect()
}

async fn set_reserved_to<C: GenericClient + Sync>(
    client: &C,
    ids: &[String],
    until: DateTime<Utc>,
) -> Result<()> {
    client.execute(SET_RESERVED_TO, &[&until, &ids]).await?;
    Ok(())
}

fn event_from_row(row: &Row) -> Result<OutboxEvent> {
    let status: String = row.try_get(5)?;
    let status = EventStatus::parse(&status)
        .ok_or_else(|| Error::Connection(format!("unknown event status '{}'", status)))?;
    let payload: Vec<u8> = row.try_get(4)?;

    Ok(OutboxEvent {
        id: row.try_get(0)?,
        aggregate_id: row.try_get(1)?,
        topic: row.try_get(2)?,
        event_type: row.try_get(3)?,
        payload: Bytes::from(payload),
        status,
        created_at: row.try_get(6)?,
        reserved_to: row.try_get(7)?,
    })
}

#[async_trait]
impl ReservationStore for PgEventStore {
    async fn reserve_new_events(&self, limit: usize, reserve_for: Duration) -> Result<Vec<OutboxEvent>> {
        let now = Utc::now();
        let until = now + chrono_duration(reserve_for)?;

        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let mut events = find_new_and_not_reserved(&tx, limit, now).await?;

        if !events.is_empty() {
            let ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
            set_reserved_to(&tx, &ids, until).await?;
            for event in events.iter_mut() {
                event.reserved_to = Some(until);
            }
        }

        tx.commit().await?;
        Ok(events)
    }

    async fn confirm_event(&self, id: &str) -> Result<()> {
        self.client
            .lock()
            .await
            .execute(SET_STATUS_DONE, &[&EventStatus::Done.as_str(), &id])
            .await?;
        Ok(())
    }

    async fn unreserve_event(&self, id: &str) -> Result<()> {
        self.client.lock().await.execute(REMOVE_RESERVE, &[&id]).await?;
        Ok(())
    }
}
