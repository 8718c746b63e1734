mod common;

use common::get_test_pg_url;
use pg_outbox::postgres::{create_event, PgEventStore};
use pg_outbox::{EventStatus, NewEvent, ReservationStore};
use std::collections::HashSet;
use std::time::Duration;
use tokio_postgres::{Client, NoTls};

// Run with: cargo test --test postgres_store_test -- --ignored --test-threads=1

async fn connect() -> Client {
    let (client, connection) = tokio_postgres::connect(&get_test_pg_url(), NoTls)
        .await
        .expect("Failed to connect to PostgreSQL");

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("Connection error: {}", e);
        }
    });

    client
}

async fn setup() -> (PgEventStore, Client) {
    let store = PgEventStore::connect(&get_test_pg_url()).await.unwrap();
    store.ensure_schema().await.unwrap();

    let client = connect().await;
    client.execute("DELETE FROM outbox_events", &[]).await.unwrap();

    (store, client)
}

async fn status_of(client: &Client, id: &str) -> (EventStatus, bool) {
    let row = client
        .query_one(
            "SELECT status, reserved_to IS NOT NULL FROM outbox_events WHERE id = $1::text::uuid",
            &[&id],
        )
        .await
        .unwrap();

    let status: String = row.get(0);
    (EventStatus::parse(&status).unwrap(), row.get(1))
}

#[tokio::test]
#[ignore]
async fn test_event_follows_the_business_transaction() {
    let (store, mut client) = setup().await;

    let tx = client.transaction().await.unwrap();
    create_event(&tx, &NewEvent::new("order-1", "orders", "order.created", "{}"))
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    let reserved = store.reserve_new_events(10, Duration::from_secs(15)).await.unwrap();
    assert!(reserved.is_empty(), "rolled back event must not be visible");

    let tx = client.transaction().await.unwrap();
    let id = create_event(&tx, &NewEvent::new("order-1", "orders", "order.created", "{}"))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let reserved = store.reserve_new_events(10, Duration::from_secs(15)).await.unwrap();
    assert_eq!(reserved.len(), 1);
    assert_eq!(reserved[0].id, id);
    assert_eq!(reserved[0].topic, "orders");
    assert_eq!(reserved[0].payload.as_ref(), b"{}");
    assert!(reserved[0].reserved_to.is_some());
}

#[tokio::test]
#[ignore]
async fn test_concurrent_stores_never_share_events() {
    let (store_a, client) = setup().await;
    let store_b = PgEventStore::connect(&get_test_pg_url()).await.unwrap();

    for i in 0..40 {
        create_event(&client, &NewEvent::new(format!("order-{}", i), "orders", "order.created", "{}"))
            .await
            .unwrap();
    }

    let (a, b) = tokio::join!(
        store_a.reserve_new_events(25, Duration::from_secs(15)),
        store_b.reserve_new_events(25, Duration::from_secs(15)),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    let ids_a: HashSet<String> = a.into_iter().map(|e| e.id).collect();
    let ids_b: HashSet<String> = b.into_iter().map(|e| e.id).collect();
    assert!(ids_a.is_disjoint(&ids_b));
    assert!(ids_a.len() + ids_b.len() <= 40);

    // Everything reserved until the reservation lapses
    let rest = store_a.reserve_new_events(100, Duration::from_secs(15)).await.unwrap();
    assert_eq!(ids_a.len() + ids_b.len() + rest.len(), 40);
}

#[tokio::test]
#[ignore]
async fn test_confirm_and_unreserve_are_idempotent() {
    let (store, client) = setup().await;

    let done = create_event(&client, &NewEvent::new("order-1", "orders", "order.created", "{}"))
        .await
        .unwrap();
    let retried = create_event(&client, &NewEvent::new("order-2", "orders", "order.created", "{}"))
        .await
        .unwrap();

    let reserved = store.reserve_new_events(10, Duration::from_secs(15)).await.unwrap();
    assert_eq!(reserved.len(), 2);

    store.confirm_event(&done).await.unwrap();
    store.confirm_event(&done).await.unwrap();
    assert_eq!(status_of(&client, &done).await.0, EventStatus::Done);

    store.unreserve_event(&retried).await.unwrap();
    store.unreserve_event(&retried).await.unwrap();
    assert_eq!(status_of(&client, &retried).await, (EventStatus::New, false));

    let again = store.reserve_new_events(10, Duration::from_secs(15)).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].id, retried);
}
