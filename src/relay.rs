//! The delivery engine.
//!
//! Every `interval` the relay reserves a batch of eligible events, hands them
//! to the [`Publisher`] and returns. Two monitors follow the publisher's
//! outcome streams: delivered events are confirmed, failed ones are
//! unreserved so the next poll picks them up again. A crash in between is
//! covered by the reservation expiring on its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::bounded::bounded;
use crate::config::OutboxConfig;
use crate::kafka::Producer;
use crate::model::{DeliveredEvent, FailedEvent};
use crate::publisher::{OutcomeStream, Publisher};
use crate::store::ReservationStore;
use crate::{Error, Result};

pub struct Relay<S: ReservationStore, P: Producer> {
    shared: Arc<Shared<S, P>>,
    token: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

struct Shared<S, P: Producer> {
    store: S,
    publisher: Publisher<P>,
    config: OutboxConfig,
    in_process: AtomicBool,
}

/// Clears the single-flight flag when a poll cycle ends, however it ends.
struct InProcess<'a>(&'a AtomicBool);

impl Drop for InProcess<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S: ReservationStore, P: Producer> Relay<S, P> {
    /// Validates `config` and wires the store and producer together.
    pub fn new(store: S, producer: P, config: OutboxConfig) -> Result<Self> {
        config.validate()?;

        let publisher = Publisher::new(
            producer,
            config.header_event_id.clone(),
            config.header_event_type.clone(),
        );

        Ok(Self {
            shared: Arc::new(Shared {
                store,
                publisher,
                config,
                in_process: AtomicBool::new(false),
            }),
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &S {
        &self.shared.store
    }

    pub fn producer(&self) -> &P {
        self.shared.publisher.producer()
    }

    /// Spawns the poll loop and both outcome monitors, then returns.
    ///
    /// A relay runs once; calling `start` again, or after `stop`, does nothing.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) || self.token.is_cancelled() {
            warn!("outbox relay already started");
            return;
        }

        let successes = self.shared.publisher.successes(&self.token);
        let errors = self.shared.publisher.errors(&self.token);

        self.tracker
            .spawn(monitor_successes(self.shared.clone(), successes, self.token.clone()));
        self.tracker
            .spawn(monitor_errors(self.shared.clone(), errors, self.token.clone()));
        self.tracker.spawn(poll(
            self.shared.clone(),
            self.token.clone(),
            self.tracker.clone(),
        ));

        info!(
            limit = self.shared.config.limit,
            interval = ?self.shared.config.interval,
            reserve_duration = ?self.shared.config.reserve_duration,
            process_timeout = ?self.shared.config.process_timeout,
            "outbox relay started"
        );
    }

    /// Cancels every task and waits up to `timeout` for them to finish.
    ///
    /// On [`Error::ShutdownTimeout`] the tasks are still winding down in the
    /// background; calling `stop` again waits for them once more.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        self.token.cancel();
        self.tracker.close();

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                info!("outbox relay stopped successfully");
                Ok(())
            }
            Err(_) => {
                warn!("outbox relay stop timed out");
                Err(Error::ShutdownTimeout {
                    message: "outbox relay".to_string(),
                })
            }
        }
    }
}

impl<S: ReservationStore, P: Producer> Shared<S, P> {
    fn deadline(&self) -> Instant {
        Instant::now() + self.config.process_timeout
    }

    /// One poll cycle. Returns how many events reached the producer input.
    async fn process(&self, token: &CancellationToken) -> usize {
        let reserved = bounded(
            token,
            self.deadline(),
            "reserve new events",
            self.store
                .reserve_new_events(self.config.limit, self.config.reserve_duration),
        )
        .await;

        let events = match reserved {
            Ok(events) => events,
            Err(Error::Cancelled) => return 0,
            Err(e) => {
                error!(error = %e, "error when reserving new events");
                return 0;
            }
        };

        if events.is_empty() {
            debug!("skip processing, no new events");
            return 0;
        }

        let deadline = self.deadline();
        let mut published = 0;

        for event in &events {
            match self.publisher.publish(event, deadline, token).await {
                Ok(()) => published += 1,
                Err(Error::Cancelled) => break,
                Err(e) => error!(event_id = %event.id, error = %e, "publish error"),
            }
        }

        debug!(reserved = events.len(), published, "poll cycle finished");
        published
    }

    async fn confirm(&self, event: &DeliveredEvent, token: &CancellationToken) -> Result<()> {
        bounded(
            token,
            self.deadline(),
            "confirm event",
            self.store.confirm_event(&event.id),
        )
        .await
    }

    async fn fail(&self, event: &FailedEvent, token: &CancellationToken) -> Result<()> {
        bounded(
            token,
            self.deadline(),
            "unreserve event",
            self.store.unreserve_event(&event.id),
        )
        .await
    }
}

async fn poll<S: ReservationStore, P: Producer>(
    shared: Arc<Shared<S, P>>,
    token: CancellationToken,
    tracker: TaskTracker,
) {
    let mut ticker = interval(shared.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!("event processing stopped");
                return;
            }
            _ = ticker.tick() => {
                if shared
                    .in_process
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    debug!("skip tick, previous cycle still running");
                    continue;
                }

                let shared = shared.clone();
                let token = token.clone();
                tracker.spawn(async move {
                    let _in_process = InProcess(&shared.in_process);
                    shared.process(&token).await;
                });
            }
        }
    }
}

async fn monitor_successes<S: ReservationStore, P: Producer>(
    shared: Arc<Shared<S, P>>,
    successes: OutcomeStream<DeliveredEvent>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("monitoring [successes] stopped: cancelled");
                return;
            }
            event = successes.recv() => {
                let Some(event) = event else {
                    info!("monitoring [successes] stopped: channel closed");
                    return;
                };

                // Not retried: the event stays reserved and is redelivered once the reservation lapses.
                match shared.confirm(&event, &token).await {
                    Ok(()) => info!(event_id = %event.id, event_type = %event.event_type, "event delivered"),
                    Err(e) => error!(
                        event_id = %event.id,
                        error = %e,
                        "error when confirming event, but event was delivered"
                    ),
                }
            }
        }
    }
}

async fn monitor_errors<S: ReservationStore, P: Producer>(
    shared: Arc<Shared<S, P>>,
    errors: OutcomeStream<FailedEvent>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("monitoring [errors] stopped: cancelled");
                return;
            }
            event = errors.recv() => {
                let Some(event) = event else {
                    info!("monitoring [errors] stopped: channel closed");
                    return;
                };

                error!(event_id = %event.id, event_type = %event.event_type, error = %event.error, "event send failed");

                if let Err(e) = shared.fail(&event, &token).await {
                    error!(event_id = %event.id, error = %e, "error when unreserving failed event");
                }
            }
        }
    }
}
