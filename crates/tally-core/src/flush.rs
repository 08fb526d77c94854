//! Delivery of queued events.
//!
//! A flush pass reads the deliverable records oldest first and, for each one,
//! claims it with [`EventStore::mark_in_flight`], hands it to the
//! [`Transport`] and records the outcome:
//!
//! - success: `mark_sent`, then `delete`
//! - retryable failure: `mark_failed` with an exponential backoff; once the
//!   record has failed `max_retries` times it is dropped
//! - permanent failure: `mark_failed`, then dropped
//!
//! A record another pass already claimed is skipped. One record's failure
//! never stops attempts on the rest.
//!
//! Every pass starts by removing `sent` records an earlier pass could not
//! delete. If the store refuses to record a successful send, the record is
//! handed back as `failed` so it is retried; duplicates are preferred to
//! loss. If recording a failure fails too, the record stays `in_flight`
//! until the store releases it (the SQLite store does so when reopened).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::retry::RetryPolicy;
use crate::store::{EventStore, StoreError};
use crate::transport::Transport;
use crate::types::EventId;

/// Summary of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    /// Failed this time, will be retried after backoff.
    pub retried: usize,
    /// Permanently rejected or out of retries; removed from the store.
    pub dropped: usize,
    /// Claimed by a concurrent pass, or gone before it could be claimed.
    pub skipped: usize,
    /// Storage errors while recording an outcome.
    pub errors: usize,
}

impl FlushReport {
    pub const fn attempted(&self) -> usize {
        self.sent + self.retried + self.dropped
    }

    pub const fn is_empty(&self) -> bool {
        self.attempted() == 0 && self.skipped == 0 && self.errors == 0
    }

    fn record(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Sent => self.sent += 1,
            Delivery::Retried => self.retried += 1,
            Delivery::Dropped => self.dropped += 1,
            Delivery::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    Retried,
    Dropped,
    Skipped,
}

struct PeriodicFlush {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct FlushShared {
    store: Arc<dyn EventStore>,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    periodic: Mutex<Option<PeriodicFlush>>,
    deliveries: Mutex<JoinSet<()>>,
}

/// Decides when queued events are sent and records each outcome.
///
/// Cheap to clone; clones share the same timer and background deliveries.
#[derive(Clone)]
pub struct FlushController {
    shared: Arc<FlushShared>,
}

impl std::fmt::Debug for FlushController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushController")
            .field("retry", &self.shared.retry)
            .field("periodic", &self.is_periodic_running())
            .finish_non_exhaustive()
    }
}

impl FlushController {
    pub fn new(
        store: Arc<dyn EventStore>,
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(FlushShared {
                store,
                transport,
                retry,
                periodic: Mutex::new(None),
                deliveries: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Attempts delivery of every deliverable record.
    ///
    /// Fails only if the candidate list cannot be read; per-record problems
    /// are logged and counted in the report.
    pub async fn flush(&self) -> Result<FlushReport, StoreError> {
        self.flush_at(Utc::now()).await
    }

    pub async fn flush_at(&self, now: DateTime<Utc>) -> Result<FlushReport, StoreError> {
        match self.shared.store.delete_sent() {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "removed sent events left by an earlier pass"),
            Err(err) => warn!(error = %err, "failed to remove sent events"),
        }

        let candidates = self.shared.store.query_deliverable(now)?;
        let mut report = FlushReport::default();
        for record in candidates {
            match self.deliver(&record.id, now).await {
                Ok(delivery) => report.record(delivery),
                Err(err) => {
                    error!(event_id = %record.id, error = %err, "failed to record delivery outcome");
                    report.errors += 1;
                }
            }
        }
        if !report.is_empty() {
            debug!(
                sent = report.sent,
                retried = report.retried,
                dropped = report.dropped,
                skipped = report.skipped,
                "flush pass finished"
            );
        }
        Ok(report)
    }

    async fn deliver(&self, id: &EventId, now: DateTime<Utc>) -> Result<Delivery, StoreError> {
        let store = &self.shared.store;
        let record = match store.mark_in_flight(id) {
            Ok(record) => record,
            Err(StoreError::Conflict { status, .. }) => {
                debug!(event_id = %id, %status, "event already claimed, skipping");
                return Ok(Delivery::Skipped);
            }
            Err(StoreError::NotFound(_)) => return Ok(Delivery::Skipped),
            Err(err) => return Err(err),
        };

        let err = match self.shared.transport.send(&record).await {
            Ok(()) => {
                if let Err(err) = store.mark_sent(id) {
                    self.release(id, now, &err);
                    return Err(err);
                }
                match store.delete(id) {
                    Ok(()) | Err(StoreError::NotFound(_)) => {}
                    Err(err) => {
                        warn!(event_id = %id, error = %err, "sent event not deleted, next pass removes it");
                    }
                }
                debug!(event_id = %id, event_type = %record.event_type, "event sent");
                return Ok(Delivery::Sent);
            }
            Err(err) => err,
        };

        let retry = &self.shared.retry;
        let retry_at = retry.retry_at(now, record.attempts + 1);
        let attempts = store.mark_failed(id, &err.to_string(), retry_at)?;

        if err.is_permanent() {
            warn!(
                event_id = %id,
                event_type = %record.event_type,
                error = %err,
                "collector rejected event, dropping it"
            );
            store.delete(id)?;
            Ok(Delivery::Dropped)
        } else if retry.is_exhausted(attempts) {
            warn!(
                event_id = %id,
                event_type = %record.event_type,
                attempts,
                error = %err,
                "event exhausted its retries, dropping it"
            );
            store.delete(id)?;
            Ok(Delivery::Dropped)
        } else {
            debug!(event_id = %id, attempts, %retry_at, error = %err, "delivery failed, will retry");
            Ok(Delivery::Retried)
        }
    }

    /// Hands a claimed record back as `failed`, due at `now`, after its
    /// outcome could not be recorded.
    fn release(&self, id: &EventId, now: DateTime<Utc>, cause: &StoreError) {
        let reason = format!("delivery outcome not recorded: {cause}");
        if let Err(err) = self.shared.store.mark_failed(id, &reason, now) {
            error!(event_id = %id, error = %err, "event left in flight");
        }
    }

    /// Starts delivering `id` in the background right away.
    ///
    /// Without a running Tokio runtime nothing is scheduled and the record
    /// waits for the next flush.
    pub fn deliver_in_background(&self, id: EventId) {
        let Ok(handle) = Handle::try_current() else {
            debug!(event_id = %id, "no async runtime, leaving event for next flush");
            return;
        };
        let this = self.clone();
        let mut deliveries = self.shared.deliveries.lock();
        while deliveries.try_join_next().is_some() {}
        deliveries.spawn_on(
            async move {
                match this.deliver(&id, Utc::now()).await {
                    Ok(delivery) => debug!(event_id = %id, ?delivery, "immediate delivery finished"),
                    Err(err) => {
                        error!(event_id = %id, error = %err, "failed to record delivery outcome");
                    }
                }
            },
            &handle,
        );
    }

    /// Waits for every background delivery started so far.
    pub async fn wait_idle(&self) {
        let mut deliveries = std::mem::take(&mut *self.shared.deliveries.lock());
        while let Some(result) = deliveries.join_next().await {
            if let Err(err) = result {
                warn!(error = %err, "background delivery task failed");
            }
        }
    }

    /// Starts flushing every `period` on a background timer.
    ///
    /// Returns `false` if a timer is already running, the period is zero, or
    /// no Tokio runtime is available.
    pub fn start_periodic(&self, period: Duration) -> bool {
        if period.is_zero() {
            warn!("periodic flush needs a non-zero period");
            return false;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!("periodic flush needs a running async runtime");
            return false;
        };
        let mut periodic = self.shared.periodic.lock();
        if periodic.is_some() {
            return false;
        }

        let (stop, mut stopped) = watch::channel(false);
        let this = self.clone();
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => match this.flush().await {
                        Ok(report) if !report.is_empty() => info!(
                            sent = report.sent,
                            retried = report.retried,
                            dropped = report.dropped,
                            "periodic flush"
                        ),
                        Ok(_) => {}
                        Err(err) => error!(error = %err, "periodic flush failed"),
                    },
                    _ = stopped.changed() => break,
                }
            }
        });

        info!(period_ms = period.as_millis(), "started periodic flush");
        *periodic = Some(PeriodicFlush { stop, task });
        true
    }

    /// Stops the periodic timer. A flush pass already running completes
    /// before this returns.
    pub async fn stop_periodic(&self) {
        let Some(periodic) = self.shared.periodic.lock().take() else {
            return;
        };
        // The receiver only disappears if the task already ended.
        let _ = periodic.stop.send(true);
        if let Err(err) = periodic.task.await {
            warn!(error = %err, "periodic flush task failed");
        }
        info!("stopped periodic flush");
    }

    pub fn is_periodic_running(&self) -> bool {
        self.shared.periodic.lock().is_some()
    }
}
