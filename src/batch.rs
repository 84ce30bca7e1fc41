use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};

use crate::address::{normalize, StructuredAddress};
use crate::errors::{AppError, AppResult};
use crate::geocoder::{GeocodeResult, GeocodingClient};
use crate::records::{ConsumerRecord, CoordinateStore, NOT_FOUND_SENTINEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub cancelled: bool,
    pub failed_addresses: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchReport {
    fn start(total: usize) -> Self {
        let now = Utc::now();
        Self {
            total,
            processed: 0,
            skipped: 0,
            resolved: 0,
            unresolved: 0,
            cancelled: false,
            failed_addresses: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }
}

pub trait BatchObserver: Send + Sync {
    fn on_progress(&self, progress: BatchProgress);

    fn on_batch_complete(&self, _failed_addresses: &[String]) {}
}

impl<F> BatchObserver for F
where
    F: Fn(BatchProgress) + Send + Sync,
{
    fn on_progress(&self, progress: BatchProgress) {
        self(progress)
    }
}

/// Enforces a fixed minimum gap between consecutive provider calls.
struct RateLimiter {
    min_interval: Duration,
    last_tick: Option<Instant>,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_tick: None,
        }
    }

    async fn wait(&mut self) {
        if let Some(prev) = self.last_tick {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        self.last_tick = Some(Instant::now());
    }
}

struct DispatchRequest {
    address: StructuredAddress,
    reply: oneshot::Sender<GeocodeResult>,
}

/// Handle to the single geocoding worker.
///
/// Every resolution from every holder of the handle goes through one task that
/// waits out the rate limit before each call, so exactly one provider request
/// is in flight at a time. The worker stops once all handles are dropped.
#[derive(Clone)]
pub struct GeocodeDispatcher {
    sender: mpsc::Sender<DispatchRequest>,
}

impl GeocodeDispatcher {
    pub fn spawn(client: GeocodingClient, min_interval: Duration) -> Self {
        let (sender, mut receiver) = mpsc::channel::<DispatchRequest>(1);
        tokio::spawn(async move {
            let mut limiter = RateLimiter::new(min_interval);
            while let Some(request) = receiver.recv().await {
                limiter.wait().await;
                let result = client.resolve(&request.address).await;
                if request.reply.send(result).is_err() {
                    debug!(target: "geocode_dispatcher", "caller dropped before result was delivered");
                }
            }
            debug!(target: "geocode_dispatcher", "dispatcher stopped");
        });
        Self { sender }
    }

    pub async fn resolve(&self, address: StructuredAddress) -> AppResult<GeocodeResult> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(DispatchRequest { address, reply })
            .await
            .map_err(|_| AppError::Provider("geocode dispatcher is not running".into()))?;
        response
            .await
            .map_err(|_| AppError::Provider("geocode dispatcher dropped the request".into()))
    }
}

enum ItemOutcome {
    Found,
    NotFound,
}

/// Sequential, at-most-once geocoding over a worklist.
///
/// Does not guard against two overlapping runs over the same records; callers
/// serialize runs per worklist.
pub struct BatchGeocodingOrchestrator {
    dispatcher: GeocodeDispatcher,
    store: Arc<dyn CoordinateStore>,
}

impl BatchGeocodingOrchestrator {
    pub fn new(dispatcher: GeocodeDispatcher, store: Arc<dyn CoordinateStore>) -> Self {
        Self { dispatcher, store }
    }

    pub async fn run(
        &self,
        items: &[ConsumerRecord],
        observer: Option<Arc<dyn BatchObserver>>,
        cancel_flag: Option<Arc<AtomicBool>>,
    ) -> BatchReport {
        let total = items.len();
        let mut report = BatchReport::start(total);
        let mut seen_failures = HashSet::new();
        info!(target: "batch_geocoding", total, "batch geocoding started");

        for (index, item) in items.iter().enumerate() {
            if let Some(flag) = &cancel_flag {
                if flag.load(Ordering::SeqCst) {
                    report.cancelled = true;
                    info!(
                        target: "batch_geocoding",
                        completed = index,
                        total,
                        "batch geocoding cancelled"
                    );
                    break;
                }
            }

            if item.coordinates.is_attempted() {
                trace!(target: "batch_geocoding", id = item.id, "already attempted; skipping");
                report.skipped += 1;
            } else {
                report.processed += 1;
                match self.process(item).await {
                    ItemOutcome::Found => report.resolved += 1,
                    ItemOutcome::NotFound => {
                        report.unresolved += 1;
                        if seen_failures.insert(item.raw_address.clone()) {
                            report.failed_addresses.push(item.raw_address.clone());
                        }
                    }
                }
            }

            if let Some(observer) = &observer {
                observer.on_progress(BatchProgress {
                    completed: index + 1,
                    total,
                });
            }
        }

        report.finished_at = Utc::now();
        info!(
            target: "batch_geocoding",
            total,
            processed = report.processed,
            skipped = report.skipped,
            resolved = report.resolved,
            unresolved = report.unresolved,
            cancelled = report.cancelled,
            "batch geocoding finished"
        );
        if let Some(observer) = &observer {
            observer.on_batch_complete(&report.failed_addresses);
        }
        report
    }

    async fn process(&self, item: &ConsumerRecord) -> ItemOutcome {
        let address = normalize(&item.raw_address);
        let result = match self.dispatcher.resolve(address).await {
            Ok(result) => result,
            Err(err) => {
                warn!(target: "batch_geocoding", id = item.id, ?err, "resolution unavailable");
                GeocodeResult::not_found()
            }
        };

        let located = result.found && (result.latitude, result.longitude) != NOT_FOUND_SENTINEL;
        if located {
            match self
                .store
                .update_coordinates(item.id, result.latitude, result.longitude)
            {
                Ok(()) => {
                    debug!(
                        target: "batch_geocoding",
                        id = item.id,
                        precision = ?result.precision,
                        "record geocoded"
                    );
                    return ItemOutcome::Found;
                }
                Err(err) => {
                    warn!(
                        target: "batch_geocoding",
                        id = item.id,
                        ?err,
                        "failed to persist coordinates; recording as not found"
                    );
                }
            }
        }

        if let Err(err) =
            self.store
                .update_coordinates(item.id, NOT_FOUND_SENTINEL.0, NOT_FOUND_SENTINEL.1)
        {
            warn!(target: "batch_geocoding", id = item.id, ?err, "failed to persist not-found marker");
        }
        ItemOutcome::NotFound
    }
}
