use chrono::Utc;
use dashmap::DashSet;
use dicomgate_adapters::HealthMonitor;
use dicomgate_types::RetryTask;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::WorkItem;

/// Persistent retry queue driver.
///
/// Holds (study, destination) tasks ordered by deadline; the authoritative
/// attempt counters live in each study's destination-status sidecar, from
/// which the startup scan rebuilds this queue. When a task comes due the
/// manager consults the health monitor: an unavailable destination is
/// re-enqueued one backoff step later, an available one is posted onto the
/// scheduler's work channel — message passing, never a direct call, so the
/// two components stay acyclic.
pub struct RetryManager {
    tasks: Mutex<BinaryHeap<RetryTask>>,
    queued: DashSet<(String, String)>,
    /// (study, destination) pairs with an attempt in flight; shared with
    /// the scheduler to keep attempts exclusive
    in_flight: Arc<DashSet<(String, String)>>,
    health: Arc<HealthMonitor>,
    work_tx: mpsc::Sender<WorkItem>,
    /// Deferral step applied when the destination is still unavailable
    unavailable_delay: Duration,
    tick: Duration,
}

impl RetryManager {
    pub fn new(
        health: Arc<HealthMonitor>,
        work_tx: mpsc::Sender<WorkItem>,
        in_flight: Arc<DashSet<(String, String)>>,
        unavailable_delay: Duration,
    ) -> Self {
        Self {
            tasks: Mutex::new(BinaryHeap::new()),
            queued: DashSet::new(),
            in_flight,
            health,
            work_tx,
            unavailable_delay,
            tick: Duration::from_secs(1),
        }
    }

    /// Enqueue a retry task. Duplicates of an already-queued or in-flight
    /// (study, destination) pair are dropped, preserving the
    /// single-attempt invariant.
    pub async fn enqueue(&self, task: RetryTask) {
        let key = task.key();
        if self.in_flight.contains(&key) || !self.queued.insert(key) {
            debug!(
                study = %task.study_uid,
                destination = %task.destination,
                "retry already queued or in flight"
            );
            return;
        }
        debug!(
            study = %task.study_uid,
            destination = %task.destination,
            next_retry_at = %task.next_retry_at,
            "retry scheduled"
        );
        self.tasks.lock().await.push(task);
    }

    pub async fn queue_len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// One dequeue pass: dispatch every due task whose destination is
    /// available, defer the rest. Returns the number dispatched.
    pub async fn drain_due(&self) -> usize {
        let now = Utc::now();
        let mut due = Vec::new();
        {
            let mut tasks = self.tasks.lock().await;
            while tasks.peek().map(|t| t.is_due(now)).unwrap_or(false) {
                due.push(tasks.pop().expect("peeked above"));
            }
        }

        let mut dispatched = 0;
        for task in due {
            if !self.health.is_available(&task.destination) {
                debug!(
                    destination = %task.destination,
                    study = %task.study_uid,
                    "destination still unavailable, deferring retry"
                );
                let deferred = RetryTask {
                    next_retry_at: Utc::now()
                        + chrono::Duration::from_std(self.unavailable_delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(30)),
                    ..task
                };
                self.tasks.lock().await.push(deferred);
                continue;
            }
            self.queued.remove(&task.key());
            if self
                .work_tx
                .send(WorkItem::SendOne {
                    ae_title: task.ae_title.clone(),
                    study_uid: task.study_uid.clone(),
                    destination: task.destination.clone(),
                })
                .await
                .is_ok()
            {
                dispatched += 1;
            }
        }
        dispatched
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("retry manager started");
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.drain_due().await;
                }
                _ = cancel.cancelled() => break,
            }
        }
        info!("retry manager stopped");
    }
}
