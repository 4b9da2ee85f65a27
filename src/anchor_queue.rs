// src/anchor_queue.rs
// Anchor job queue and the worker pool that drains it.
// One commit per agreement at a time: a worker holds the agreement lock for the
// whole commit + status update, so resubmits and stale retries cannot interleave.

use crate::agreement::{AgreementMachine, AgreementStatus};
use crate::anchor_service::LedgerAnchoringService;
use crate::config_manager::{AnchoringConfig, LedgerConfig};
use crate::error::{CoreError, LedgerError, Result};
use crate::payload::CanonicalPayload;
use crate::simple_metrics::METRICS;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct AnchorJob {
    pub agreement_id: String,
    pub payload: CanonicalPayload,
    /// Commit attempts already made for this job.
    pub attempt: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl AnchorJob {
    pub fn new(agreement_id: &str, payload: CanonicalPayload) -> Self {
        Self {
            agreement_id: agreement_id.to_string(),
            payload,
            attempt: 0,
            next_retry_at: None,
        }
    }
}

pub type AnchorReceiver = mpsc::Receiver<AnchorJob>;

/// Sending half of the job queue. Cheap to clone.
#[derive(Clone)]
pub struct AnchorQueue {
    tx: mpsc::Sender<AnchorJob>,
}

impl AnchorQueue {
    pub fn channel(capacity: usize) -> (Self, AnchorReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub async fn enqueue(&self, job: AnchorJob) -> Result<()> {
        debug!("Queueing anchor job for {} (attempt {})", job.agreement_id, job.attempt + 1);
        self.tx.send(job).await.map_err(|_| CoreError::QueueClosed)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound for a single commit call.
    pub commit_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(anchoring: &AnchoringConfig, ledger: &LedgerConfig) -> Self {
        Self {
            max_attempts: anchoring.max_attempts.max(1),
            base_delay: Duration::from_millis(anchoring.base_delay_ms),
            max_delay: Duration::from_millis(anchoring.max_delay_ms),
            commit_timeout: ledger.timeout(),
        }
    }

    /// Wait before the retry that follows failed attempt number `attempt` (1-based):
    /// base * 2^(attempt-1), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut schedule = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base_delay)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(self.max_delay)
            .with_max_elapsed_time(None)
            .build();

        let mut delay = self.base_delay.min(self.max_delay);
        for _ in 0..attempt.max(1) {
            delay = schedule.next_backoff().unwrap_or(self.max_delay);
        }
        delay.min(self.max_delay)
    }
}

/// Timeouts, network errors and storage hiccups are retried; everything else is final.
pub fn is_retryable(err: &CoreError) -> bool {
    match err {
        CoreError::Ledger(e) => e.is_retryable(),
        CoreError::Storage(_) => true,
        _ => false,
    }
}

pub struct AnchorCoordinator {
    machine: AgreementMachine,
    service: LedgerAnchoringService,
    queue: AnchorQueue,
    policy: RetryPolicy,
}

impl AnchorCoordinator {
    pub fn new(
        machine: AgreementMachine,
        service: LedgerAnchoringService,
        queue: AnchorQueue,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            machine,
            service,
            queue,
            policy,
        }
    }

    /// Rebuild jobs for agreements left in `anchoring` by a previous process.
    pub async fn recover(&self) -> Result<usize> {
        let stuck = self.machine.in_status(AgreementStatus::Anchoring)?;
        let mut requeued = 0;

        for agreement in stuck {
            match agreement.canonical_payload() {
                Ok(payload) => {
                    self.queue.enqueue(AnchorJob::new(&agreement.id, payload)).await?;
                    requeued += 1;
                }
                Err(e) => {
                    error!(
                        "Agreement {} stuck in anchoring with unusable data: {}",
                        agreement.id, e
                    );
                    self.machine.mark_anchor_failed(&agreement.id, &e.to_string()).await?;
                }
            }
        }

        if requeued > 0 {
            info!("Recovery sweep re-queued {} anchoring agreement(s)", requeued);
        }
        Ok(requeued)
    }

    /// Start `workers` tasks sharing one receiver.
    pub fn spawn_workers(self: &Arc<Self>, rx: AnchorReceiver, workers: usize) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(rx));
        let workers = workers.max(1);
        info!(
            "Starting anchor worker pool ({} workers, max {} attempts, ledger mode {})",
            workers,
            self.policy.max_attempts,
            self.service.get_mode()
        );

        (0..workers)
            .map(|worker_id| {
                let this = Arc::clone(self);
                let rx = Arc::clone(&rx);
                tokio::spawn(async move { this.worker_loop(worker_id, rx).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker_id: usize, rx: Arc<Mutex<AnchorReceiver>>) {
        loop {
            let job = {
                let mut rx = rx.lock().await;
                match rx.recv().await {
                    Some(job) => job,
                    None => {
                        info!("Anchor worker {} shutting down (queue closed)", worker_id);
                        return;
                    }
                }
            };
            self.process(worker_id, job).await;
        }
    }

    /// Run one commit attempt for `job` and settle or re-queue it.
    pub async fn process(&self, worker_id: usize, mut job: AnchorJob) {
        let guard = self.machine.lock(&job.agreement_id).await;

        match self.machine.get(&job.agreement_id) {
            Ok(a) if a.status == AgreementStatus::Anchoring => {}
            Ok(a) => {
                debug!(
                    "Worker {} dropping job for {}: status is {}",
                    worker_id, job.agreement_id, a.status
                );
                return;
            }
            Err(e) => {
                error!("Worker {} cannot load agreement {}: {}", worker_id, job.agreement_id, e);
                return;
            }
        }

        job.attempt += 1;
        METRICS.inc_commit_attempts();
        debug!(
            "Worker {} committing {} (attempt {}/{})",
            worker_id, job.agreement_id, job.attempt, self.policy.max_attempts
        );

        let outcome = match tokio::time::timeout(
            self.policy.commit_timeout,
            self.service.commit(&job.agreement_id, &job.payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CoreError::Ledger(LedgerError::Timeout(
                self.policy.commit_timeout.as_millis() as u64,
            ))),
        };

        let err = match outcome {
            Ok(receipt) => match self.machine.mark_anchored_locked(&guard, &receipt) {
                Ok(_) => {
                    METRICS.inc_anchors_committed();
                    return;
                }
                Err(e) => e,
            },
            Err(e) => {
                METRICS.inc_commit_failures();
                e
            }
        };

        if is_retryable(&err) && job.attempt < self.policy.max_attempts {
            let delay = self.policy.delay_for(job.attempt);
            warn!(
                "Anchoring {} failed (attempt {}/{}): {} - retrying in {}ms",
                job.agreement_id,
                job.attempt,
                self.policy.max_attempts,
                err,
                delay.as_millis()
            );
            drop(guard);
            job.next_retry_at = chrono::Duration::from_std(delay)
                .ok()
                .map(|d| Utc::now() + d);
            self.schedule_retry(job, delay);
            return;
        }

        error!(
            "Anchoring {} failed permanently after {} attempt(s): {}",
            job.agreement_id, job.attempt, err
        );
        match self.machine.mark_anchor_failed_locked(&guard, &err.to_string()) {
            Ok(_) => METRICS.inc_anchors_failed(),
            Err(e) => error!("Could not record failure for {}: {}", job.agreement_id, e),
        }
    }

    fn schedule_retry(&self, job: AnchorJob, delay: Duration) {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let id = job.agreement_id.clone();
            if let Err(e) = queue.enqueue(job).await {
                // left in `anchoring`; the next startup sweep picks it up
                warn!("Could not re-queue {}: {}", id, e);
            }
        });
    }
}
