//! Offloaded wallet credits
//!
//! Approved credit purchases are persisted as [`CreditJob`] rows and their ids
//! pushed onto a tokio channel drained by a small worker pool. The row is the
//! durable part: queued jobs left over from a previous run are pushed again at
//! startup by [`JobQueue::requeue_pending`].
//!
//! Each attempt runs in its own write transaction and re-checks whether the
//! payment was already applied, so racing webhook deliveries collapse into a
//! single credit. Retryable failures are retried after a fixed delay until
//! the attempt budget is spent, then the job is left FAILED for an operator.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redb::{Database, ReadableTable};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::accounts;
use crate::database::{
    self, atomic, id_key, load, load_all, snapshot, store, TABLE_JOBS, TABLE_JOB_PAYMENTS,
};
use crate::error::{JobError, LedgerError, StoreError};
use crate::ledger;
use crate::model::{CreditJob, JobId, JobStatus, UserId};

const JOB_COUNTER: &str = "credit_jobs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(10),
        }
    }
}

/// A credit the provider has confirmed as paid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditRequest {
    pub payment_id: String,
    pub user_id: UserId,
    pub amount: u64,
}

/// Result of one successful attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The wallet was credited
    Completed,
    /// The payment had been applied before; nothing was written to the ledger
    Skipped,
    /// The job was no longer queued
    Unchanged,
}

/// Producer side of the credit job channel.
#[derive(Debug, Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<JobId>,
}

impl JobQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<JobId>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Persists a credit job for the payment and hands it to the workers.
    ///
    /// One job exists per payment id. Enqueuing a payment again returns the
    /// existing job; a FAILED job is revived with a fresh attempt budget.
    pub async fn enqueue_credit(
        &self,
        db: &Database,
        request: CreditRequest,
    ) -> Result<CreditJob, JobError> {
        let (job, dispatch) = atomic(db, |txn| {
            let now = Utc::now();
            let existing_key = {
                let payments = txn.open_table(TABLE_JOB_PAYMENTS)?;
                let key = payments
                    .get(request.payment_id.as_str())?
                    .map(|guard| guard.value().to_string());
                key
            };

            let mut jobs = txn.open_table(TABLE_JOBS)?;
            if let Some(key) = existing_key {
                let mut job: CreditJob = load(&jobs, &key)?.ok_or_else(|| {
                    JobError::NotFound(database::parse_id(&key).unwrap_or_default())
                })?;
                if job.status != JobStatus::Failed {
                    return Ok::<_, JobError>((job, false));
                }
                job.status = JobStatus::Queued;
                job.attempts = 0;
                job.last_error = None;
                job.updated_at = now;
                store(&mut jobs, &key, &job)?;
                return Ok((job, true));
            }
            drop(jobs);

            let job = CreditJob {
                id: database::next_value(txn, JOB_COUNTER)?,
                payment_id: request.payment_id.clone(),
                user_id: request.user_id,
                amount: request.amount,
                attempts: 0,
                status: JobStatus::Queued,
                last_error: None,
                created_at: now,
                updated_at: now,
            };
            let key = id_key(job.id);
            store(&mut txn.open_table(TABLE_JOBS)?, &key, &job)?;
            txn.open_table(TABLE_JOB_PAYMENTS)?
                .insert(job.payment_id.as_str(), key.as_str())?;
            Ok((job, true))
        })?;

        if dispatch {
            self.sender
                .send(job.id)
                .await
                .map_err(|_| JobError::QueueClosed)?;
            info!(
                job_id = %job.id,
                payment_id = %job.payment_id,
                user_id = %job.user_id,
                amount = %job.amount,
                "credit job queued"
            );
        }
        Ok(job)
    }

    /// Pushes every QUEUED job again. Returns how many were pushed.
    pub async fn requeue_pending(&self, db: &Database) -> Result<usize, JobError> {
        let pending: Vec<CreditJob> = snapshot(db, |txn| {
            let table = txn.open_table(TABLE_JOBS)?;
            load_all::<CreditJob>(&table)
        })?
        .into_iter()
        .filter(|job| job.status == JobStatus::Queued)
        .collect();

        for job in &pending {
            self.sender
                .send(job.id)
                .await
                .map_err(|_| JobError::QueueClosed)?;
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "queued credit jobs resumed");
        }
        Ok(pending.len())
    }
}

pub fn get_job(db: &Database, job_id: JobId) -> Result<Option<CreditJob>, StoreError> {
    snapshot(db, |txn| {
        let table = txn.open_table(TABLE_JOBS)?;
        load(&table, &id_key(job_id))
    })
}

pub fn job_for_payment(db: &Database, payment_id: &str) -> Result<Option<CreditJob>, StoreError> {
    snapshot(db, |txn| {
        let payments = txn.open_table(TABLE_JOB_PAYMENTS)?;
        let Some(key) = payments.get(payment_id)?.map(|guard| guard.value().to_string()) else {
            return Ok(None);
        };
        let jobs = txn.open_table(TABLE_JOBS)?;
        load(&jobs, &key)
    })
}

/// One attempt at applying a credit job.
pub fn process_credit_job(db: &Database, job_id: JobId) -> Result<JobOutcome, JobError> {
    atomic(db, |txn| {
        let key = id_key(job_id);
        let mut job: CreditJob = {
            let jobs = txn.open_table(TABLE_JOBS)?;
            load(&jobs, &key)?.ok_or(JobError::NotFound(job_id))?
        };
        if job.status != JobStatus::Queued {
            return Ok(JobOutcome::Unchanged);
        }

        job.attempts += 1;
        job.updated_at = Utc::now();

        let outcome = if ledger::reference_recorded_in(txn, &job.payment_id)? {
            JobOutcome::Skipped
        } else {
            if !accounts::user_exists(txn, job.user_id)? {
                return Err(JobError::UserNotFound(job.user_id));
            }
            ledger::open_wallet(txn, job.user_id)?;

            let source = format!("Mercado Pago credit: {}", job.amount);
            match ledger::credit(txn, job.user_id, job.amount, &source, Some(&job.payment_id)) {
                Ok(_) => JobOutcome::Completed,
                Err(LedgerError::DuplicateReference(_)) => JobOutcome::Skipped,
                Err(e) => return Err(e.into()),
            }
        };

        job.status = match outcome {
            JobOutcome::Skipped => JobStatus::Skipped,
            _ => JobStatus::Completed,
        };
        store(&mut txn.open_table(TABLE_JOBS)?, &key, &job)?;
        Ok(outcome)
    })
}

/// Records a failed attempt. Returns the updated job.
fn record_failure(
    db: &Database,
    job_id: JobId,
    err: &JobError,
    policy: RetryPolicy,
) -> Result<CreditJob, JobError> {
    atomic(db, |txn| {
        let key = id_key(job_id);
        let mut jobs = txn.open_table(TABLE_JOBS)?;
        let mut job: CreditJob = load(&jobs, &key)?.ok_or(JobError::NotFound(job_id))?;

        job.attempts += 1;
        job.last_error = Some(err.to_string());
        job.updated_at = Utc::now();
        if !err.is_retryable() || job.attempts >= policy.max_attempts {
            job.status = JobStatus::Failed;
        }
        store(&mut jobs, &key, &job)?;
        Ok(job)
    })
}

/// Runs a job to completion, retrying retryable failures per `policy`.
pub async fn run_job(
    db: Arc<Database>,
    job_id: JobId,
    policy: RetryPolicy,
) -> Result<JobOutcome, JobError> {
    loop {
        let worker_db = Arc::clone(&db);
        let result = tokio::task::spawn_blocking(move || process_credit_job(&worker_db, job_id))
            .await
            .map_err(|e| JobError::Worker(e.to_string()))
            .and_then(|result| result);

        let err = match result {
            Ok(outcome) => {
                info!(job_id = %job_id, outcome = ?outcome, "credit job finished");
                return Ok(outcome);
            }
            Err(JobError::NotFound(id)) => return Err(JobError::NotFound(id)),
            Err(err) => err,
        };

        let job = record_failure(&db, job_id, &err, policy)?;
        if job.status == JobStatus::Failed {
            error!(
                job_id = %job_id,
                payment_id = %job.payment_id,
                attempts = job.attempts,
                error = %err,
                "credit job failed"
            );
            return Err(err);
        }

        warn!(
            job_id = %job_id,
            attempts = job.attempts,
            error = %err,
            "credit job attempt failed, retrying"
        );
        tokio::time::sleep(policy.delay).await;
    }
}

/// Starts `count` workers draining `receiver`.
///
/// Workers stop once every [`JobQueue`] handle has been dropped and the
/// channel is empty.
pub fn spawn_workers(
    db: Arc<Database>,
    receiver: mpsc::Receiver<JobId>,
    policy: RetryPolicy,
    count: usize,
) -> Vec<JoinHandle<()>> {
    let receiver = Arc::new(Mutex::new(receiver));

    (0..count.max(1))
        .map(|worker| {
            let receiver = Arc::clone(&receiver);
            let db = Arc::clone(&db);
            tokio::spawn(async move {
                loop {
                    let next = receiver.lock().await.recv().await;
                    let Some(job_id) = next else {
                        break;
                    };
                    // Failures are already recorded on the job row
                    let _ = run_job(Arc::clone(&db), job_id, policy).await;
                }
                info!(worker = worker, "credit worker stopped");
            })
        })
        .collect()
}
