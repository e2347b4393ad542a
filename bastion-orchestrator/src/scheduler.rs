//! Delayed, prioritized background jobs with bounded retries
//!
//! Jobs are enqueued to run no earlier than `now + delay` on one of three
//! queues. Workers always drain `High` before `Security` before `Default`.
//! A failed attempt is retried only for transport errors, only while tries
//! remain, and only if the next slot falls inside the job's retry window
//! (measured from its first attempt). Everything else ends the job and, for
//! real failures, runs its `failed` hook exactly once.
//!
//! Only `tokio::time` is used, so a paused test clock drives the whole
//! schedule.

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SecurityError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Queue {
    /// Fast path for servers that just became reachable
    High,
    Security,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub tries: u32,
    /// Delay after the n-th failed attempt; the last entry repeats
    pub backoff: Vec<Duration>,
    /// No attempt starts later than this after the first one
    pub retry_window: Option<Duration>,
}

impl RetryPolicy {
    pub fn single_attempt() -> Self {
        Self {
            tries: 1,
            backoff: Vec::new(),
            retry_window: None,
        }
    }

    pub fn from_seconds(tries: u32, backoff: &[u64], retry_window: Option<u64>) -> Self {
        Self {
            tries: tries.max(1),
            backoff: backoff.iter().copied().map(Duration::from_secs).collect(),
            retry_window: retry_window.map(Duration::from_secs),
        }
    }

    /// Delay before the attempt that follows `failed_attempt` (1-based)
    pub fn backoff_after(&self, failed_attempt: u32) -> Duration {
        let index = failed_attempt.saturating_sub(1) as usize;
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or_default()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::single_attempt()
    }
}

/// Unit of background work
#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> String;

    /// Run one attempt. `attempt` starts at 1.
    async fn handle(&self, attempt: u32) -> Result<()>;

    /// Called once when the job ends without succeeding
    async fn failed(&self, _error: &SecurityError) {}
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub queue: Queue,
    pub delay: Duration,
    pub retry: RetryPolicy,
}

impl JobOptions {
    pub fn on(queue: Queue) -> Self {
        Self {
            queue,
            delay: Duration::ZERO,
            retry: RetryPolicy::single_attempt(),
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

struct Envelope {
    job: Arc<dyn Job>,
    queue: Queue,
    retry: RetryPolicy,
    attempts: u32,
    deadline: Option<Instant>,
}

struct SchedulerInner {
    high: Sender<Envelope>,
    security: Sender<Envelope>,
    default: Sender<Envelope>,
    pending: AtomicUsize,
    idle: Notify,
}

impl SchedulerInner {
    fn sender(&self, queue: Queue) -> &Sender<Envelope> {
        match queue {
            Queue::High => &self.high,
            Queue::Security => &self.security,
            Queue::Default => &self.default,
        }
    }

    fn finish(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Handle to the worker pool. Cheap to clone.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    /// Spawn `workers` worker tasks on the current runtime
    pub fn start(workers: usize) -> Self {
        let (high_tx, high_rx) = async_channel::unbounded();
        let (security_tx, security_rx) = async_channel::unbounded();
        let (default_tx, default_rx) = async_channel::unbounded();

        let inner = Arc::new(SchedulerInner {
            high: high_tx,
            security: security_tx,
            default: default_tx,
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        for worker_id in 0..workers.max(1) {
            tokio::spawn(worker_loop(
                worker_id,
                inner.clone(),
                high_rx.clone(),
                security_rx.clone(),
                default_rx.clone(),
            ));
        }

        info!(workers, "Job scheduler started");
        Self { inner }
    }

    /// Enqueue a job to run no earlier than `options.delay` from now
    pub fn dispatch(&self, job: Arc<dyn Job>, options: JobOptions) {
        debug!(
            job = %job.name(),
            queue = ?options.queue,
            delay_secs = options.delay.as_secs(),
            "Job dispatched"
        );
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope {
            job,
            queue: options.queue,
            retry: options.retry,
            attempts: 0,
            deadline: None,
        };
        enqueue_after(self.inner.clone(), envelope, options.delay);
    }

    /// Jobs dispatched but not yet finished, including those waiting on a delay
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Wait until every dispatched job has finished
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Close the queues; workers exit once they are drained
    pub fn shutdown(&self) {
        self.inner.high.close();
        self.inner.security.close();
        self.inner.default.close();
    }
}

fn enqueue_after(inner: Arc<SchedulerInner>, envelope: Envelope, delay: Duration) {
    tokio::spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let name = envelope.job.name();
        if inner.sender(envelope.queue).send(envelope).await.is_err() {
            warn!(job = %name, "Job queue closed, dropping job");
            inner.finish();
        }
    });
}

async fn worker_loop(
    worker_id: usize,
    inner: Arc<SchedulerInner>,
    high: Receiver<Envelope>,
    security: Receiver<Envelope>,
    default: Receiver<Envelope>,
) {
    loop {
        let envelope = tokio::select! {
            biased;
            Ok(envelope) = high.recv() => envelope,
            Ok(envelope) = security.recv() => envelope,
            Ok(envelope) = default.recv() => envelope,
            else => break,
        };
        execute(&inner, envelope).await;
    }
    debug!(worker_id, "Job worker stopped");
}

async fn execute(inner: &Arc<SchedulerInner>, mut envelope: Envelope) {
    envelope.attempts += 1;
    let attempt = envelope.attempts;
    let max_attempts = envelope.retry.tries;
    let name = envelope.job.name();

    if envelope.deadline.is_none() {
        envelope.deadline = envelope.retry.retry_window.map(|window| Instant::now() + window);
    }

    info!(job = %name, attempt, max_attempts, "Running job");

    let err = match envelope.job.handle(attempt).await {
        Ok(()) => {
            info!(job = %name, attempt, "Job completed");
            counter!("bastion_jobs_total", 1, "outcome" => "completed");
            inner.finish();
            return;
        }
        Err(err) => err,
    };

    if err.is_configuration() {
        debug!(job = %name, reason = %err, "Job skipped");
        counter!("bastion_jobs_total", 1, "outcome" => "skipped");
        inner.finish();
        return;
    }

    if let Some(backoff) = next_backoff(&envelope, &err) {
        warn!(
            job = %name,
            attempt,
            max_attempts,
            retry_in_secs = backoff.as_secs(),
            error = %err,
            "Job attempt failed, retrying"
        );
        counter!("bastion_jobs_total", 1, "outcome" => "retried");
        enqueue_after(inner.clone(), envelope, backoff);
        return;
    }

    error!(job = %name, attempt, max_attempts, error = %err, "Job permanently failed");
    counter!("bastion_jobs_total", 1, "outcome" => "failed");
    let failure = SecurityError::PermanentFailure(format!(
        "{} failed after {} attempt(s): {}",
        name, attempt, err
    ));
    envelope.job.failed(&failure).await;
    inner.finish();
}

fn next_backoff(envelope: &Envelope, err: &SecurityError) -> Option<Duration> {
    if !err.is_retryable() || envelope.attempts >= envelope.retry.tries {
        return None;
    }
    let backoff = envelope.retry.backoff_after(envelope.attempts);
    match envelope.deadline {
        Some(deadline) if Instant::now() + backoff > deadline => None,
        _ => Some(backoff),
    }
}
