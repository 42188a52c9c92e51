use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt + 1` (attempts are 1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Retry an async operation with exponential backoff
pub async fn retry_async<F, Fut, T, E>(label: &str, policy: &RetryPolicy, mut op: F) -> std::result::Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!("✓ {} succeeded after {} attempts", label, attempt);
                }
                return Ok(value);
            }
            Err(e) if attempt < max_attempts => {
                let backoff = policy.backoff_for(attempt);
                tracing::warn!(
                    "Attempt {}/{} failed for {}: {}. Retrying in {}ms...",
                    attempt,
                    max_attempts,
                    label,
                    e,
                    backoff.as_millis()
                );
                sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

struct QueuedTask {
    name: String,
    task: TaskFn,
    attempts: u32,
    max_attempts: Option<u32>, // None: retried until it succeeds
    next_attempt_at: Instant,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryQueueReport {
    pub succeeded: usize,
    pub rescheduled: usize,
    pub dropped: usize,
}

/// Queue of deferred work retried with exponential backoff
///
/// Tasks are re-runnable closures; `process_due` runs every task whose
/// backoff has elapsed. A task queued with `enqueue` that still fails after
/// `max_attempts` is dropped with an error log. Tasks queued with
/// `enqueue_persistent` are never dropped; their backoff stays capped at
/// `max_backoff`.
pub struct RetryQueue {
    state: Mutex<QueueState>,
    policy: RetryPolicy,
}

/// Waiting tasks plus the names of those `process_due` is running right now
#[derive(Default)]
struct QueueState {
    waiting: VecDeque<QueuedTask>,
    running: Vec<String>,
}

impl QueueState {
    fn finish(&mut self, name: &str) {
        if let Some(pos) = self.running.iter().position(|n| n == name) {
            self.running.swap_remove(pos);
        }
    }
}

impl RetryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            policy,
        }
    }

    /// Queue a task; its first attempt is due immediately
    pub async fn enqueue<F>(&self, name: impl Into<String>, task: F)
    where
        F: Fn() -> TaskFuture + Send + Sync + 'static,
    {
        self.push(name.into(), Arc::new(task), Some(self.policy.max_attempts))
            .await;
    }

    /// Queue a task that must eventually succeed, such as recording a fill
    pub async fn enqueue_persistent<F>(&self, name: impl Into<String>, task: F)
    where
        F: Fn() -> TaskFuture + Send + Sync + 'static,
    {
        self.push(name.into(), Arc::new(task), None).await;
    }

    async fn push(&self, name: String, task: TaskFn, max_attempts: Option<u32>) {
        tracing::debug!(task = %name, "Queued for retry");
        self.state.lock().await.waiting.push_back(QueuedTask {
            name,
            task,
            attempts: 0,
            max_attempts,
            next_attempt_at: Instant::now(),
        });
    }

    /// Whether a task with this name is waiting or being retried
    pub async fn contains(&self, name: &str) -> bool {
        let state = self.state.lock().await;
        state.waiting.iter().any(|t| t.name == name) || state.running.iter().any(|n| n == name)
    }

    /// Names of every queued task, including those currently running
    pub async fn pending_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .waiting
            .iter()
            .map(|t| t.name.clone())
            .chain(state.running.iter().cloned())
            .collect()
    }

    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.waiting.len() + state.running.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Run all due tasks once
    ///
    /// A task stays visible to `contains` until it has succeeded or been
    /// dropped.
    pub async fn process_due(&self) -> RetryQueueReport {
        let now = Instant::now();
        let due: Vec<QueuedTask> = {
            let mut state = self.state.lock().await;
            let (due, waiting): (VecDeque<_>, VecDeque<_>) =
                state.waiting.drain(..).partition(|t| t.next_attempt_at <= now);
            state.waiting = waiting;
            state.running.extend(due.iter().map(|t| t.name.clone()));
            due.into_iter().collect()
        };

        let mut report = RetryQueueReport::default();

        for mut queued in due {
            queued.attempts += 1;
            let result = (queued.task)().await;
            let mut state = self.state.lock().await;
            state.finish(&queued.name);

            match result {
                Ok(()) => {
                    tracing::info!(
                        task = %queued.name,
                        attempts = queued.attempts,
                        "Deferred task succeeded"
                    );
                    report.succeeded += 1;
                }
                Err(e) if queued.max_attempts.map_or(true, |max| queued.attempts < max) => {
                    let backoff = self.policy.backoff_for(queued.attempts);
                    tracing::warn!(
                        task = %queued.name,
                        attempts = queued.attempts,
                        "Deferred task failed: {}. Next attempt in {}ms",
                        e,
                        backoff.as_millis()
                    );
                    queued.next_attempt_at = Instant::now() + backoff;
                    state.waiting.push_back(queued);
                    report.rescheduled += 1;
                }
                Err(e) => {
                    tracing::error!(
                        task = %queued.name,
                        attempts = queued.attempts,
                        "Dropping deferred task after final failure: {}",
                        e
                    );
                    report.dropped += 1;
                }
            }
        }

        report
    }
}
