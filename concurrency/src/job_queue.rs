// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-key serialized execution of async jobs.
//!
//! Jobs are grouped by a string key (e.g. a port or a VPN name). Jobs sharing a key run one at
//! a time in submission order; jobs with distinct keys run concurrently. A job is a factory of
//! futures so that it can be re-run when it fails with a retryable error.

use futures::future::BoxFuture;
use metrics::counter;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, error, warn};

/// Errors returned by jobs tell whether running the job again may succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,  /* re-runs after the first attempt */
    pub backoff: Duration, /* base delay, scaled by the attempt number */
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Final state of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { attempts: u32 },
    Dropped { attempts: u32, reason: String },
}

impl JobOutcome {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed { .. })
    }
}

/// Lets a submitter wait for the outcome of its job. Dropping it does not cancel the job.
pub struct JobTicket(oneshot::Receiver<JobOutcome>);

impl JobTicket {
    /// Wait for the job to finish. Returns `None` if the queue was torn down first.
    pub async fn outcome(self) -> Option<JobOutcome> {
        self.0.await.ok()
    }
}

type JobFn<E> = Arc<dyn Fn() -> BoxFuture<'static, Result<(), E>> + Send + Sync>;

struct Job<E> {
    name: String,
    work: JobFn<E>,
    done: oneshot::Sender<JobOutcome>,
}

struct QueueInner<E> {
    // a key is present while a worker drains it
    queues: Mutex<HashMap<String, VecDeque<Job<E>>>>,
    policy: RetryPolicy,
    outstanding: AtomicUsize,
    idle: Notify,
}

pub struct JobQueue<E> {
    inner: Arc<QueueInner<E>>,
}

impl<E> Clone for JobQueue<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> JobQueue<E>
where
    E: Retryable + Display + Send + 'static,
{
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                queues: Mutex::new(HashMap::new()),
                policy,
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Submit a job under `key`. The job runs after all jobs previously submitted under the
    /// same key have finished.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn enqueue<F>(&self, key: impl Into<String>, name: impl Into<String>, work: F) -> JobTicket
    where
        F: Fn() -> BoxFuture<'static, Result<(), E>> + Send + Sync + 'static,
    {
        let key = key.into();
        let (done, ticket) = oneshot::channel();
        let job = Job {
            name: name.into(),
            work: Arc::new(work),
            done,
        };
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        let mut queues = self.inner.queues.lock();
        if let Some(queue) = queues.get_mut(&key) {
            debug!("Queued job '{}' behind {} others for key {key}", job.name, queue.len());
            queue.push_back(job);
        } else {
            queues.insert(key.clone(), VecDeque::new());
            tokio::spawn(Self::drain(Arc::clone(&self.inner), key, job));
        }
        JobTicket(ticket)
    }

    async fn drain(inner: Arc<QueueInner<E>>, key: String, first: Job<E>) {
        let mut job = first;
        loop {
            let outcome = Self::run(&inner.policy, &key, &job).await;
            let _ = job.done.send(outcome);
            let next = {
                let mut queues = inner.queues.lock();
                let next = queues.get_mut(&key).and_then(VecDeque::pop_front);
                if next.is_none() {
                    queues.remove(&key);
                }
                next
            };
            if inner.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.idle.notify_waiters();
            }
            match next {
                Some(n) => job = n,
                None => break,
            }
        }
    }

    async fn run(policy: &RetryPolicy, key: &str, job: &Job<E>) -> JobOutcome {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match (job.work)().await {
                Ok(()) => {
                    counter!("vpnsync_jobs_completed").increment(1);
                    return JobOutcome::Completed { attempts };
                }
                Err(e) if e.is_retryable() && attempts <= policy.max_retries => {
                    warn!(
                        "Job '{}' for key {key} failed (attempt {attempts}): {e}. Retrying...",
                        job.name
                    );
                    counter!("vpnsync_jobs_retried").increment(1);
                    tokio::time::sleep(policy.backoff * attempts).await;
                }
                Err(e) => {
                    error!(
                        "Dropping job '{}' for key {key} after {attempts} attempt(s): {e}",
                        job.name
                    );
                    counter!("vpnsync_jobs_dropped").increment(1);
                    return JobOutcome::Dropped {
                        attempts,
                        reason: e.to_string(),
                    };
                }
            }
        }
    }

    /// Number of jobs submitted and not yet finished
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until every submitted job has finished, including jobs submitted while waiting.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{JobOutcome, JobQueue, RetryPolicy, Retryable};
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("transient")]
        Transient,
        #[error("fatal")]
        Fatal,
    }
    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_runs_in_fifo_order() {
        let queue = JobQueue::<TestError>::new(policy());
        let log = Arc::new(Mutex::new(vec![]));
        for n in 0..10u64 {
            let log = log.clone();
            queue.enqueue("port-1", format!("job-{n}"), move || {
                let log = log.clone();
                async move {
                    // later jobs are faster; order must still hold
                    tokio::time::sleep(Duration::from_millis(10 - n)).await;
                    log.lock().push(n);
                    Ok(())
                }
                .boxed()
            });
        }
        queue.wait_idle().await;
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
        assert_eq!(queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let queue = JobQueue::<TestError>::new(policy());
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let ticket = queue.enqueue("k", "flaky", move || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TestError::Transient)
                } else {
                    Ok(())
                }
            }
            .boxed()
        });
        assert_eq!(
            ticket.outcome().await,
            Some(JobOutcome::Completed { attempts: 2 })
        );
    }

    #[tokio::test]
    async fn jobs_are_dropped_when_retries_are_exhausted() {
        let queue = JobQueue::<TestError>::new(policy());
        let ticket = queue.enqueue("k", "always-fails", || {
            async { Err(TestError::Transient) }.boxed()
        });
        let outcome = ticket.outcome().await.expect("Should complete");
        assert_eq!(
            outcome,
            JobOutcome::Dropped {
                attempts: 3,
                reason: "transient".to_string()
            }
        );

        let ticket = queue.enqueue("k", "fatal", || async { Err(TestError::Fatal) }.boxed());
        let outcome = ticket.outcome().await.expect("Should complete");
        assert!(matches!(outcome, JobOutcome::Dropped { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn a_dropped_job_does_not_block_its_key() {
        let queue = JobQueue::<TestError>::new(policy());
        let _ = queue.enqueue("k", "fatal", || async { Err(TestError::Fatal) }.boxed());
        let ticket = queue.enqueue("k", "ok", || async { Ok(()) }.boxed());
        assert!(ticket.outcome().await.is_some_and(|o| o.is_completed()));
    }
}
