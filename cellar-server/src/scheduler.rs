//! In-process job scheduler.
//!
//! Jobs are keyed: scheduling under an existing key replaces (aborts) the
//! previous job, so rescheduling from durable state is idempotent. Nothing
//! here is persisted; callers rebuild their jobs from their own stores after
//! a restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::task::AbortHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// A job body. Called once per fire; returns the future to run.
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Whether a one-shot was accepted or is already too late to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled,
    Missed,
}

/// A job that did not run because it fired later than the misfire grace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissedJob {
    pub key: String,
    pub scheduled_for: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
}

/// Keyed one-shot and fixed-interval jobs.
pub trait JobScheduler: Send + Sync {
    /// Run `job` once at `at`, replacing any job under the same key.
    fn schedule_at(&self, key: &str, at: DateTime<Utc>, job: Job) -> ScheduleOutcome;

    /// Run `job` every `every`, starting now, replacing any job under the same key.
    fn schedule_interval(&self, key: &str, every: Duration, job: Job);

    /// Cancel a job. Returns true if one was scheduled.
    fn cancel(&self, key: &str) -> bool;

    fn is_scheduled(&self, key: &str) -> bool;

    /// Keys of all live jobs, sorted.
    fn scheduled_keys(&self) -> Vec<String>;

    fn missed_jobs(&self) -> Vec<MissedJob>;
}

struct Entry {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Entry>,
    missed: Vec<MissedJob>,
    next_generation: u64,
}

impl Inner {
    fn replace(&mut self, key: &str, entry: Entry) {
        if let Some(old) = self.jobs.insert(key.to_string(), entry) {
            debug!("Replacing scheduled job {}", key);
            old.handle.abort();
        }
    }

    /// Take the entry for `key` if it still belongs to `generation`.
    ///
    /// A one-shot claims its entry before running. Once claimed it can no
    /// longer be replaced or cancelled, so a job is never aborted mid-run.
    fn claim(&mut self, key: &str, generation: u64) -> bool {
        if self
            .jobs
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
        {
            self.jobs.remove(key);
            true
        } else {
            false
        }
    }

    fn record_missed(&mut self, key: &str, scheduled_for: DateTime<Utc>) {
        warn!(
            "Job {} missed its fire time {} and will not run",
            key, scheduled_for
        );
        self.missed.push(MissedJob {
            key: key.to_string(),
            scheduled_for,
            detected_at: Utc::now(),
        });
    }
}

/// Scheduler backed by tokio tasks. Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct TokioScheduler {
    inner: Arc<Mutex<Inner>>,
    misfire_grace: chrono::Duration,
}

impl TokioScheduler {
    pub fn new(misfire_grace: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            misfire_grace: chrono::Duration::from_std(misfire_grace)
                .unwrap_or_else(|_| chrono::Duration::MAX),
        }
    }

    fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
        // The map stays consistent even if a holder panicked.
        inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl JobScheduler for TokioScheduler {
    fn schedule_at(&self, key: &str, at: DateTime<Utc>, job: Job) -> ScheduleOutcome {
        let mut inner = Self::lock(&self.inner);

        let now = Utc::now();
        if now - at > self.misfire_grace {
            if let Some(old) = inner.jobs.remove(key) {
                old.handle.abort();
            }
            inner.record_missed(key, at);
            return ScheduleOutcome::Missed;
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;

        let delay = (at - now).to_std().unwrap_or(Duration::ZERO);
        let shared = self.inner.clone();
        let grace = self.misfire_grace;
        let task_key = key.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            {
                let mut inner = Self::lock(&shared);
                if !inner.claim(&task_key, generation) {
                    return;
                }
                if Utc::now() - at > grace {
                    inner.record_missed(&task_key, at);
                    return;
                }
            }

            debug!("Firing job {}", task_key);
            job().await;
        })
        .abort_handle();

        inner.replace(key, Entry { generation, handle });
        ScheduleOutcome::Scheduled
    }

    fn schedule_interval(&self, key: &str, every: Duration, job: Job) {
        let mut inner = Self::lock(&self.inner);
        let generation = inner.next_generation;
        inner.next_generation += 1;

        let task_key = key.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                debug!("Running interval job {}", task_key);
                job().await;
            }
        })
        .abort_handle();

        info!("Scheduled interval job {} every {:?}", key, every);
        inner.replace(key, Entry { generation, handle });
    }

    fn cancel(&self, key: &str) -> bool {
        let mut inner = Self::lock(&self.inner);
        match inner.jobs.remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    fn is_scheduled(&self, key: &str) -> bool {
        Self::lock(&self.inner).jobs.contains_key(key)
    }

    fn scheduled_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Self::lock(&self.inner).jobs.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn missed_jobs(&self) -> Vec<MissedJob> {
        Self::lock(&self.inner).missed.clone()
    }
}
