//! Background job scheduler.
//!
//! Runs named periodic jobs on the tokio worker pool. A name identifies at
//! most one live job; enqueuing under an existing name with
//! [`ExistingJobPolicy::Keep`] leaves the running one alone. Delivery is
//! at-least-once: a job cancelled mid-run is simply started again on its
//! next period.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::location::Connectivity;

/// How often a network-gated job re-checks connectivity while waiting
pub const CONNECTIVITY_POLL: Duration = Duration::from_secs(30);

/// Shortest gap between two period starts, whatever the flex
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// What the job asks the scheduler to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    /// Transient problem; run again after backoff
    Retry,
    /// Will not resolve by itself; wait for the next period
    Failure,
}

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self) -> JobOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicSpec {
    pub period: Duration,
    /// Runs may start this much before the period ends
    pub flex: Duration,
    pub requires_network: bool,
}

impl PeriodicSpec {
    pub fn new(period: Duration, flex: Duration) -> Self {
        Self {
            period,
            flex: flex.min(period.saturating_sub(MIN_INTERVAL)),
            requires_network: true,
        }
    }

    /// Delay from one period start to the next eligible run
    fn interval(&self) -> Duration {
        self.period.saturating_sub(self.flex).max(MIN_INTERVAL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingJobPolicy {
    Keep,
    Replace,
}

/// Exponential retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(5 * 60 * 60),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(20));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

pub struct SyncScheduler {
    connectivity: Arc<dyn Connectivity>,
    backoff: Backoff,
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(connectivity: Arc<dyn Connectivity>) -> Self {
        Self::with_backoff(connectivity, Backoff::default())
    }

    pub fn with_backoff(connectivity: Arc<dyn Connectivity>, backoff: Backoff) -> Self {
        Self {
            connectivity,
            backoff,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule `job` under its name. Returns `false` when a job with that
    /// name is already live and the policy is `Keep`.
    pub fn enqueue_unique_periodic(
        &self,
        job: Arc<dyn Job>,
        spec: PeriodicSpec,
        policy: ExistingJobPolicy,
    ) -> bool {
        let name = job.name().to_string();
        let mut jobs = self.jobs();

        if let Some(existing) = jobs.get(&name) {
            if !existing.is_finished() {
                match policy {
                    ExistingJobPolicy::Keep => {
                        debug!("Job {} already scheduled, keeping it", name);
                        return false;
                    }
                    ExistingJobPolicy::Replace => {
                        info!("Replacing job {}", name);
                        existing.abort();
                    }
                }
            }
        }

        let handle = tokio::spawn(run_periodic(
            job,
            spec,
            self.backoff,
            self.connectivity.clone(),
        ));
        jobs.insert(name.clone(), handle);
        info!("Scheduled job {} every {:?}", name, spec.period);
        true
    }

    /// Cancel the job named `name`, abandoning any in-flight run
    pub fn cancel_unique(&self, name: &str) -> bool {
        match self.jobs().remove(name) {
            Some(handle) => {
                handle.abort();
                info!("Cancelled job {}", name);
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, name: &str) -> bool {
        self.jobs()
            .get(name)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn shutdown(&self) {
        for (name, handle) in self.jobs().drain() {
            handle.abort();
            debug!("Stopped job {}", name);
        }
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_periodic(
    job: Arc<dyn Job>,
    spec: PeriodicSpec,
    backoff: Backoff,
    connectivity: Arc<dyn Connectivity>,
) {
    let mut next_run = Instant::now();
    loop {
        sleep_until(next_run).await;
        let period_start = Instant::now();

        let mut attempt = 0;
        loop {
            if spec.requires_network {
                wait_for_network(job.name(), connectivity.as_ref()).await;
            }

            match job.run().await {
                JobOutcome::Success => {
                    debug!("Job {} succeeded", job.name());
                    break;
                }
                JobOutcome::Failure => {
                    warn!("Job {} failed", job.name());
                    break;
                }
                JobOutcome::Retry => {
                    let delay = backoff.delay(attempt);
                    warn!("Job {} will retry in {:?}", job.name(), delay);
                    attempt += 1;
                    sleep(delay).await;
                }
            }
        }

        next_run = (period_start + spec.interval()).max(Instant::now());
    }
}

async fn wait_for_network(name: &str, connectivity: &dyn Connectivity) {
    let mut logged = false;
    while !connectivity.is_online().await {
        if !logged {
            debug!("Job {} waiting for connectivity", name);
            logged = true;
        }
        sleep(CONNECTIVITY_POLL).await;
    }
}
