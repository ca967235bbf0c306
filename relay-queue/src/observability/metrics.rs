use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Live counters for one worker
pub struct WorkerMetrics {
    jobs_processed: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_released: AtomicU64,
    jobs_failed: AtomicU64,
    pop_errors: AtomicU64,

    // Per-job-name counters
    job_metrics: RwLock<HashMap<String, JobMetrics>>,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            jobs_processed: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_released: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            pop_errors: AtomicU64::new(0),
            job_metrics: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_processing(&self, job_name: &str) {
        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
        self.job_metrics
            .write()
            .entry(job_name.to_string())
            .or_default()
            .processed += 1;
    }

    pub fn record_completed(&self, job_name: &str, elapsed: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        let mut metrics = self.job_metrics.write();
        let entry = metrics.entry(job_name.to_string()).or_default();
        entry.completed += 1;
        entry.total_time += elapsed;
    }

    pub fn record_released(&self, job_name: &str) {
        self.jobs_released.fetch_add(1, Ordering::Relaxed);
        self.job_metrics
            .write()
            .entry(job_name.to_string())
            .or_default()
            .released += 1;
    }

    pub fn record_failed(&self, job_name: &str) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        self.job_metrics
            .write()
            .entry(job_name.to_string())
            .or_default()
            .failed += 1;
    }

    pub fn record_pop_error(&self) {
        self.pop_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn jobs_processed(&self) -> u64 {
        self.jobs_processed.load(Ordering::Relaxed)
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    pub fn jobs_released(&self) -> u64 {
        self.jobs_released.load(Ordering::Relaxed)
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    pub fn pop_errors(&self) -> u64 {
        self.pop_errors.load(Ordering::Relaxed)
    }

    pub fn job_metrics(&self, job_name: &str) -> Option<JobMetrics> {
        self.job_metrics.read().get(job_name).cloned()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            jobs_processed: self.jobs_processed(),
            jobs_completed: self.jobs_completed(),
            jobs_released: self.jobs_released(),
            jobs_failed: self.jobs_failed(),
            pop_errors: self.pop_errors(),
            jobs: self.job_metrics.read().clone(),
        }
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for one job name
#[derive(Debug, Clone, Default)]
pub struct JobMetrics {
    pub processed: u64,
    pub completed: u64,
    pub released: u64,
    pub failed: u64,
    /// Handler time of completed runs
    pub total_time: Duration,
}

impl JobMetrics {
    /// Calculate success rate as percentage
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            100.0
        } else {
            (self.completed as f64 / finished as f64) * 100.0
        }
    }

    pub fn average_time(&self) -> Option<Duration> {
        u32::try_from(self.completed)
            .ok()
            .filter(|completed| *completed > 0)
            .map(|completed| self.total_time / completed)
    }
}

/// Point-in-time copy of [`WorkerMetrics`]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_released: u64,
    pub jobs_failed: u64,
    pub pop_errors: u64,
    pub jobs: HashMap<String, JobMetrics>,
}

impl MetricsSnapshot {
    /// Jobs claimed but not yet reconciled
    pub fn jobs_in_progress(&self) -> u64 {
        self.jobs_processed
            .saturating_sub(self.jobs_completed + self.jobs_released + self.jobs_failed)
    }
}
