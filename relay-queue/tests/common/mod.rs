#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use relay_queue::prelude::*;
use relay_queue::{Clock, DriverContext, QueueBackend, WorkerConfig};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "database")]
use relay_queue::DatabaseQueue;
#[cfg(feature = "database")]
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

/// Side effects of test jobs, keyed by a per-test journal id
static JOURNAL: Lazy<Mutex<HashMap<String, Vec<String>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Where a test's jobs write what they did
pub struct Journal {
    id: String,
}

impl Journal {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
        }
    }

    pub fn id(&self) -> String {
        self.id.clone()
    }

    pub fn entries(&self) -> Vec<String> {
        JOURNAL.lock().get(&self.id).cloned().unwrap_or_default()
    }

    /// Wait until `entry` shows up, at most `timeout`
    pub async fn wait_for(&self, entry: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.entries().iter().any(|e| e == entry) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}

fn note(journal: &str, entry: impl Into<String>) {
    JOURNAL.lock().entry(journal.to_string()).or_default().push(entry.into());
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendWelcomeEmail {
    pub user_id: u64,
    pub journal: String,
}

#[async_trait]
impl Job for SendWelcomeEmail {
    const JOB_NAME: &'static str = "SendWelcomeEmail";
    const QUEUE: Option<&'static str> = Some("emails");

    async fn handle(&self, _ctx: &JobContext<'_>) -> Result<(), JobError> {
        note(&self.journal, format!("sent:{}", self.user_id));
        Ok(())
    }
}

/// Always fails with the given message; no retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokenEmail {
    pub journal: String,
    pub error: String,
}

#[async_trait]
impl Job for BrokenEmail {
    const JOB_NAME: &'static str = "BrokenEmail";

    async fn handle(&self, _ctx: &JobContext<'_>) -> Result<(), JobError> {
        note(&self.journal, "attempted");
        Err(JobError::new(self.error.clone()))
    }

    async fn failed(&self, error: &JobError) {
        note(&self.journal, format!("failed:{}", error));
    }
}

/// Asks to be retried in five seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusyEmail {
    pub journal: String,
}

#[async_trait]
impl Job for BusyEmail {
    const JOB_NAME: &'static str = "BusyEmail";

    async fn handle(&self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        note(&self.journal, format!("attempt:{}", ctx.attempts()));
        ctx.try_again_in(Duration::from_secs(5)).await?;
        Ok(())
    }
}

/// Fails every attempt, allowing three
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlakyEmail {
    pub journal: String,
}

#[async_trait]
impl Job for FlakyEmail {
    const JOB_NAME: &'static str = "FlakyEmail";

    async fn handle(&self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        note(&self.journal, format!("attempt:{}", ctx.attempts()));
        Err(JobError::new("still flaky"))
    }

    async fn failed(&self, error: &JobError) {
        note(&self.journal, format!("failed:{}", error));
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(3)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowReport {
    pub journal: String,
    pub millis: u64,
}

#[async_trait]
impl Job for SlowReport {
    const JOB_NAME: &'static str = "SlowReport";

    async fn handle(&self, _ctx: &JobContext<'_>) -> Result<(), JobError> {
        note(&self.journal, "started");
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        note(&self.journal, "finished");
        Ok(())
    }
}

/// Never finishes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckReport {
    pub journal: String,
}

#[async_trait]
impl Job for StuckReport {
    const JOB_NAME: &'static str = "StuckReport";

    async fn handle(&self, _ctx: &JobContext<'_>) -> Result<(), JobError> {
        note(&self.journal, "started");
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn failed(&self, error: &JobError) {
        note(&self.journal, format!("failed:{}", error));
    }
}

pub fn registry() -> Arc<JobRegistry> {
    let registry = JobRegistry::new()
        .with::<SendWelcomeEmail>()
        .and_then(|r| r.with::<BrokenEmail>())
        .and_then(|r| r.with::<BusyEmail>())
        .and_then(|r| r.with::<FlakyEmail>())
        .and_then(|r| r.with::<SlowReport>())
        .and_then(|r| r.with::<StuckReport>())
        .unwrap();
    Arc::new(registry)
}

/// Manager whose default connection is `backend`
pub fn manager_over(backend: Arc<dyn QueueBackend>, clock: Arc<dyn Clock>) -> Arc<QueueManager> {
    let config = QueueConfig::default().with_default_connection("under-test");
    let manager = QueueManager::new(config, registry())
        .with_clock(clock)
        .register_driver("under-test", move |_: &DriverContext<'_>| Ok(backend.clone()));
    Arc::new(manager)
}

/// Fast-polling worker settings
pub fn worker_config(queues: &[&str]) -> WorkerConfig {
    WorkerConfig {
        queues: queues.iter().map(|q| q.to_string()).collect(),
        poll_interval: Duration::from_millis(10),
        base_retry_backoff: Duration::from_secs(1),
        ..Default::default()
    }
}

/// Database queue over a fresh SQLite file, so several connections can race
#[cfg(feature = "database")]
pub async fn database_queue(clock: Arc<dyn Clock>) -> DatabaseQueue {
    let path = std::env::temp_dir().join(format!("relay-queue-{}.db", Uuid::new_v4().simple()));
    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .unwrap();

    let queue = DatabaseQueue::new(pool, "jobs", registry(), clock).unwrap();
    queue.connect().await.unwrap();
    queue
}
