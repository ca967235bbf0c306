use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::DatabaseQueue;
use crate::QueueResult;

/// Periodically returns abandoned database claims to the backlog
pub struct ClaimReaper {
    queue: DatabaseQueue,
    interval: Duration,
}

impl ClaimReaper {
    /// Create a reaper that runs every 30 seconds
    pub fn new(queue: DatabaseQueue) -> Self {
        Self {
            queue,
            interval: Duration::from_secs(30),
        }
    }

    pub fn with_interval(queue: DatabaseQueue, interval: Duration) -> Self {
        Self { queue, interval }
    }

    /// Run forever, reaping once per interval
    pub async fn start(self) {
        let mut ticker = interval(self.interval);

        info!(
            "Starting claim reaper on table {} with interval: {:?}",
            self.queue.table(),
            self.interval
        );

        loop {
            ticker.tick().await;

            match self.run_once().await {
                Ok(0) => debug!("No expired claims found"),
                Ok(reclaimed) => info!("Returned {} expired claims to the backlog", reclaimed),
                Err(e) => warn!("Error during claim reaping: {}", e),
            }
        }
    }

    /// Start on the current runtime; abort the handle to stop
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.start())
    }

    pub async fn run_once(&self) -> QueueResult<u64> {
        self.queue.reap_expired_claims().await
    }
}
