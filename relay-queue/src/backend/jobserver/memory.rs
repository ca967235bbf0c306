use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{JobServerClient, ServerJob};
use crate::{Clock, QueueError, QueueResult};

/// A FAIL report received by [`MemoryJobServer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub jid: String,
    pub errtype: String,
    pub message: String,
}

#[derive(Default)]
struct ServerState {
    queues: HashMap<String, VecDeque<ServerJob>>,
    scheduled: Vec<ServerJob>,
    in_flight: HashMap<String, ServerJob>,
    failures: Vec<FailureReport>,
}

/// In-process job server
///
/// Reservations never expire; an unacknowledged job stays in flight.
pub struct MemoryJobServer {
    clock: Arc<dyn Clock>,
    state: Mutex<ServerState>,
    connected: AtomicBool,
}

impl MemoryJobServer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(ServerState::default()),
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn failures(&self) -> Vec<FailureReport> {
        self.state.lock().failures.clone()
    }

    /// Jobs scheduled for later on `queue`
    pub fn scheduled(&self, queue: &str) -> Vec<ServerJob> {
        self.state
            .lock()
            .scheduled
            .iter()
            .filter(|job| job.queue == queue)
            .cloned()
            .collect()
    }

    fn ensure_connected(&self) -> QueueResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(QueueError::Connection("job server is not connected".to_string()))
        }
    }

    fn promote_due(&self, state: &mut ServerState) {
        let now = self.clock.now();
        let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.scheduled)
            .into_iter()
            .partition(|job| job.at.map_or(true, |at| at <= now));

        state.scheduled = pending;
        due.sort_by_key(|job| job.at);
        for job in due {
            state.queues.entry(job.queue.clone()).or_default().push_back(job);
        }
    }
}

#[async_trait]
impl JobServerClient for MemoryJobServer {
    async fn connect(&self) -> QueueResult<()> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> QueueResult<()> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    async fn push(&self, job: ServerJob) -> QueueResult<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();

        match job.at {
            Some(at) if at > self.clock.now() => state.scheduled.push(job),
            _ => state.queues.entry(job.queue.clone()).or_default().push_back(job),
        }
        Ok(())
    }

    async fn fetch(&self, queues: &[&str]) -> QueueResult<Option<ServerJob>> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        self.promote_due(&mut state);

        let job = queues
            .iter()
            .find_map(|queue| state.queues.get_mut(*queue).and_then(VecDeque::pop_front));

        if let Some(job) = &job {
            state.in_flight.insert(job.jid.clone(), job.clone());
        }
        Ok(job)
    }

    async fn ack(&self, jid: &str) -> QueueResult<()> {
        self.ensure_connected()?;
        self.state
            .lock()
            .in_flight
            .remove(jid)
            .map(|_| ())
            .ok_or_else(|| QueueError::StaleClaim(format!("job {} is not reserved", jid)))
    }

    async fn fail(&self, jid: &str, errtype: &str, message: &str) -> QueueResult<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();

        if state.in_flight.remove(jid).is_none() {
            return Err(QueueError::StaleClaim(format!("job {} is not reserved", jid)));
        }
        state.failures.push(FailureReport {
            jid: jid.to_string(),
            errtype: errtype.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }

    async fn queue_size(&self, queue: &str) -> QueueResult<u64> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        self.promote_due(&mut state);

        Ok(state.queues.get(queue).map_or(0, VecDeque::len) as u64)
    }

    async fn clear_queue(&self, queue: &str) -> QueueResult<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();

        state.queues.remove(queue);
        state.scheduled.retain(|job| job.queue != queue);
        state.in_flight.retain(|_, job| job.queue != queue);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{types::clock::after, ManualClock};
    use serde_json::json;
    use std::time::Duration;

    async fn server() -> (MemoryJobServer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let server = MemoryJobServer::new(clock.clone());
        server.connect().await.unwrap();
        (server, clock)
    }

    #[tokio::test]
    async fn test_fetch_respects_queue_order() {
        let (server, _) = server().await;
        server.push(ServerJob::new("a", json!(1), "low")).await.unwrap();
        server.push(ServerJob::new("b", json!(2), "high")).await.unwrap();

        let first = server.fetch(&["high", "low"]).await.unwrap().unwrap();
        assert_eq!(first.jobtype, "b");
        let second = server.fetch(&["high", "low"]).await.unwrap().unwrap();
        assert_eq!(second.jobtype, "a");
        assert_eq!(server.in_flight_count(), 2);
    }

    #[tokio::test]
    async fn test_scheduled_job_waits_for_its_time() {
        let (server, clock) = server().await;
        let mut job = ServerJob::new("later", json!(null), "default");
        job.at = Some(after(clock.now(), Duration::from_secs(5)));
        server.push(job).await.unwrap();

        assert_eq!(server.queue_size("default").await.unwrap(), 0);
        assert_eq!(server.scheduled("default").len(), 1);
        assert!(server.fetch(&["default"]).await.unwrap().is_none());

        clock.advance(Duration::from_secs(5));
        assert_eq!(server.queue_size("default").await.unwrap(), 1);
        assert!(server.fetch(&["default"]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_ack_is_stale() {
        let (server, _) = server().await;
        server.push(ServerJob::new("a", json!(null), "default")).await.unwrap();
        let job = server.fetch(&["default"]).await.unwrap().unwrap();

        server.ack(&job.jid).await.unwrap();
        let result = server.ack(&job.jid).await;
        assert!(matches!(result, Err(e) if e.is_acknowledgement()));
    }

    #[tokio::test]
    async fn test_fail_records_report() {
        let (server, _) = server().await;
        server.push(ServerJob::new("a", json!(null), "default")).await.unwrap();
        let job = server.fetch(&["default"]).await.unwrap().unwrap();

        server.fail(&job.jid, "HandlerError", "smtp down").await.unwrap();

        assert_eq!(server.in_flight_count(), 0);
        assert_eq!(
            server.failures(),
            vec![FailureReport {
                jid: job.jid,
                errtype: "HandlerError".to_string(),
                message: "smtp down".to_string(),
            }]
        );
    }
}
