//! The polling worker.
//!
//! A worker claims one record at a time from its queues (in order, first hit
//! wins), runs it, and reconciles the outcome: delete on success, release-back
//! when the job asked for it or still has attempts left, fail otherwise.
//! `stop` is cooperative: no new claim is started once it is called, and the
//! job in flight gets until the shutdown timeout to finish before the worker
//! abandons it and disconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_core::Stream;
use tokio::sync::{broadcast, watch};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    backend::{BoxedHandle, QueueBackend},
    config::WorkerConfig,
    handle::QueueHandle,
    observability::WorkerMetrics,
    JobError, JobEvent, QueueError, QueueManager, QueueResult,
};

const EVENT_CAPACITY: usize = 256;

/// Where the worker is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Polling,
    Processing,
    Stopping,
    Stopped,
}

/// How [`Worker::stop`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The loop wound down on its own
    Graceful,
    /// The shutdown timeout elapsed and the backend was disconnected underneath the job
    Forced,
}

struct WorkerInner {
    manager: Arc<QueueManager>,
    config: WorkerConfig,
    queues: Vec<String>,
    state: watch::Sender<WorkerState>,
    stop: watch::Sender<bool>,
    abort: watch::Sender<bool>,
    started: AtomicBool,
    events: broadcast::Sender<JobEvent>,
    metrics: WorkerMetrics,
}

/// Polling worker; clones share the same loop
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    /// Worker on the configured connection and queues
    pub fn new(manager: Arc<QueueManager>, config: WorkerConfig) -> Self {
        let queues = if config.queues.is_empty() {
            vec![manager.default_queue().to_string()]
        } else {
            config.queues.clone()
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(WorkerInner {
                manager,
                config,
                queues,
                state: watch::Sender::new(WorkerState::Idle),
                stop: watch::Sender::new(false),
                abort: watch::Sender::new(false),
                started: AtomicBool::new(false),
                events,
                metrics: WorkerMetrics::new(),
            }),
        }
    }

    pub fn queues(&self) -> &[String] {
        &self.inner.queues
    }

    /// Connection name this worker consumes
    pub fn connection(&self) -> &str {
        self.inner
            .config
            .connection
            .as_deref()
            .unwrap_or(self.inner.manager.default_connection())
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state.borrow()
    }

    /// Follow state changes
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Events as a stream; a reader that falls behind skips what it missed
    pub fn events(&self) -> impl Stream<Item = JobEvent> + Send + Unpin + 'static {
        BroadcastStream::new(self.inner.events.subscribe()).filter_map(|event| event.ok())
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.inner.metrics
    }

    fn set_state(&self, state: WorkerState) {
        self.inner.state.send_replace(state);
    }

    fn emit(&self, event: JobEvent) {
        // Nobody listening is fine.
        let _ = self.inner.events.send(event);
    }

    /// Connect and poll until [`Worker::stop`] is called
    pub async fn run(&self) -> QueueResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(QueueError::Internal("worker is already running".to_string()));
        }
        if *self.inner.stop.borrow() {
            self.set_state(WorkerState::Stopped);
            return Ok(());
        }

        let backend = match self.inner.manager.connection(Some(self.connection())).await {
            Ok(backend) => backend,
            Err(e) => {
                self.set_state(WorkerState::Stopped);
                return Err(e);
            }
        };

        info!(
            "Worker started on connection `{}` (queues: {})",
            self.connection(),
            self.inner.queues.join(", ")
        );

        let mut stop_rx = self.inner.stop.subscribe();
        let mut abort_rx = self.inner.abort.subscribe();

        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }

            tokio::select! {
                _ = self.tick(backend.as_ref(), &mut stop_rx) => {}
                _ = raised(&mut abort_rx) => {
                    warn!("Worker abandoned its in-flight job at the shutdown timeout");
                    return Ok(());
                }
            }
        }

        self.set_state(WorkerState::Stopping);
        self.disconnect().await;
        self.set_state(WorkerState::Stopped);
        self.emit(JobEvent::WorkerStopped {
            forced: false,
            at: Utc::now(),
        });

        info!("Worker stopped");
        Ok(())
    }

    /// One claim-and-process round, or a pause when there was nothing to do
    async fn tick(&self, backend: &dyn QueueBackend, stop_rx: &mut watch::Receiver<bool>) {
        self.set_state(WorkerState::Polling);

        match self.next_job(backend).await {
            Ok(Some(handle)) => {
                self.set_state(WorkerState::Processing);
                self.process(handle).await;
            }
            Ok(None) => self.pause(stop_rx).await,
            Err(e) => {
                error!("Failed to fetch the next job: {}", e);
                self.inner.metrics.record_pop_error();
                self.pause(stop_rx).await;
            }
        }
    }

    async fn next_job(&self, backend: &dyn QueueBackend) -> QueueResult<Option<BoxedHandle>> {
        for queue in &self.inner.queues {
            if let Some(handle) = backend.pop(queue).await? {
                return Ok(Some(handle));
            }
        }
        Ok(None)
    }

    /// Sleep for the poll interval, waking early on stop
    async fn pause(&self, stop_rx: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.inner.config.poll_interval) => {}
            _ = raised(stop_rx) => {}
        }
    }

    #[instrument(skip_all, fields(job_id = %handle.id(), job = %handle.job_name(), queue = %handle.queue()))]
    async fn process(&self, handle: BoxedHandle) {
        let job_name = handle.job_name().to_string();
        self.inner.metrics.record_processing(&job_name);
        self.emit(JobEvent::Processing {
            job_id: handle.id().clone(),
            job_name: job_name.clone(),
            queue: handle.queue().to_string(),
            attempts: handle.attempts(),
            at: Utc::now(),
        });

        let started = Instant::now();
        match handle.fire().await {
            Ok(()) => self.finish(handle.as_ref(), &job_name, started.elapsed()).await,
            Err(error) => self.recover(handle.as_ref(), &job_name, error).await,
        }
    }

    async fn finish(&self, handle: &dyn QueueHandle, job_name: &str, elapsed: Duration) {
        if handle.state().released {
            debug!("Job released itself back");
            self.inner.metrics.record_released(job_name);
            self.emit(JobEvent::Released {
                job_id: handle.id().clone(),
                retry_in_ms: None,
                at: Utc::now(),
            });
            return;
        }

        if !handle.state().is_terminal() {
            if let Err(e) = handle.delete().await {
                error!("Failed to delete completed job: {}", e);
            }
        }

        info!("Job completed in {:?}", elapsed);
        self.inner.metrics.record_completed(job_name, elapsed);
        self.emit(JobEvent::Completed {
            job_id: handle.id().clone(),
            at: Utc::now(),
        });
    }

    async fn recover(&self, handle: &dyn QueueHandle, job_name: &str, error: JobError) {
        if handle.state().released {
            warn!("Job errored after releasing itself back: {}", error);
            self.inner.metrics.record_released(job_name);
            self.emit(JobEvent::Released {
                job_id: handle.id().clone(),
                retry_in_ms: None,
                at: Utc::now(),
            });
            return;
        }

        let attempts = handle.attempts();
        let retry = !handle.state().is_terminal()
            && handle
                .max_attempts()
                .is_some_and(|max| attempts.saturating_add(1) < max);

        if retry {
            let backoff = self.inner.config.retry_backoff(attempts);
            warn!("Job failed (attempt {}), retrying in {:?}: {}", attempts + 1, backoff, error);

            match handle.release_back(backoff).await {
                Ok(()) => {
                    self.inner.metrics.record_released(job_name);
                    self.emit(JobEvent::Released {
                        job_id: handle.id().clone(),
                        retry_in_ms: Some(u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX)),
                        at: Utc::now(),
                    });
                    return;
                }
                Err(e) => error!("Failed to release job for retry, failing it instead: {}", e),
            }
        }

        error!("Job failed: {}", error);
        if let Err(e) = handle.fail(&error).await {
            error!("Failed to mark job failed: {}", e);
        }
        self.inner.metrics.record_failed(job_name);
        self.emit(JobEvent::Failed {
            job_id: handle.id().clone(),
            error: error.to_string(),
            at: Utc::now(),
        });
    }

    /// Stop polling and wait for the job in flight, at most the shutdown timeout
    ///
    /// On timeout the in-flight job is abandoned without being failed or
    /// released and the backend is disconnected; the record's fate is left to
    /// the backend's claim expiry.
    pub async fn stop(&self) -> StopOutcome {
        self.inner.stop.send_replace(true);

        if !self.inner.started.load(Ordering::SeqCst) {
            self.set_state(WorkerState::Stopped);
            return StopOutcome::Graceful;
        }

        let mut state_rx = self.inner.state.subscribe();
        let stopped = async {
            while *state_rx.borrow_and_update() != WorkerState::Stopped {
                if state_rx.changed().await.is_err() {
                    return;
                }
            }
        };

        let timeout = self.inner.config.shutdown_timeout;
        if tokio::time::timeout(timeout, stopped).await.is_ok() {
            return StopOutcome::Graceful;
        }

        warn!("Worker did not stop within {:?}; disconnecting", timeout);
        self.inner.abort.send_replace(true);

        self.disconnect().await;

        self.set_state(WorkerState::Stopped);
        self.emit(JobEvent::WorkerStopped {
            forced: true,
            at: Utc::now(),
        });
        StopOutcome::Forced
    }

    /// Hand the connection back to the manager, which reconnects it on next use
    async fn disconnect(&self) {
        if let Err(e) = self.inner.manager.disconnect(Some(self.connection())).await {
            warn!("Error disconnecting worker backend: {}", e);
        }
    }
}

/// Resolve once the flag is true
async fn raised(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
