use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::{Job, JobContext, JobError, QueueError, QueueResult};

/// Type-erased job instance for runtime dispatch
#[async_trait]
pub trait ErasedJob: Send + Sync {
    async fn handle(&self, ctx: &JobContext<'_>) -> Result<(), JobError>;

    async fn failed(&self, error: &JobError);

    fn max_attempts(&self) -> Option<u32>;
}

#[async_trait]
impl<J: Job> ErasedJob for J {
    async fn handle(&self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        Job::handle(self, ctx).await
    }

    async fn failed(&self, error: &JobError) {
        Job::failed(self, error).await
    }

    fn max_attempts(&self) -> Option<u32> {
        Job::max_attempts(self)
    }
}

type JobConstructor = fn(Value) -> Result<Box<dyn ErasedJob>, JobError>;

fn construct<J: Job>(payload: Value) -> Result<Box<dyn ErasedJob>, JobError> {
    let job: J = serde_json::from_value(payload)
        .map_err(|e| JobError::Deserialize(format!("{}: {}", J::JOB_NAME, e)))?;
    Ok(Box::new(job))
}

/// Registry mapping recorded job names to job types
#[derive(Default)]
pub struct JobRegistry {
    constructors: HashMap<String, JobConstructor>,
}

impl JobRegistry {
    /// Create a new job registry
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Register a job type
    pub fn register<J: Job>(&mut self) -> QueueResult<()> {
        if self.constructors.contains_key(J::JOB_NAME) {
            return Err(QueueError::Internal(format!(
                "Job type '{}' already registered",
                J::JOB_NAME
            )));
        }

        self.constructors.insert(J::JOB_NAME.to_string(), construct::<J>);
        Ok(())
    }

    /// Builder form of [`JobRegistry::register`]
    pub fn with<J: Job>(mut self) -> QueueResult<Self> {
        self.register::<J>()?;
        Ok(self)
    }

    /// Build the job instance for a recorded name and payload
    pub fn construct(&self, job_name: &str, payload: Value) -> Result<Box<dyn ErasedJob>, JobError> {
        let constructor = self
            .constructors
            .get(job_name)
            .ok_or_else(|| JobError::UnknownJob(job_name.to_string()))?;

        constructor(payload)
    }

    /// Check if a job type is registered
    pub fn is_registered(&self, job_name: &str) -> bool {
        self.constructors.contains_key(job_name)
    }

    /// Get all registered job names, sorted
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}
