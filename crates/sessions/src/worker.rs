//! Task-runner adapter: pings move the wheel, everything else is a hit batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use stitch_core::Hit;
use tracing::{debug, warn};

use crate::errors::ProtosessionError;
use crate::orchestrator::Orchestrator;

pub const PING_KEY: &str = "is-ping";
pub const PING_TIMESTAMP_KEY: &str = "ping-timestamp";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Task {
    pub metadata: BTreeMap<String, String>,
    pub hits: Vec<Hit>,
}

impl Task {
    pub fn hits(hits: Vec<Hit>) -> Self { Self { metadata: BTreeMap::new(), hits } }
    pub fn is_ping(&self) -> bool { self.metadata.get(PING_KEY).is_some_and(|v| v == "true") }
}

/// Task that only advances event time to `t`.
pub fn ping_task(t: DateTime<Utc>) -> Task {
    let mut metadata = BTreeMap::new();
    metadata.insert(PING_KEY.to_string(), "true".to_string());
    metadata.insert(PING_TIMESTAMP_KEY.to_string(), t.to_rfc3339());
    Task { metadata, hits: Vec::new() }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("retry: {0}")]
    Retry(String),
    #[error("drop: {0}")]
    Drop(String),
}

impl TaskError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry(_) => "retry",
            Self::Drop(_) => "drop",
        }
    }
}

impl From<ProtosessionError> for TaskError {
    fn from(e: ProtosessionError) -> Self {
        match e {
            ProtosessionError::Retryable(m) => Self::Retry(m),
            ProtosessionError::Droppable(m) => Self::Drop(m),
        }
    }
}

pub struct Worker {
    orchestrator: Arc<Orchestrator>,
}

impl Worker {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self { Self { orchestrator } }

    pub async fn handle(&self, task: Task) -> Result<(), TaskError> {
        if task.is_ping() {
            let raw = task
                .metadata
                .get(PING_TIMESTAMP_KEY)
                .ok_or_else(|| TaskError::Drop("ping without timestamp".into()))?;
            let t = DateTime::parse_from_rfc3339(raw)
                .map_err(|e| TaskError::Drop(format!("ping timestamp {raw:?}: {e}")))?
                .with_timezone(&Utc);
            debug!(at = %t, "worker: ping");
            self.orchestrator.update_time(t);
            return Ok(());
        }
        let res = self.orchestrator.process_batch(task.hits).await.map_err(TaskError::from);
        if let Err(e) = &res {
            warn!(kind = e.as_str(), error = %e, "worker: task failed");
        }
        res
    }
}
