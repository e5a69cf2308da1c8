//! Persisted position of the timing wheel.

use std::sync::Arc;

use async_trait::async_trait;
use stitch_store::{Kv, SetOptions};

use crate::errors::BackendError;

pub const NEXT_BUCKET_KEY: &str = "timingwheel.next";

#[async_trait]
pub trait WheelStateBackend: Send + Sync {
    /// Next bucket to process, `-1` before the first save.
    async fn next_bucket(&self) -> Result<i64, BackendError>;
    async fn save_next_bucket(&self, bucket: i64) -> Result<(), BackendError>;
}

/// Stores the next bucket as an ASCII integer under one key.
pub struct KvWheelState {
    kv: Arc<dyn Kv>,
    key: String,
}

impl KvWheelState {
    pub fn new(kv: Arc<dyn Kv>, name: &str) -> Self {
        let key = if name.is_empty() { NEXT_BUCKET_KEY.to_string() } else { format!("{NEXT_BUCKET_KEY}.{name}") };
        Self { kv, key }
    }

    pub fn key(&self) -> &str { &self.key }
}

#[async_trait]
impl WheelStateBackend for KvWheelState {
    async fn next_bucket(&self) -> Result<i64, BackendError> {
        let raw = self.kv.get(self.key.as_bytes())?.unwrap_or_default();
        if raw.is_empty() {
            return Ok(-1);
        }
        let s = String::from_utf8_lossy(&raw);
        s.trim().parse().map_err(|e| BackendError::Other(format!("{}: invalid bucket {s:?}: {e}", self.key)))
    }

    async fn save_next_bucket(&self, bucket: i64) -> Result<(), BackendError> {
        self.kv.set(self.key.as_bytes(), bucket.to_string().as_bytes(), SetOptions::default())?;
        Ok(())
    }
}
