//! Configurable doubles for the backend, closer, requeuer and wheel state.

use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use stitch_core::Hit;

use crate::batched::{
    AppendHits, BatchResponses, BatchedBackend, BucketResponse, CleanupResponses, ConflictCheck, ConflictRequest,
    GetProtosessionHits, MarkBucket, RebindIdentifier, RemoveBucket, RemoveIdentifier, RemoveProtosessionHits,
};
use crate::closer::{Closer, Requeuer};
use crate::errors::BackendError;
use crate::wheel_state::WheelStateBackend;

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|e| e.into_inner()) }

type Handler<Req, Resp> = Box<dyn Fn(&Req) -> Result<Resp, BackendError> + Send + Sync>;

/// Backend whose every operation is a closure; unset operations succeed with empty results.
pub struct TestBackend {
    conflicts: Handler<ConflictRequest, ConflictCheck>,
    rebinds: Handler<RebindIdentifier, ConflictCheck>,
    appends: Handler<AppendHits, ()>,
    fetches: Handler<GetProtosessionHits, Vec<Hit>>,
    marks: Handler<MarkBucket, ()>,
    buckets: Handler<i64, Vec<Vec<Hit>>>,
    remove_hits: Handler<RemoveProtosessionHits, ()>,
    remove_identifiers: Handler<RemoveIdentifier, ()>,
    remove_buckets: Handler<RemoveBucket, ()>,
}

impl Default for TestBackend {
    fn default() -> Self {
        Self {
            conflicts: Box::new(|_| Ok(ConflictCheck::Clear)),
            rebinds: Box::new(|_| Ok(ConflictCheck::Clear)),
            appends: Box::new(|_| Ok(())),
            fetches: Box::new(|_| Ok(Vec::new())),
            marks: Box::new(|_| Ok(())),
            buckets: Box::new(|_| Ok(Vec::new())),
            remove_hits: Box::new(|_| Ok(())),
            remove_identifiers: Box::new(|_| Ok(())),
            remove_buckets: Box::new(|_| Ok(())),
        }
    }
}

macro_rules! handler_setter {
    ($name:ident, $field:ident, $req:ty, $resp:ty) => {
        pub fn $name(mut self, f: impl Fn(&$req) -> Result<$resp, BackendError> + Send + Sync + 'static) -> Self {
            self.$field = Box::new(f);
            self
        }
    };
}

impl TestBackend {
    pub fn new() -> Self { Self::default() }

    handler_setter!(with_conflicts, conflicts, ConflictRequest, ConflictCheck);
    handler_setter!(with_rebinds, rebinds, RebindIdentifier, ConflictCheck);
    handler_setter!(with_appends, appends, AppendHits, ());
    handler_setter!(with_fetches, fetches, GetProtosessionHits, Vec<Hit>);
    handler_setter!(with_marks, marks, MarkBucket, ());
    handler_setter!(with_buckets, buckets, i64, Vec<Vec<Hit>>);
    handler_setter!(with_remove_hits, remove_hits, RemoveProtosessionHits, ());
    handler_setter!(with_remove_identifiers, remove_identifiers, RemoveIdentifier, ());
    handler_setter!(with_remove_buckets, remove_buckets, RemoveBucket, ());
}

#[async_trait]
impl BatchedBackend for TestBackend {
    async fn identifier_conflicts(&self, requests: &[ConflictRequest]) -> Vec<Result<ConflictCheck, BackendError>> {
        requests.iter().map(|r| (self.conflicts)(r)).collect()
    }

    async fn rebind_identifiers(&self, requests: &[RebindIdentifier]) -> Vec<Result<ConflictCheck, BackendError>> {
        requests.iter().map(|r| (self.rebinds)(r)).collect()
    }

    async fn handle_batch(
        &self,
        appends: &[AppendHits],
        fetches: &[GetProtosessionHits],
        marks: &[MarkBucket],
    ) -> BatchResponses {
        BatchResponses {
            appends: appends.iter().map(|r| (self.appends)(r)).collect(),
            fetches: fetches.iter().map(|r| (self.fetches)(r)).collect(),
            marks: marks.iter().map(|r| (self.marks)(r)).collect(),
        }
    }

    async fn protosessions_for_buckets(&self, buckets: &[i64]) -> Vec<BucketResponse> {
        buckets.iter().map(|b| (self.buckets)(b)).collect()
    }

    async fn cleanup(
        &self,
        hits: &[RemoveProtosessionHits],
        identifiers: &[RemoveIdentifier],
        buckets: &[RemoveBucket],
    ) -> CleanupResponses {
        CleanupResponses {
            hits: hits.iter().map(|r| (self.remove_hits)(r)).collect(),
            identifiers: identifiers.iter().map(|r| (self.remove_identifiers)(r)).collect(),
            buckets: buckets.iter().map(|r| (self.remove_buckets)(r)).collect(),
        }
    }

    async fn stop(&self) -> Result<(), BackendError> { Ok(()) }
}

type CloseHandler = Box<dyn Fn(&[Vec<Hit>]) -> Result<()> + Send + Sync>;

/// Closer that delegates to a closure.
pub struct TestCloser {
    handler: CloseHandler,
}

impl TestCloser {
    pub fn new(f: impl Fn(&[Vec<Hit>]) -> Result<()> + Send + Sync + 'static) -> Self { Self { handler: Box::new(f) } }
}

#[async_trait]
impl Closer for TestCloser {
    async fn close(&self, sessions: &[Vec<Hit>]) -> Result<()> { (self.handler)(sessions) }
}

/// Keeps every close call.
#[derive(Default)]
pub struct RecordingCloser {
    calls: Mutex<Vec<Vec<Vec<Hit>>>>,
}

impl RecordingCloser {
    pub fn new() -> Self { Self::default() }
    pub fn calls(&self) -> Vec<Vec<Vec<Hit>>> { locked(&self.calls).clone() }
    /// All sessions across calls, in close order.
    pub fn sessions(&self) -> Vec<Vec<Hit>> { locked(&self.calls).iter().flatten().cloned().collect() }
}

#[async_trait]
impl Closer for RecordingCloser {
    async fn close(&self, sessions: &[Vec<Hit>]) -> Result<()> {
        locked(&self.calls).push(sessions.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingRequeuer {
    pushes: Mutex<Vec<Vec<Hit>>>,
}

impl RecordingRequeuer {
    pub fn new() -> Self { Self::default() }
    pub fn pushes(&self) -> Vec<Vec<Hit>> { locked(&self.pushes).clone() }
    pub fn hits(&self) -> Vec<Hit> { locked(&self.pushes).iter().flatten().cloned().collect() }
}

#[async_trait]
impl Requeuer for RecordingRequeuer {
    async fn push(&self, hits: Vec<Hit>) -> Result<()> {
        locked(&self.pushes).push(hits);
        Ok(())
    }
}

struct WheelPosition {
    next: i64,
    history: Vec<i64>,
}

/// In-memory wheel state that remembers every save.
pub struct RecordingWheelState {
    inner: Mutex<WheelPosition>,
}

impl Default for RecordingWheelState {
    fn default() -> Self { Self::starting_at(-1) }
}

impl RecordingWheelState {
    pub fn new() -> Self { Self::default() }
    pub fn starting_at(next: i64) -> Self { Self { inner: Mutex::new(WheelPosition { next, history: Vec::new() }) } }
    pub fn history(&self) -> Vec<i64> { locked(&self.inner).history.clone() }
}

#[async_trait]
impl WheelStateBackend for RecordingWheelState {
    async fn next_bucket(&self) -> Result<i64, BackendError> { Ok(locked(&self.inner).next) }

    async fn save_next_bucket(&self, bucket: i64) -> Result<(), BackendError> {
        let mut p = locked(&self.inner);
        p.next = bucket;
        p.history.push(bucket);
        Ok(())
    }
}
