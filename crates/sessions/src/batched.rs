//! Batched I/O contract between the orchestrator and proto-session storage.
//!
//! Every operation takes request slices and answers with one result per
//! request, in the same order, so callers match responses positionally.

use async_trait::async_trait;
use stitch_core::{ClientId, Hit};

use crate::errors::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdentifierKind {
    SessionStamp,
    UserId,
}

impl IdentifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStamp => "session_stamp",
            Self::UserId => "user_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    pub kind: IdentifierKind,
    pub value: String,
}

impl Identifier {
    pub fn new(kind: IdentifierKind, value: impl Into<String>) -> Self { Self { kind, value: value.into() } }
}

/// Claim `identifier` for `owner` unless somebody else holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRequest {
    pub identifier: Identifier,
    pub owner: ClientId,
}

/// Move `identifier` from `from` to `owner` in one write. Reports the holder
/// when somebody other than `from` owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebindIdentifier {
    pub identifier: Identifier,
    pub from: ClientId,
    pub owner: ClientId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictCheck {
    Clear,
    ConflictsWith(ClientId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendHits {
    pub protosession_id: ClientId,
    pub hits: Vec<Hit>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetProtosessionHits {
    pub protosession_id: ClientId,
}

/// Expect the proto-session to close in `bucket`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkBucket {
    pub protosession_id: ClientId,
    pub bucket: i64,
}

#[derive(Debug, Clone, Default)]
pub struct BatchResponses {
    pub appends: Vec<Result<(), BackendError>>,
    pub fetches: Vec<Result<Vec<Hit>, BackendError>>,
    pub marks: Vec<Result<(), BackendError>>,
}

/// Proto-sessions due in one bucket.
pub type BucketResponse = Result<Vec<Vec<Hit>>, BackendError>;

/// Remove the listed hits of a proto-session. Its last-bucket pointer goes
/// too, unless a bucket later than `bucket` was marked in the meantime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveProtosessionHits {
    pub protosession_id: ClientId,
    pub hit_ids: Vec<String>,
    pub bucket: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveIdentifier {
    pub identifier: Identifier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveBucket {
    pub bucket: i64,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupResponses {
    pub hits: Vec<Result<(), BackendError>>,
    pub identifiers: Vec<Result<(), BackendError>>,
    pub buckets: Vec<Result<(), BackendError>>,
}

impl CleanupResponses {
    /// First error across all three response groups.
    pub fn first_error(&self) -> Option<&BackendError> {
        self.hits.iter().chain(&self.identifiers).chain(&self.buckets).find_map(|r| r.as_ref().err())
    }
}

#[async_trait]
pub trait BatchedBackend: Send + Sync {
    /// Set-if-absent on each identifier; the first writer owns it.
    async fn identifier_conflicts(&self, requests: &[ConflictRequest]) -> Vec<Result<ConflictCheck, BackendError>>;

    async fn rebind_identifiers(&self, requests: &[RebindIdentifier]) -> Vec<Result<ConflictCheck, BackendError>>;

    async fn handle_batch(
        &self,
        appends: &[AppendHits],
        fetches: &[GetProtosessionHits],
        marks: &[MarkBucket],
    ) -> BatchResponses;

    /// Proto-sessions whose latest expected bucket is the requested one.
    async fn protosessions_for_buckets(&self, buckets: &[i64]) -> Vec<BucketResponse>;

    async fn cleanup(
        &self,
        hits: &[RemoveProtosessionHits],
        identifiers: &[RemoveIdentifier],
        buckets: &[RemoveBucket],
    ) -> CleanupResponses;

    async fn stop(&self) -> Result<(), BackendError>;
}
