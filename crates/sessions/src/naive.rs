//! Proto-session backend over one key-value store and one set store.
//!
//! Layout:
//! - `ids.<kind>.<value>` owner of an identifier
//! - `sessions.hits.<id>` encoded hits of a proto-session
//! - `sessions.buckets.<n>` proto-session ids expected to close in bucket `n`
//! - `sessions.last_bucket.<id>` latest bucket a proto-session was marked for

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::FxHashSet;
use stitch_core::{Hit, HitCodec};
use stitch_store::{Kv, SetOptions, SetStore};
use tracing::{debug, trace};

use crate::batched::{
    AppendHits, BatchResponses, BatchedBackend, BucketResponse, CleanupResponses, ConflictCheck, ConflictRequest,
    GetProtosessionHits, Identifier, MarkBucket, RebindIdentifier, RemoveBucket, RemoveIdentifier,
    RemoveProtosessionHits,
};
use crate::errors::BackendError;

pub fn identifier_key(id: &Identifier) -> String { format!("ids.{}.{}", id.kind.as_str(), id.value) }
pub fn hits_key(protosession_id: &str) -> String { format!("sessions.hits.{protosession_id}") }
pub fn bucket_key(bucket: i64) -> String { format!("sessions.buckets.{bucket}") }
pub fn last_bucket_key(protosession_id: &str) -> String { format!("sessions.last_bucket.{protosession_id}") }

pub struct NaiveBackend {
    kv: Arc<dyn Kv>,
    sets: Arc<dyn SetStore>,
    codec: Arc<dyn HitCodec>,
    // serializes read-modify-write of last-bucket pointers
    marks: Mutex<()>,
    rebinds: Mutex<()>,
}

impl NaiveBackend {
    pub fn new(kv: Arc<dyn Kv>, sets: Arc<dyn SetStore>, codec: Arc<dyn HitCodec>) -> Self {
        Self { kv, sets, codec, marks: Mutex::new(()), rebinds: Mutex::new(()) }
    }

    fn claim(&self, req: &ConflictRequest) -> Result<ConflictCheck, BackendError> {
        let opts = SetOptions::default().skip_if_exists().return_previous();
        let previous = self.kv.set(identifier_key(&req.identifier).as_bytes(), req.owner.as_bytes(), opts)?;
        Ok(match previous {
            Some(p) if !p.is_empty() && p != req.owner.as_bytes() => {
                ConflictCheck::ConflictsWith(String::from_utf8_lossy(&p).into_owned())
            }
            _ => ConflictCheck::Clear,
        })
    }

    /// Claims never write over a present record, so a record still held by
    /// `from` can only be changed by another rebind.
    fn rebind(&self, req: &RebindIdentifier) -> Result<ConflictCheck, BackendError> {
        let key = identifier_key(&req.identifier);
        let _held = self.rebinds.lock().unwrap_or_else(|e| e.into_inner());
        match self.kv.get(key.as_bytes())? {
            Some(cur) if !cur.is_empty() && cur != req.from.as_bytes() && cur != req.owner.as_bytes() => {
                Ok(ConflictCheck::ConflictsWith(String::from_utf8_lossy(&cur).into_owned()))
            }
            Some(_) => {
                self.kv.set(key.as_bytes(), req.owner.as_bytes(), SetOptions::default())?;
                trace!(identifier = %key, from = %req.from, owner = %req.owner, "naive: identifier rebound");
                Ok(ConflictCheck::Clear)
            }
            None => self.claim(&ConflictRequest { identifier: req.identifier.clone(), owner: req.owner.clone() }),
        }
    }

    fn append(&self, req: &AppendHits) -> Result<(), BackendError> {
        let key = hits_key(&req.protosession_id);
        for hit in &req.hits {
            self.sets.add(key.as_bytes(), &self.codec.encode(hit)?)?;
        }
        Ok(())
    }

    fn fetch(&self, protosession_id: &str) -> Result<Vec<Hit>, BackendError> {
        self.sets
            .all(hits_key(protosession_id).as_bytes())?
            .iter()
            .map(|raw| self.codec.decode(raw).map_err(BackendError::from))
            .collect()
    }

    fn last_bucket(&self, protosession_id: &str) -> Result<Option<i64>, BackendError> {
        let Some(raw) = self.kv.get(last_bucket_key(protosession_id).as_bytes())? else { return Ok(None) };
        let s = String::from_utf8_lossy(&raw);
        s.parse::<i64>()
            .map(Some)
            .map_err(|e| BackendError::Other(format!("last bucket of {protosession_id}: {s:?}: {e}")))
    }

    fn mark(&self, req: &MarkBucket) -> Result<(), BackendError> {
        self.sets.add(bucket_key(req.bucket).as_bytes(), req.protosession_id.as_bytes())?;
        let _held = self.marks.lock().unwrap_or_else(|e| e.into_inner());
        if self.last_bucket(&req.protosession_id)?.map_or(true, |last| req.bucket > last) {
            self.kv.set(
                last_bucket_key(&req.protosession_id).as_bytes(),
                req.bucket.to_string().as_bytes(),
                SetOptions::default(),
            )?;
        }
        Ok(())
    }

    fn bucket(&self, bucket: i64) -> BucketResponse {
        let ids = self.sets.all(bucket_key(bucket).as_bytes())?;
        let mut sessions = Vec::with_capacity(ids.len());
        for raw in ids {
            let id = String::from_utf8_lossy(&raw).into_owned();
            if let Some(last) = self.last_bucket(&id)? {
                if last > bucket {
                    trace!(protosession = %id, bucket, last, "naive: skipping stale bucket entry");
                    continue;
                }
            }
            let hits = self.fetch(&id)?;
            if !hits.is_empty() {
                sessions.push(hits);
            }
        }
        debug!(bucket, sessions = sessions.len(), "naive: bucket loaded");
        Ok(sessions)
    }

    fn remove_hits(&self, req: &RemoveProtosessionHits) -> Result<(), BackendError> {
        let key = hits_key(&req.protosession_id);
        let listed: FxHashSet<&str> = req.hit_ids.iter().map(String::as_str).collect();
        let mut kept = 0usize;
        for raw in self.sets.all(key.as_bytes())? {
            if listed.contains(self.codec.decode(&raw)?.id.as_str()) {
                self.sets.delete(key.as_bytes(), &raw)?;
            } else {
                kept += 1;
            }
        }
        let _held = self.marks.lock().unwrap_or_else(|e| e.into_inner());
        if self.last_bucket(&req.protosession_id)?.map_or(false, |last| last <= req.bucket) {
            self.kv.delete(last_bucket_key(&req.protosession_id).as_bytes())?;
        }
        if kept > 0 {
            debug!(protosession = %req.protosession_id, kept, "naive: hits appended after the snapshot stay");
        }
        Ok(())
    }
}

#[async_trait]
impl BatchedBackend for NaiveBackend {
    async fn identifier_conflicts(&self, requests: &[ConflictRequest]) -> Vec<Result<ConflictCheck, BackendError>> {
        requests.iter().map(|r| self.claim(r)).collect()
    }

    async fn rebind_identifiers(&self, requests: &[RebindIdentifier]) -> Vec<Result<ConflictCheck, BackendError>> {
        requests.iter().map(|r| self.rebind(r)).collect()
    }

    async fn handle_batch(
        &self,
        appends: &[AppendHits],
        fetches: &[GetProtosessionHits],
        marks: &[MarkBucket],
    ) -> BatchResponses {
        BatchResponses {
            appends: appends.iter().map(|r| self.append(r)).collect(),
            fetches: fetches.iter().map(|r| self.fetch(&r.protosession_id)).collect(),
            marks: marks.iter().map(|r| self.mark(r)).collect(),
        }
    }

    async fn protosessions_for_buckets(&self, buckets: &[i64]) -> Vec<BucketResponse> {
        buckets.iter().map(|&b| self.bucket(b)).collect()
    }

    async fn cleanup(
        &self,
        hits: &[RemoveProtosessionHits],
        identifiers: &[RemoveIdentifier],
        buckets: &[RemoveBucket],
    ) -> CleanupResponses {
        CleanupResponses {
            hits: hits.iter().map(|r| self.remove_hits(r)).collect(),
            identifiers: identifiers
                .iter()
                .map(|r| self.kv.delete(identifier_key(&r.identifier).as_bytes()).map_err(BackendError::from))
                .collect(),
            buckets: buckets
                .iter()
                .map(|r| self.sets.drop_all(bucket_key(r.bucket).as_bytes()).map_err(BackendError::from))
                .collect(),
        }
    }

    async fn stop(&self) -> Result<(), BackendError> {
        self.kv.flush()?;
        self.sets.flush()?;
        debug!("naive: stores flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batched::IdentifierKind;
    use stitch_core::{CborCodec, JsonCodec};
    use stitch_store::{InMemoryKv, InMemorySet};

    fn backend(codec: Arc<dyn HitCodec>) -> (NaiveBackend, Arc<InMemoryKv>, Arc<InMemorySet>) {
        let kv = Arc::new(InMemoryKv::new());
        let sets = Arc::new(InMemorySet::new());
        (NaiveBackend::new(kv.clone(), sets.clone(), codec), kv, sets)
    }

    fn hit(client: &str, secs: i64) -> Hit {
        let t = chrono::DateTime::from_timestamp(1_735_732_800 + secs, 0).unwrap();
        Hit::new("p", client, t)
    }

    fn claim(value: &str, owner: &str) -> ConflictRequest {
        ConflictRequest { identifier: Identifier::new(IdentifierKind::SessionStamp, value), owner: owner.into() }
    }

    #[tokio::test]
    async fn first_writer_owns_identifier() {
        let (b, _, _) = backend(Arc::new(JsonCodec));
        let got: Vec<_> = b
            .identifier_conflicts(&[claim("s", "a"), claim("s", "b"), claim("s", "a")])
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(got, vec![ConflictCheck::Clear, ConflictCheck::ConflictsWith("a".into()), ConflictCheck::Clear]);
    }

    #[tokio::test]
    async fn bucket_listing_skips_stale_and_empty_entries() {
        let (b, _, _) = backend(Arc::new(CborCodec));
        let appends = [
            AppendHits { protosession_id: "a".into(), hits: vec![hit("a", 0)] },
            AppendHits { protosession_id: "b".into(), hits: vec![hit("b", 1)] },
        ];
        let marks = [
            MarkBucket { protosession_id: "a".into(), bucket: 10 },
            MarkBucket { protosession_id: "b".into(), bucket: 10 },
            MarkBucket { protosession_id: "b".into(), bucket: 12 },
            MarkBucket { protosession_id: "b".into(), bucket: 11 },
            MarkBucket { protosession_id: "ghost".into(), bucket: 10 },
        ];
        let resp = b.handle_batch(&appends, &[], &marks).await;
        assert!(resp.appends.iter().chain(&resp.marks).all(Result::is_ok));

        let got = b.protosessions_for_buckets(&[10, 11, 12]).await;
        let ten = got[0].as_ref().unwrap();
        assert_eq!(ten.len(), 1);
        assert_eq!(ten[0][0].client_id, "a");
        assert!(got[1].as_ref().unwrap().is_empty());
        assert_eq!(got[2].as_ref().unwrap()[0][0].client_id, "b");
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_clears_bucket() {
        let (b, kv, sets) = backend(Arc::new(JsonCodec));
        b.identifier_conflicts(&[claim("s", "a")]).await;
        let first = hit("a", 0);
        b.handle_batch(
            &[AppendHits { protosession_id: "a".into(), hits: vec![first.clone()] }],
            &[],
            &[MarkBucket { protosession_id: "a".into(), bucket: 3 }],
        )
        .await;
        let hits = [RemoveProtosessionHits { protosession_id: "a".into(), hit_ids: vec![first.id], bucket: 3 }];
        let ids = [RemoveIdentifier { identifier: Identifier::new(IdentifierKind::SessionStamp, "s") }];
        let buckets = [RemoveBucket { bucket: 3 }];
        for _ in 0..2 {
            let resp = b.cleanup(&hits, &ids, &buckets).await;
            assert!(resp.first_error().is_none());
            assert!(kv.is_empty());
            assert!(sets.is_empty());
        }
        assert!(b.protosessions_for_buckets(&[3]).await[0].as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_sees_appends_of_the_same_batch() {
        let (b, _, _) = backend(Arc::new(JsonCodec));
        let resp = b
            .handle_batch(
                &[AppendHits { protosession_id: "a".into(), hits: vec![hit("a", 0), hit("a", 1)] }],
                &[GetProtosessionHits { protosession_id: "a".into() }, GetProtosessionHits { protosession_id: "x".into() }],
                &[],
            )
            .await;
        assert_eq!(resp.fetches[0].as_ref().unwrap().len(), 2);
        assert!(resp.fetches[1].as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn removal_keeps_hits_and_pointer_added_after_the_snapshot() {
        let (b, kv, _) = backend(Arc::new(JsonCodec));
        let (early, late) = (hit("a", 0), hit("a", 9));
        b.handle_batch(
            &[AppendHits { protosession_id: "a".into(), hits: vec![early.clone()] }],
            &[],
            &[MarkBucket { protosession_id: "a".into(), bucket: 3 }],
        )
        .await;
        let snapshot = b.protosessions_for_buckets(&[3]).await.remove(0).unwrap();
        b.handle_batch(
            &[AppendHits { protosession_id: "a".into(), hits: vec![late.clone()] }],
            &[],
            &[MarkBucket { protosession_id: "a".into(), bucket: 5 }],
        )
        .await;

        let ids = snapshot[0].iter().map(|h| h.id.clone()).collect();
        let resp = b.cleanup(&[RemoveProtosessionHits { protosession_id: "a".into(), hit_ids: ids, bucket: 3 }], &[], &[]).await;
        assert!(resp.first_error().is_none());
        assert_eq!(kv.get(last_bucket_key("a").as_bytes()).unwrap().as_deref(), Some(&b"5"[..]));
        let five = b.protosessions_for_buckets(&[5]).await.remove(0).unwrap();
        assert_eq!(five.len(), 1);
        assert_eq!(five[0].iter().map(|h| h.id.clone()).collect::<Vec<_>>(), vec![late.id]);
    }

    #[tokio::test]
    async fn rebind_moves_a_held_identifier_in_one_step() {
        let (b, _, _) = backend(Arc::new(JsonCodec));
        b.identifier_conflicts(&[claim("s", "b")]).await;
        let rebind = |from: &str, owner: &str| RebindIdentifier {
            identifier: Identifier::new(IdentifierKind::SessionStamp, "s"),
            from: from.into(),
            owner: owner.into(),
        };
        assert_eq!(b.rebind_identifiers(&[rebind("b", "a")]).await, vec![Ok(ConflictCheck::Clear)]);
        assert_eq!(b.identifier_conflicts(&[claim("s", "c")]).await, vec![Ok(ConflictCheck::ConflictsWith("a".into()))]);
        assert_eq!(
            b.rebind_identifiers(&[rebind("b", "z")]).await,
            vec![Ok(ConflictCheck::ConflictsWith("a".into()))]
        );

        let fresh = RebindIdentifier { identifier: Identifier::new(IdentifierKind::UserId, "u"), from: "b".into(), owner: "a".into() };
        assert_eq!(b.rebind_identifiers(&[fresh]).await, vec![Ok(ConflictCheck::Clear)]);
        let user = ConflictRequest { identifier: Identifier::new(IdentifierKind::UserId, "u"), owner: "c".into() };
        assert_eq!(b.identifier_conflicts(&[user]).await, vec![Ok(ConflictCheck::ConflictsWith("a".into()))]);
    }
}
