//! Backend decorator that collapses equal requests within one call.

use std::hash::Hash;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::batched::{
    AppendHits, BatchResponses, BatchedBackend, BucketResponse, CleanupResponses, ConflictCheck, ConflictRequest,
    GetProtosessionHits, MarkBucket, RebindIdentifier, RemoveBucket, RemoveIdentifier, RemoveProtosessionHits,
};
use crate::errors::BackendError;

pub struct DeduplicatingBackend<B> {
    inner: B,
}

impl<B: BatchedBackend> DeduplicatingBackend<B> {
    pub fn new(inner: B) -> Self { Self { inner } }
    pub fn inner(&self) -> &B { &self.inner }
}

/// Indices of first occurrences plus, per original slot, the unique index it maps to.
fn dedup_by<T, K: Eq + Hash>(items: &[T], key: impl Fn(&T) -> K) -> (Vec<usize>, Vec<usize>) {
    let mut index: FxHashMap<K, usize> = FxHashMap::default();
    let mut unique = Vec::new();
    let mut slots = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let next = unique.len();
        let u = *index.entry(key(item)).or_insert(next);
        if u == next {
            unique.push(i);
        }
        slots.push(u);
    }
    (unique, slots)
}

fn pick<T: Clone>(items: &[T], unique: &[usize]) -> Vec<T> {
    unique.iter().map(|&i| items[i].clone()).collect()
}

fn fan_out<T: Clone>(responses: &[Result<T, BackendError>], slots: &[usize]) -> Vec<Result<T, BackendError>> {
    slots
        .iter()
        .map(|&u| responses.get(u).cloned().unwrap_or(Err(BackendError::MissingResponse(u))))
        .collect()
}

fn merge_appends(appends: &[AppendHits]) -> (Vec<AppendHits>, Vec<usize>) {
    let mut index: FxHashMap<&str, usize> = FxHashMap::default();
    let mut merged: Vec<AppendHits> = Vec::new();
    let mut slots = Vec::with_capacity(appends.len());
    for a in appends {
        let u = match index.get(a.protosession_id.as_str()) {
            Some(&u) => {
                merged[u].hits.extend(a.hits.iter().cloned());
                u
            }
            None => {
                index.insert(&a.protosession_id, merged.len());
                merged.push(a.clone());
                merged.len() - 1
            }
        };
        slots.push(u);
    }
    (merged, slots)
}

#[async_trait]
impl<B: BatchedBackend> BatchedBackend for DeduplicatingBackend<B> {
    async fn identifier_conflicts(&self, requests: &[ConflictRequest]) -> Vec<Result<ConflictCheck, BackendError>> {
        let (unique, slots) =
            dedup_by(requests, |r| (r.identifier.kind, r.identifier.value.clone(), r.owner.clone()));
        trace!(requests = requests.len(), unique = unique.len(), "dedup: identifier conflicts");
        let responses = self.inner.identifier_conflicts(&pick(requests, &unique)).await;
        fan_out(&responses, &slots)
    }

    async fn rebind_identifiers(&self, requests: &[RebindIdentifier]) -> Vec<Result<ConflictCheck, BackendError>> {
        let (unique, slots) = dedup_by(requests, |r| (r.identifier.clone(), r.from.clone(), r.owner.clone()));
        let responses = self.inner.rebind_identifiers(&pick(requests, &unique)).await;
        fan_out(&responses, &slots)
    }

    async fn handle_batch(
        &self,
        appends: &[AppendHits],
        fetches: &[GetProtosessionHits],
        marks: &[MarkBucket],
    ) -> BatchResponses {
        let (merged, append_slots) = merge_appends(appends);
        let (fetch_unique, fetch_slots) = dedup_by(fetches, |r| r.protosession_id.clone());
        let (mark_unique, mark_slots) = dedup_by(marks, |r| (r.protosession_id.clone(), r.bucket));
        trace!(appends = appends.len(), merged = merged.len(), marks = marks.len(), unique_marks = mark_unique.len(), "dedup: handle batch");
        let resp = self.inner.handle_batch(&merged, &pick(fetches, &fetch_unique), &pick(marks, &mark_unique)).await;
        BatchResponses {
            appends: fan_out(&resp.appends, &append_slots),
            fetches: fan_out(&resp.fetches, &fetch_slots),
            marks: fan_out(&resp.marks, &mark_slots),
        }
    }

    async fn protosessions_for_buckets(&self, buckets: &[i64]) -> Vec<BucketResponse> {
        let (unique, slots) = dedup_by(buckets, |b| *b);
        let responses = self.inner.protosessions_for_buckets(&pick(buckets, &unique)).await;
        fan_out(&responses, &slots)
    }

    async fn cleanup(
        &self,
        hits: &[RemoveProtosessionHits],
        identifiers: &[RemoveIdentifier],
        buckets: &[RemoveBucket],
    ) -> CleanupResponses {
        let (hits_unique, hits_slots) = dedup_by(hits, |r| (r.protosession_id.clone(), r.bucket, r.hit_ids.clone()));
        let (ids_unique, ids_slots) = dedup_by(identifiers, |r| r.identifier.clone());
        let (buckets_unique, buckets_slots) = dedup_by(buckets, |r| r.bucket);
        let resp = self
            .inner
            .cleanup(&pick(hits, &hits_unique), &pick(identifiers, &ids_unique), &pick(buckets, &buckets_unique))
            .await;
        CleanupResponses {
            hits: fan_out(&resp.hits, &hits_slots),
            identifiers: fan_out(&resp.identifiers, &ids_slots),
            buckets: fan_out(&resp.buckets, &buckets_slots),
        }
    }

    async fn stop(&self) -> Result<(), BackendError> { self.inner.stop().await }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batched::{Identifier, IdentifierKind};
    use crate::testing::TestBackend;
    use stitch_core::Hit;
    use std::sync::{Arc, Mutex};

    #[test]
    fn dedup_maps_every_slot() {
        let (unique, slots) = dedup_by(&[3, 1, 3, 2, 1], |x| *x);
        assert_eq!(unique, vec![0, 1, 3]);
        assert_eq!(slots, vec![0, 1, 0, 2, 1]);
    }

    #[test]
    fn missing_underlying_response_is_reported() {
        let got = fan_out::<()>(&[Ok(())], &[0, 1]);
        assert_eq!(got, vec![Ok(()), Err(BackendError::MissingResponse(1))]);
    }

    #[tokio::test]
    async fn equal_requests_reach_the_backend_once() {
        let seen: Arc<Mutex<Vec<ConflictRequest>>> = Arc::default();
        let log = seen.clone();
        let inner = TestBackend::new().with_conflicts(move |r| {
            log.lock().unwrap().push(r.clone());
            Ok(ConflictCheck::ConflictsWith(format!("owner-of-{}", r.identifier.value)))
        });
        let b = DeduplicatingBackend::new(inner);
        let req = |v: &str, owner: &str| ConflictRequest {
            identifier: Identifier::new(IdentifierKind::SessionStamp, v),
            owner: owner.into(),
        };
        let got = b.identifier_conflicts(&[req("x", "a"), req("y", "a"), req("x", "a"), req("x", "b")]).await;
        assert_eq!(seen.lock().unwrap().len(), 3);
        assert_eq!(got[0], Ok(ConflictCheck::ConflictsWith("owner-of-x".into())));
        assert_eq!(got[2], got[0]);
        assert_eq!(got[1], Ok(ConflictCheck::ConflictsWith("owner-of-y".into())));
    }

    #[tokio::test]
    async fn appends_merge_per_protosession() {
        let seen: Arc<Mutex<Vec<AppendHits>>> = Arc::default();
        let log = seen.clone();
        let b = DeduplicatingBackend::new(TestBackend::new().with_appends(move |r| {
            log.lock().unwrap().push(r.clone());
            Ok(())
        }));
        let t = "2025-01-01T12:00:00Z".parse().unwrap();
        let a = |id: &str| AppendHits { protosession_id: id.into(), hits: vec![Hit::new("p", id, t)] };
        let marks = [
            MarkBucket { protosession_id: "a".into(), bucket: 1 },
            MarkBucket { protosession_id: "a".into(), bucket: 1 },
        ];
        let resp = b.handle_batch(&[a("a"), a("b"), a("a")], &[], &marks).await;
        assert_eq!(resp.appends.len(), 3);
        assert_eq!(resp.marks.len(), 2);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].hits.len(), 2);
        assert_eq!(seen[1].protosession_id, "b");
    }
}
