//! The proto-session orchestrator.
//!
//! Ingest: `process_batch` stamps identifiers, drops hits whose bucket is
//! being finalized or already past, resolves identifier conflicts, saves hits
//! to their proto-sessions and requeues evicted ones.
//!
//! Expiry: the timing wheel calls [`BucketProcessor::process_bucket`] with
//! bucket `N`, which finalizes `N - 1` while `N` is fetched in the background.
//! A failed close keeps the fetched sessions in a one-slot retry so the next
//! tick does not hit storage again, and discards every look-ahead fetch.
//! Removal after a close only touches the hits that were closed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use stitch_core::{ClientId, Hit, RegistryError, Settings, SettingsRegistry};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::batched::{
    AppendHits, BatchedBackend, BucketResponse, ConflictCheck, GetProtosessionHits, MarkBucket, RebindIdentifier,
    RemoveBucket, RemoveProtosessionHits,
};
use crate::closer::{Closer, Requeuer};
use crate::conflicts::{conflict_requests, identifier_cleanup_requests};
use crate::errors::{BackendError, ProtosessionError};
use crate::eviction::EvictionStrategy;
use crate::isolation::{DefaultIsolationFactory, IsolationGuard, IsolationGuardFactory};
use crate::meta;
use crate::wheel::{BucketProcessor, TickOutcome, TickReport, TimingWheel};
use crate::wheel_state::WheelStateBackend;

const LAG_WARN_THRESHOLD: Duration = Duration::from_secs(5 * 60);
const LAG_WARN_EVERY: Duration = Duration::from_secs(1);

fn ms(started: Instant) -> f64 { started.elapsed().as_secs_f64() * 1000.0 }

#[derive(Debug, Default)]
struct ProcessingStats {
    received: AtomicU64,
    closed: AtomicU64,
    dropped: AtomicU64,
    evictions: AtomicU64,
    requeued: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hits_received: u64,
    pub hits_closed: u64,
    pub hits_dropped: u64,
    pub evictions: u64,
    pub hits_requeued: u64,
}

impl ProcessingStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits_received: self.received.load(Ordering::Relaxed),
            hits_closed: self.closed.load(Ordering::Relaxed),
            hits_dropped: self.dropped.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hits_requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}

fn add(c: &AtomicU64, n: usize) { c.fetch_add(n as u64, Ordering::Relaxed); }

pub struct OrchestratorBuilder {
    backend: Option<Arc<dyn BatchedBackend>>,
    state: Option<Arc<dyn WheelStateBackend>>,
    closer: Option<Arc<dyn Closer>>,
    requeuer: Option<Arc<dyn Requeuer>>,
    registry: Option<Arc<dyn SettingsRegistry>>,
    eviction: EvictionStrategy,
    guards: Arc<dyn IsolationGuardFactory>,
    tick: Duration,
    spawn_wheel: bool,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self {
            backend: None,
            state: None,
            closer: None,
            requeuer: None,
            registry: None,
            eviction: EvictionStrategy::default(),
            guards: Arc::new(DefaultIsolationFactory),
            tick: Duration::from_secs(1),
            spawn_wheel: true,
        }
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self { Self::default() }
    pub fn backend(mut self, b: Arc<dyn BatchedBackend>) -> Self { self.backend = Some(b); self }
    pub fn wheel_state(mut self, s: Arc<dyn WheelStateBackend>) -> Self { self.state = Some(s); self }
    pub fn closer(mut self, c: Arc<dyn Closer>) -> Self { self.closer = Some(c); self }
    pub fn requeuer(mut self, r: Arc<dyn Requeuer>) -> Self { self.requeuer = Some(r); self }
    pub fn registry(mut self, r: Arc<dyn SettingsRegistry>) -> Self { self.registry = Some(r); self }
    pub fn eviction(mut self, e: EvictionStrategy) -> Self { self.eviction = e; self }
    pub fn isolation(mut self, f: Arc<dyn IsolationGuardFactory>) -> Self { self.guards = f; self }
    pub fn tick(mut self, tick: Duration) -> Self { self.tick = tick; self }
    /// Without the wheel loop, callers drive expiry through [`Orchestrator::tick`].
    pub fn spawn_wheel(mut self, spawn: bool) -> Self { self.spawn_wheel = spawn; self }

    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Orchestrator> {
        let backend = self.backend.context("orchestrator needs a backend")?;
        let state = self.state.context("orchestrator needs a wheel state backend")?;
        let closer = self.closer.context("orchestrator needs a closer")?;
        let requeuer = self.requeuer.context("orchestrator needs a requeuer")?;
        let registry = self.registry.context("orchestrator needs a settings registry")?;

        let cancel = CancellationToken::new();
        let (req_tx, req_rx) = mpsc::channel(16);
        let (resp_tx, resp_rx) = mpsc::channel(16);
        let inner = Arc::new(Inner {
            backend: backend.clone(),
            closer,
            requeuer,
            registry,
            eviction: self.eviction,
            guards: self.guards,
            wheel: TimingWheel::new(self.tick, state),
            stats: ProcessingStats::default(),
            cancel: cancel.clone(),
            expiry: tokio::sync::Mutex::new(ExpiryState {
                requests: req_tx,
                responses: resp_rx,
                generation: 0,
                ready: FxHashMap::default(),
                pending: FxHashSet::default(),
                retry: None,
                last_lag_warn: None,
            }),
        });

        let mut tasks = vec![tokio::spawn(prefill(backend, req_rx, resp_tx, cancel.clone(), self.tick))];
        if self.spawn_wheel {
            let (inner, cancel) = (inner.clone(), cancel.clone());
            tasks.push(tokio::spawn(async move { inner.wheel.run(inner.as_ref(), cancel).await }));
        }
        info!(tick_ms = %self.tick.as_millis(), eviction = self.eviction.as_str(), wheel = self.spawn_wheel, "orchestrator started");
        Ok(Orchestrator { inner, cancel, tasks: Mutex::new(tasks) })
    }
}

pub struct Orchestrator {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder { OrchestratorBuilder::new() }

    pub async fn process_batch(&self, hits: Vec<Hit>) -> Result<(), ProtosessionError> {
        let started = Instant::now();
        let res = self.inner.process_batch(hits).await;
        histogram!("protosessions_process_batch_ms", ms(started));
        res
    }

    /// Advance event time without hits, as pings do.
    pub fn update_time(&self, t: DateTime<Utc>) { self.inner.wheel.update_time(t) }

    pub async fn tick(&self) -> Result<TickReport> { self.inner.wheel.tick(self.inner.as_ref()).await }

    /// Tick until no bucket is due; returns the number of buckets finalized.
    pub async fn catch_up(&self) -> Result<u64> {
        let mut processed = 0;
        loop {
            match self.tick().await? {
                TickReport::Idle | TickReport::NotDue { .. } => return Ok(processed),
                TickReport::Initialized(_) => {}
                TickReport::Processed { outcome: TickOutcome::Advance, .. } => processed += 1,
                TickReport::Processed { outcome: TickOutcome::Noop, bucket } => {
                    return Err(anyhow!("bucket {bucket} did not advance"));
                }
            }
        }
    }

    pub fn wheel(&self) -> &TimingWheel { &self.inner.wheel }

    pub fn stats(&self) -> StatsSnapshot { self.inner.stats.snapshot() }

    /// Cancel background work, wait for it, then stop the backend.
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for t in tasks {
            if let Err(e) = t.await {
                warn!(error = %e, "orchestrator: background task ended abnormally");
            }
        }
        self.inner.backend.stop().await.context("stopping backend")?;
        info!(stats = ?self.stats(), "orchestrator stopped");
        Ok(())
    }
}

/// Prefetch requests and responses carry the generation they were issued in.
type Prefetch = (u64, i64);

struct ExpiryState {
    requests: mpsc::Sender<Prefetch>,
    responses: mpsc::Receiver<(Prefetch, BucketResponse)>,
    generation: u64,
    ready: FxHashMap<i64, BucketResponse>,
    pending: FxHashSet<i64>,
    retry: Option<(i64, Vec<Vec<Hit>>)>,
    last_lag_warn: Option<Instant>,
}

impl ExpiryState {
    async fn request(&mut self, bucket: i64) -> Result<()> {
        if self.pending.contains(&bucket) || self.ready.contains_key(&bucket) {
            return Ok(());
        }
        self.requests.send((self.generation, bucket)).await.map_err(|_| anyhow!("prefill worker stopped"))?;
        self.pending.insert(bucket);
        Ok(())
    }

    async fn receive(&mut self, bucket: i64, cancel: &CancellationToken) -> Result<BucketResponse> {
        loop {
            if let Some(resp) = self.ready.remove(&bucket) {
                return Ok(resp);
            }
            let ((generation, got), resp) = tokio::select! {
                _ = cancel.cancelled() => return Err(anyhow!("cancelled while waiting for bucket {bucket}")),
                r = self.responses.recv() => r.ok_or_else(|| anyhow!("prefill worker stopped"))?,
            };
            if generation != self.generation {
                trace!(bucket = got, "protosessions: dropping prefetch of a discarded generation");
                continue;
            }
            self.pending.remove(&got);
            self.ready.insert(got, resp);
        }
    }

    /// Forget fetched and in-flight buckets; hits may have moved since.
    fn invalidate(&mut self) {
        self.generation += 1;
        self.ready.clear();
        self.pending.clear();
    }
}

struct PropertyContext {
    settings: Settings,
    guard: Box<dyn IsolationGuard>,
}

type Properties = FxHashMap<String, PropertyContext>;

/// Retarget owner per (property id, authoritative client id).
type Owners = FxHashMap<(String, ClientId), ClientId>;

fn property<'a>(props: &'a Properties, hit: &Hit) -> &'a PropertyContext { &props[&hit.property_id] }

struct Inner {
    backend: Arc<dyn BatchedBackend>,
    closer: Arc<dyn Closer>,
    requeuer: Arc<dyn Requeuer>,
    registry: Arc<dyn SettingsRegistry>,
    eviction: EvictionStrategy,
    guards: Arc<dyn IsolationGuardFactory>,
    wheel: TimingWheel,
    stats: ProcessingStats,
    cancel: CancellationToken,
    expiry: tokio::sync::Mutex<ExpiryState>,
}

impl Inner {
    /// Settings and guard per property in the batch; unknown properties are left out.
    fn batch_context(&self, hits: &[Hit]) -> Result<Properties, ProtosessionError> {
        let mut out = FxHashMap::default();
        let mut unknown = FxHashSet::default();
        for h in hits {
            if out.contains_key(&h.property_id) || unknown.contains(&h.property_id) {
                continue;
            }
            match self.registry.get_by_property_id(&h.property_id) {
                Ok(settings) => {
                    let guard = self.guards.guard(&settings);
                    out.insert(h.property_id.clone(), PropertyContext { settings, guard });
                }
                Err(RegistryError::NotFound(p)) => {
                    warn!(property = %p, "protosessions: unknown property, skipping its hits");
                    unknown.insert(h.property_id.clone());
                }
                Err(e) => return Err(ProtosessionError::retry(e)),
            }
        }
        Ok(out)
    }

    async fn process_batch(&self, hits: Vec<Hit>) -> Result<(), ProtosessionError> {
        if hits.is_empty() {
            return Ok(());
        }
        debug!(hits = hits.len(), "protosessions: processing batch");
        for h in &hits {
            h.validate().map_err(ProtosessionError::drop)?;
        }
        let props = self.batch_context(&hits)?;
        let mut hits: Vec<Hit> = hits.into_iter().filter(|h| props.contains_key(&h.property_id)).collect();

        for h in &mut hits {
            let pc = property(&props, h);
            let stamp = pc.guard.isolated_session_stamp(h).map_err(ProtosessionError::drop)?;
            meta::set_session_stamp(h, stamp);
            if h.user_id.is_some() {
                let user = pc.guard.isolated_user_id(h).map_err(ProtosessionError::drop)?;
                meta::set_user_id_stamp(h, user);
            }
        }

        let (batch, dropped) = self.seed_outdated(hits, &props);
        let last_time = batch.last().map(Hit::server_received_time);

        let owners = self.check_conflicts(&batch, &props).await?;

        let mut to_save = Vec::with_capacity(batch.len());
        let mut for_eviction: BTreeMap<ClientId, Vec<Hit>> = BTreeMap::new();
        let received = batch.len();
        let mut evictions = 0usize;
        for hit in batch {
            match owners.get(&(hit.property_id.clone(), hit.authoritative_client_id.clone())).cloned() {
                Some(owner) => {
                    self.eviction.apply(hit, &owner, &mut to_save, &mut for_eviction);
                    evictions += 1;
                }
                None => to_save.push(hit),
            }
        }
        if evictions > 0 {
            counter!("protosessions_evictions_total", evictions as u64);
            add(&self.stats.evictions, evictions);
        }

        for h in &mut to_save {
            let id = property(&props, h).guard.isolated_client_id(h).map_err(ProtosessionError::drop)?;
            meta::set_isolated_client_id(h, id);
        }

        let mut marks = Vec::with_capacity(to_save.len());
        let mut appends = Vec::with_capacity(to_save.len());
        for h in &to_save {
            let protosession_id = meta::isolated_client_id(h).to_string();
            let bucket = self.wheel.expiry_bucket(h.server_received_time(), property(&props, h).settings.session_timeout);
            marks.push(MarkBucket { protosession_id: protosession_id.clone(), bucket });
            appends.push(AppendHits { protosession_id, hits: vec![h.clone()] });
        }
        let mut evicted_ids = Vec::with_capacity(for_eviction.len());
        for hits in for_eviction.values() {
            if let Some(first) = hits.first() {
                evicted_ids.push(property(&props, first).guard.isolated_client_id(first).map_err(ProtosessionError::drop)?);
            }
        }
        let fetches: Vec<_> =
            evicted_ids.iter().map(|id| GetProtosessionHits { protosession_id: id.clone() }).collect();

        let started = Instant::now();
        let resp = self.backend.handle_batch(&appends, &fetches, &marks).await;
        histogram!("protosessions_handle_batch_ms", ms(started));
        for (what, got, sent) in [
            ("append", resp.appends.len(), appends.len()),
            ("fetch", resp.fetches.len(), fetches.len()),
            ("mark", resp.marks.len(), marks.len()),
        ] {
            answered_all(what, got, sent)?;
        }
        if let Some(e) = resp.appends.iter().chain(&resp.marks).find_map(|r| r.as_ref().err()) {
            return Err(ProtosessionError::retry(e));
        }

        let mut remove_hits = Vec::with_capacity(evicted_ids.len());
        for (id, fetched) in evicted_ids.into_iter().zip(resp.fetches) {
            let fetched = fetched.map_err(ProtosessionError::retry)?;
            let Some(bucket) = fetched
                .iter()
                .map(|h| {
                    let timeout = props
                        .get(&h.property_id)
                        .map_or_else(|| Settings::default().session_timeout, |pc| pc.settings.session_timeout);
                    self.wheel.expiry_bucket(h.server_received_time(), timeout)
                })
                .max()
            else {
                continue;
            };
            remove_hits.push(RemoveProtosessionHits {
                protosession_id: id,
                hit_ids: fetched.iter().map(|h| h.id.clone()).collect(),
                bucket,
            });
            for hit in fetched {
                for_eviction.entry(hit.authoritative_client_id.clone()).or_default().push(hit);
            }
        }
        let requeue: Vec<Hit> = for_eviction.into_values().flatten().collect();
        if !requeue.is_empty() {
            let started = Instant::now();
            let n = requeue.len();
            self.requeuer.push(requeue).await.map_err(|e| ProtosessionError::retry(format!("requeue: {e:#}")))?;
            histogram!("protosessions_requeue_ms", ms(started));
            add(&self.stats.requeued, n);
            debug!(hits = n, "protosessions: requeued evicted hits");
        }

        self.cleanup_dropped_and_evicted(remove_hits, &dropped, &props).await?;

        if let Some(t) = last_time {
            self.wheel.update_time(t);
        }
        counter!("protosessions_hits_received_total", received as u64);
        add(&self.stats.received, received);
        Ok(())
    }

    /// Split hits into survivors, sorted by time, and hits whose bucket is locked or past.
    fn seed_outdated(&self, hits: Vec<Hit>, props: &Properties) -> (Vec<Hit>, Vec<Hit>) {
        let mut by_bucket: BTreeMap<i64, Vec<Hit>> = BTreeMap::new();
        for h in hits {
            let timeout = property(props, &h).settings.session_timeout;
            by_bucket.entry(self.wheel.expiry_bucket(h.server_received_time(), timeout)).or_default().push(h);
        }

        let mut held = Vec::with_capacity(by_bucket.len());
        let (mut kept, mut dropped) = (Vec::new(), Vec::new());
        for (bucket, group) in by_bucket {
            let Some(guard) = self.wheel.locks().try_lock(bucket) else {
                warn!(bucket, hits = group.len(), "protosessions: dropping hits for a bucket being processed");
                dropped.extend(group);
                continue;
            };
            held.push(guard);
            match self.wheel.current_bucket() {
                Some(current) if bucket <= current => {
                    warn!(bucket, current, hits = group.len(), "protosessions: dropping hits for an expired bucket");
                    dropped.extend(group);
                }
                _ => kept.extend(group),
            }
        }
        drop(held);

        if !dropped.is_empty() {
            counter!("protosessions_hits_dropped_total", dropped.len() as u64);
            add(&self.stats.dropped, dropped.len());
        }
        kept.sort_by_key(Hit::server_received_time);
        (kept, dropped)
    }

    /// Owner to retarget to, per property and authoritative client id. The first
    /// conflict of a client wins and chains are followed to their end. Identifiers
    /// a retargeted client claimed in this batch are rebound to its new owner.
    async fn check_conflicts(&self, batch: &[Hit], props: &Properties) -> Result<Owners, ProtosessionError> {
        let mut requests = Vec::new();
        let mut scope = Vec::new();
        for h in batch {
            for r in conflict_requests(h, &property(props, h).settings) {
                requests.push(r);
                scope.push(h.property_id.as_str());
            }
        }
        if requests.is_empty() {
            return Ok(Owners::default());
        }

        let started = Instant::now();
        let results = self.backend.identifier_conflicts(&requests).await;
        answered_all("conflict", results.len(), requests.len())?;
        let mut direct: BTreeMap<&str, FxHashMap<ClientId, ClientId>> = BTreeMap::new();
        let mut claimed = Vec::new();
        for ((req, result), property_id) in requests.into_iter().zip(results).zip(scope) {
            match result.map_err(ProtosessionError::retry)? {
                ConflictCheck::ConflictsWith(owner) if owner != req.owner => {
                    direct.entry(property_id).or_default().entry(req.owner).or_insert(owner);
                }
                _ => claimed.push((property_id, req)),
            }
        }

        let mut owners = Owners::default();
        for (property_id, edges) in &direct {
            for client in edges.keys() {
                let owner = resolve_owner(edges, client);
                if owner != *client {
                    owners.insert((property_id.to_string(), client.clone()), owner);
                }
            }
        }

        let rebind: Vec<RebindIdentifier> = claimed
            .into_iter()
            .filter_map(|(property_id, r)| {
                let owner = owners.get(&(property_id.to_string(), r.owner.clone()))?;
                Some(RebindIdentifier { identifier: r.identifier, from: r.owner, owner: owner.clone() })
            })
            .collect();
        if !rebind.is_empty() {
            let results = self.backend.rebind_identifiers(&rebind).await;
            answered_all("rebind", results.len(), rebind.len())?;
            for (req, result) in rebind.iter().zip(results) {
                if let ConflictCheck::ConflictsWith(other) = result.map_err(ProtosessionError::retry)? {
                    warn!(identifier = %req.identifier.value, kind = req.identifier.kind.as_str(), holder = %other, "protosessions: identifier changed hands while rebinding");
                    return Err(ProtosessionError::retry(format!(
                        "{} identifier of {} is held by {other}",
                        req.identifier.kind.as_str(),
                        req.from
                    )));
                }
            }
            debug!(identifiers = rebind.len(), "protosessions: rebound identifiers to new owners");
        }
        histogram!("protosessions_conflict_check_ms", ms(started));
        Ok(owners)
    }

    async fn cleanup_dropped_and_evicted(
        &self,
        remove_hits: Vec<RemoveProtosessionHits>,
        dropped: &[Hit],
        props: &Properties,
    ) -> Result<(), ProtosessionError> {
        let mut by_property: BTreeMap<&str, Vec<Hit>> = BTreeMap::new();
        for h in dropped {
            by_property.entry(h.property_id.as_str()).or_default().push(h.clone());
        }
        let mut remove_ids = Vec::new();
        for (property_id, hits) in &by_property {
            remove_ids.extend(identifier_cleanup_requests(hits, &props[*property_id].settings));
        }
        if remove_hits.is_empty() && remove_ids.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let resp = self.backend.cleanup(&remove_hits, &remove_ids, &[]).await;
        histogram!("protosessions_cleanup_ms", ms(started));
        match resp.first_error() {
            Some(e) => Err(ProtosessionError::retry(e)),
            None => Ok(()),
        }
    }

    fn record_lag(&self, st: &mut ExpiryState, bucket: i64) {
        let now = self.wheel.bucket_number(Utc::now());
        let behind = u32::try_from((now - bucket).max(0)).unwrap_or(u32::MAX);
        let lag = self.wheel.tick_interval().saturating_mul(behind);
        gauge!("protosessions_processing_lag_seconds", lag.as_secs_f64());
        if lag > LAG_WARN_THRESHOLD && st.last_lag_warn.map_or(true, |t| t.elapsed() > LAG_WARN_EVERY) {
            warn!(lag_secs = lag.as_secs(), bucket, "protosessions: processing lag is high, catching up");
            st.last_lag_warn = Some(Instant::now());
        }
    }

    /// Sessions due in `bucket`, from the retry slot or the prefill worker.
    async fn due_sessions(&self, st: &mut ExpiryState, bucket: i64) -> Result<Vec<Vec<Hit>>> {
        if let Some((b, sessions)) = st.retry.take() {
            if b == bucket {
                debug!(bucket, sessions = sessions.len(), "protosessions: retrying bucket from slot");
                st.request(bucket + 1).await?;
                return Ok(sessions);
            }
            warn!(slot = b, bucket, "protosessions: discarding retry slot for another bucket");
        }
        st.request(bucket).await?;
        st.request(bucket + 1).await?;
        let started = Instant::now();
        let resp = st.receive(bucket, &self.cancel).await?;
        histogram!("protosessions_get_protosessions_ms", ms(started));
        resp.with_context(|| format!("loading proto-sessions of bucket {bucket}"))
    }

    async fn finalize(&self, bucket: i64, sessions: &[Vec<Hit>]) -> Result<usize> {
        let mut batch = Vec::with_capacity(sessions.len());
        let mut remove_hits = Vec::with_capacity(sessions.len());
        let mut remove_ids = Vec::new();
        let mut total = 0;
        for s in sessions {
            let Some(first) = s.first() else { continue };
            let settings = match self.registry.get_by_property_id(&first.property_id) {
                Ok(s) => s,
                Err(RegistryError::NotFound(p)) => {
                    warn!(property = %p, "protosessions: closing session of unknown property");
                    Settings { property_id: p, ..Settings::default() }
                }
                Err(e) => return Err(e).context("loading settings for closing sessions"),
            };
            let mut sorted = s.clone();
            sorted.sort_by_key(Hit::server_received_time);
            remove_ids.extend(identifier_cleanup_requests(&sorted, &settings));
            remove_hits.push(RemoveProtosessionHits {
                protosession_id: meta::isolated_client_id(&sorted[0]).to_string(),
                hit_ids: sorted.iter().map(|h| h.id.clone()).collect(),
                bucket,
            });
            total += sorted.len();
            batch.push(sorted);
        }

        if !batch.is_empty() {
            let started = Instant::now();
            self.closer.close(&batch).await.with_context(|| format!("closing {} sessions of bucket {bucket}", batch.len()))?;
            histogram!("protosessions_close_ms", ms(started));
            counter!("protosessions_hits_closed_total", total as u64);
            add(&self.stats.closed, total);
        }

        let started = Instant::now();
        let resp = self.backend.cleanup(&remove_hits, &remove_ids, &[RemoveBucket { bucket }]).await;
        histogram!("protosessions_cleanup_ms", ms(started));
        if let Some(e) = resp.first_error() {
            return Err(e.clone()).with_context(|| format!("cleaning up bucket {bucket}"));
        }
        Ok(batch.len())
    }
}

#[async_trait]
impl BucketProcessor for Inner {
    async fn process_bucket(&self, passed: i64) -> Result<TickOutcome> {
        let bucket = passed - 1;
        let started = Instant::now();
        let mut st = self.expiry.lock().await;
        self.record_lag(&mut st, bucket);

        let sessions = match self.due_sessions(&mut st, bucket).await {
            Ok(s) => s,
            Err(e) => {
                st.invalidate();
                return Err(e);
            }
        };
        match self.finalize(bucket, &sessions).await {
            Ok(closed) => {
                histogram!("protosessions_process_bucket_ms", ms(started));
                debug!(bucket, sessions = closed, took_ms = %started.elapsed().as_millis(), "protosessions: bucket finalized");
                Ok(TickOutcome::Advance)
            }
            Err(e) => {
                st.invalidate();
                st.retry = Some((bucket, sessions));
                Err(e)
            }
        }
    }
}

fn answered_all(what: &str, got: usize, sent: usize) -> Result<(), ProtosessionError> {
    if got == sent {
        return Ok(());
    }
    Err(ProtosessionError::retry(format!("backend answered {got} of {sent} {what} requests")))
}

/// Follow retargets to the final owner; inside a cycle the smallest id owns it.
fn resolve_owner(direct: &FxHashMap<ClientId, ClientId>, start: &ClientId) -> ClientId {
    let mut path = vec![start];
    let mut cur = start;
    while let Some(next) = direct.get(cur) {
        if let Some(pos) = path.iter().position(|p| *p == next) {
            return path[pos..].iter().min().map_or_else(|| next.clone(), |p| (*p).clone());
        }
        path.push(next);
        cur = next;
    }
    cur.clone()
}

/// Serves bucket requests off the expiry path.
async fn prefill(
    backend: Arc<dyn BatchedBackend>,
    mut requests: mpsc::Receiver<Prefetch>,
    responses: mpsc::Sender<(Prefetch, BucketResponse)>,
    cancel: CancellationToken,
    backoff: Duration,
) {
    loop {
        let (generation, bucket) = tokio::select! {
            _ = cancel.cancelled() => break,
            r = requests.recv() => match r {
                Some(req) => req,
                None => break,
            },
        };
        let wanted = [bucket];
        let fetched = tokio::select! {
            _ = cancel.cancelled() => break,
            r = backend.protosessions_for_buckets(&wanted) => r,
        };
        let resp = fetched
            .into_iter()
            .next()
            .unwrap_or_else(|| Err(BackendError::MissingResponse(0)));
        if let Err(e) = &resp {
            error!(bucket, error = %e, "protosessions: prefetch failed");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
        if responses.send(((generation, bucket), resp)).await.is_err() {
            break;
        }
    }
    debug!("protosessions: prefill worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::NoIsolationFactory;
    use crate::testing::{RecordingCloser, RecordingRequeuer, RecordingWheelState, TestBackend};
    use stitch_core::StaticSettingsRegistry;

    fn registry() -> Arc<dyn SettingsRegistry> {
        Arc::new(StaticSettingsRegistry::new([Settings {
            property_id: "p".into(),
            session_timeout: Duration::from_secs(60),
            ..Settings::default()
        }]))
    }

    fn build(backend: TestBackend) -> Orchestrator {
        Orchestrator::builder()
            .backend(Arc::new(backend))
            .wheel_state(Arc::new(RecordingWheelState::new()))
            .closer(Arc::new(RecordingCloser::new()))
            .requeuer(Arc::new(RecordingRequeuer::new()))
            .registry(registry())
            .isolation(Arc::new(NoIsolationFactory))
            .spawn_wheel(false)
            .build()
            .unwrap()
    }

    fn hit(property: &str, client: &str) -> Hit {
        Hit::new(property, client, "2025-01-01T12:00:00Z".parse().unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_hits_are_droppable() {
        let o = build(TestBackend::new());
        let mut bad = hit("p", "a");
        bad.property_id.clear();
        let err = o.process_batch(vec![hit("p", "a"), bad]).await.unwrap_err();
        assert!(!err.is_retryable());
        o.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_properties_are_skipped() {
        let o = build(TestBackend::new());
        o.process_batch(vec![hit("p", "a"), hit("nope", "b")]).await.unwrap();
        assert_eq!(o.stats().hits_received, 1);
        o.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn backend_errors_are_retryable() {
        let o = build(TestBackend::new().with_marks(|_| Err(crate::errors::BackendError::Other("disk full".into()))));
        let err = o.process_batch(vec![hit("p", "a")]).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(o.wheel().current_time(), None);
        o.stop().await.unwrap();
    }

    struct FlakyRegistry;

    impl SettingsRegistry for FlakyRegistry {
        fn get_by_property_id(&self, _: &str) -> Result<Settings, RegistryError> {
            Err(RegistryError::Unavailable("timeout".into()))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn registry_failures_are_retryable() {
        let o = Orchestrator::builder()
            .backend(Arc::new(TestBackend::new()))
            .wheel_state(Arc::new(RecordingWheelState::new()))
            .closer(Arc::new(RecordingCloser::new()))
            .requeuer(Arc::new(RecordingRequeuer::new()))
            .registry(Arc::new(FlakyRegistry))
            .spawn_wheel(false)
            .build()
            .unwrap();
        assert!(o.process_batch(vec![hit("p", "a")]).await.unwrap_err().is_retryable());
        o.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn builder_requires_collaborators() {
        assert!(Orchestrator::builder().build().is_err());
    }

    #[test]
    fn owners_resolve_through_chains_and_cycles() {
        let edges: FxHashMap<ClientId, ClientId> =
            [("c", "b"), ("b", "a"), ("x", "y"), ("y", "z"), ("z", "x")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
        assert_eq!(resolve_owner(&edges, &"c".to_string()), "a");
        assert_eq!(resolve_owner(&edges, &"b".to_string()), "a");
        assert_eq!(resolve_owner(&edges, &"a".to_string()), "a");
        for start in ["x", "y", "z"] {
            assert_eq!(resolve_owner(&edges, &start.to_string()), "x");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn seeding_releases_every_lock() {
        let o = build(TestBackend::new());
        let mut hits = Vec::new();
        for i in 0..10 {
            let mut h = hit("p", &format!("c{i}"));
            h.request.server_received_time += chrono::Duration::seconds(i * 7);
            hits.push(h);
        }
        o.process_batch(hits).await.unwrap();
        assert!(o.wheel().locks().is_empty());
        o.stop().await.unwrap();
    }

    /// Drops every fetch response.
    struct ShortFetches(TestBackend);

    #[async_trait]
    impl BatchedBackend for ShortFetches {
        async fn identifier_conflicts(
            &self,
            requests: &[crate::batched::ConflictRequest],
        ) -> Vec<Result<ConflictCheck, BackendError>> {
            self.0.identifier_conflicts(requests).await
        }

        async fn rebind_identifiers(&self, requests: &[RebindIdentifier]) -> Vec<Result<ConflictCheck, BackendError>> {
            self.0.rebind_identifiers(requests).await
        }

        async fn handle_batch(
            &self,
            appends: &[AppendHits],
            fetches: &[GetProtosessionHits],
            marks: &[MarkBucket],
        ) -> crate::batched::BatchResponses {
            let mut resp = self.0.handle_batch(appends, fetches, marks).await;
            resp.fetches.clear();
            resp
        }

        async fn protosessions_for_buckets(&self, buckets: &[i64]) -> Vec<BucketResponse> {
            self.0.protosessions_for_buckets(buckets).await
        }

        async fn cleanup(
            &self,
            hits: &[RemoveProtosessionHits],
            identifiers: &[crate::batched::RemoveIdentifier],
            buckets: &[RemoveBucket],
        ) -> crate::batched::CleanupResponses {
            self.0.cleanup(hits, identifiers, buckets).await
        }

        async fn stop(&self) -> Result<(), BackendError> { self.0.stop().await }
    }

    fn stamp_owned_by_a() -> TestBackend {
        TestBackend::new().with_conflicts(|r| {
            Ok(match (r.identifier.kind, r.owner.as_str()) {
                (crate::batched::IdentifierKind::SessionStamp, "b") => ConflictCheck::ConflictsWith("a".into()),
                _ => ConflictCheck::Clear,
            })
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_fetch_responses_are_retryable() {
        let o = Orchestrator::builder()
            .backend(Arc::new(ShortFetches(stamp_owned_by_a())))
            .wheel_state(Arc::new(RecordingWheelState::new()))
            .closer(Arc::new(RecordingCloser::new()))
            .requeuer(Arc::new(RecordingRequeuer::new()))
            .registry(registry())
            .isolation(Arc::new(NoIsolationFactory))
            .eviction(EvictionStrategy::EvictWholeProtosession)
            .spawn_wheel(false)
            .build()
            .unwrap();
        let err = o.process_batch(vec![hit("p", "b")]).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("0 of 1 fetch"), "{err}");
        assert_eq!(o.wheel().current_time(), None);
        o.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn identifiers_claimed_by_a_retargeted_client_are_rebound_in_place() {
        let seen: Arc<Mutex<Vec<RebindIdentifier>>> = Arc::default();
        let released: Arc<Mutex<usize>> = Arc::default();
        let (log, count) = (seen.clone(), released.clone());
        let backend = stamp_owned_by_a()
            .with_rebinds(move |r| {
                log.lock().unwrap().push(r.clone());
                Ok(ConflictCheck::Clear)
            })
            .with_remove_identifiers(move |_| {
                *count.lock().unwrap() += 1;
                Ok(())
            });
        let o = build(backend);
        let mut b = hit("p", "b");
        b.user_id = Some("u".into());
        o.process_batch(vec![b]).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].identifier.kind, crate::batched::IdentifierKind::UserId);
        assert_eq!((seen[0].from.as_str(), seen[0].owner.as_str()), ("b", "a"));
        assert_eq!(*released.lock().unwrap(), 0);
        o.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rebinding_onto_a_foreign_holder_is_retryable() {
        let o = build(stamp_owned_by_a().with_rebinds(|_| Ok(ConflictCheck::ConflictsWith("c".into()))));
        let mut b = hit("p", "b");
        b.user_id = Some("u".into());
        let err = o.process_batch(vec![b]).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("held by c"), "{err}");
        assert_eq!(o.stats().hits_received, 0);
        o.stop().await.unwrap();
    }
}
