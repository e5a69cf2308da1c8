//! Event-time timing wheel.
//!
//! Buckets are `tick` wide slices of event time. The wheel only moves as fast
//! as the hits it has seen: a bucket becomes due once the newest observed hit
//! lies in a later bucket. The position is persisted through a
//! [`WheelStateBackend`] and never moves backwards.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::wheel_state::WheelStateBackend;

type BucketMutex = Arc<tokio::sync::Mutex<()>>;

/// Lazily populated per-bucket mutexes; an entry lives while somebody holds or waits on it.
#[derive(Clone, Default)]
pub struct BucketLocks {
    map: Arc<Mutex<FxHashMap<i64, BucketMutex>>>,
}

impl BucketLocks {
    pub fn new() -> Self { Self::default() }

    fn map(&self) -> MutexGuard<'_, FxHashMap<i64, BucketMutex>> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry(&self, bucket: i64) -> BucketMutex {
        self.map().entry(bucket).or_default().clone()
    }

    fn release(&self, bucket: i64, mutex: BucketMutex) {
        let mut map = self.map();
        drop(mutex);
        if map.get(&bucket).is_some_and(|m| Arc::strong_count(m) == 1) {
            map.remove(&bucket);
        }
    }

    /// Non-blocking probe used by the ingest path.
    pub fn try_lock(&self, bucket: i64) -> Option<BucketGuard> {
        let mutex = self.entry(bucket);
        match mutex.clone().try_lock_owned() {
            Ok(guard) => Some(BucketGuard { bucket, guard: Some(guard), mutex: Some(mutex), locks: self.clone() }),
            Err(_) => {
                self.release(bucket, mutex);
                None
            }
        }
    }

    pub async fn lock(&self, bucket: i64) -> BucketGuard {
        let mutex = self.entry(bucket);
        let guard = mutex.clone().lock_owned().await;
        BucketGuard { bucket, guard: Some(guard), mutex: Some(mutex), locks: self.clone() }
    }

    /// Number of buckets currently held or awaited.
    pub fn len(&self) -> usize { self.map().len() }
    pub fn is_empty(&self) -> bool { self.map().is_empty() }
}

pub struct BucketGuard {
    bucket: i64,
    guard: Option<OwnedMutexGuard<()>>,
    mutex: Option<BucketMutex>,
    locks: BucketLocks,
}

impl BucketGuard {
    pub fn bucket(&self) -> i64 { self.bucket }
}

impl Drop for BucketGuard {
    fn drop(&mut self) {
        self.guard.take();
        if let Some(mutex) = self.mutex.take() {
            self.locks.release(self.bucket, mutex);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Bucket finished; persist the next one.
    Advance,
    /// Leave the position unchanged.
    Noop,
}

#[async_trait]
pub trait BucketProcessor: Send + Sync {
    async fn process_bucket(&self, bucket: i64) -> Result<TickOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickReport {
    /// No hit observed yet.
    Idle,
    /// Fresh state initialized at this bucket.
    Initialized(i64),
    NotDue { next: i64, current: i64 },
    Processed { bucket: i64, outcome: TickOutcome },
}

#[derive(Debug, Default, Clone, Copy)]
struct Clock {
    current: Option<DateTime<Utc>>,
    first: Option<DateTime<Utc>>,
}

pub struct TimingWheel {
    tick: Duration,
    state: Arc<dyn WheelStateBackend>,
    locks: BucketLocks,
    clock: Mutex<Clock>,
    // one tick at a time, whether from the loop or a manual call
    stepping: tokio::sync::Mutex<()>,
}

impl TimingWheel {
    pub fn new(tick: Duration, state: Arc<dyn WheelStateBackend>) -> Self {
        Self {
            tick,
            state,
            locks: BucketLocks::new(),
            clock: Mutex::new(Clock::default()),
            stepping: tokio::sync::Mutex::new(()),
        }
    }

    fn clock(&self) -> MutexGuard<'_, Clock> { self.clock.lock().unwrap_or_else(|e| e.into_inner()) }

    pub fn tick_interval(&self) -> Duration { self.tick }
    pub fn locks(&self) -> &BucketLocks { &self.locks }

    fn tick_ms(&self) -> i64 { (self.tick.as_millis() as i64).max(1) }

    pub fn bucket_number(&self, t: DateTime<Utc>) -> i64 { t.timestamp_millis().div_euclid(self.tick_ms()) }

    /// Bucket in which a hit received at `t` expires.
    pub fn expiry_bucket(&self, t: DateTime<Utc>, timeout: Duration) -> i64 {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        self.bucket_number(t.checked_add_signed(timeout).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }

    /// Advance event time; older timestamps are ignored.
    pub fn update_time(&self, t: DateTime<Utc>) {
        let mut c = self.clock();
        if c.current.map_or(true, |cur| t > cur) {
            if c.first.is_none() {
                c.first = Some(t);
            }
            c.current = Some(t);
        }
    }

    pub fn current_time(&self) -> Option<DateTime<Utc>> { self.clock().current }

    pub fn current_bucket(&self) -> Option<i64> { self.current_time().map(|t| self.bucket_number(t)) }

    pub async fn tick(&self, processor: &dyn BucketProcessor) -> Result<TickReport> {
        let _stepping = self.stepping.lock().await;
        let clock = *self.clock();
        let Clock { current: Some(current), first: Some(first) } = clock else {
            trace!("timing wheel: no hits yet");
            return Ok(TickReport::Idle);
        };

        let next = self.state.next_bucket().await.context("loading next bucket")?;
        if next == -1 {
            let bucket = self.bucket_number(first);
            self.state.save_next_bucket(bucket).await.context("initializing next bucket")?;
            debug!(bucket, "timing wheel: initialized");
            return Ok(TickReport::Initialized(bucket));
        }

        let current = self.bucket_number(current);
        if next >= current {
            trace!(next, current, "timing wheel: bucket not due");
            return Ok(TickReport::NotDue { next, current });
        }

        let _held = self.locks.lock(current).await;
        debug!(next, current, "timing wheel: processing bucket");
        let outcome = processor.process_bucket(next).await.with_context(|| format!("processing bucket {next}"))?;
        if outcome == TickOutcome::Advance {
            self.state.save_next_bucket(next + 1).await.with_context(|| format!("saving next bucket {}", next + 1))?;
        }
        Ok(TickReport::Processed { bucket: next, outcome })
    }

    /// Tick until cancelled; catches up without sleeping while buckets keep advancing.
    pub async fn run(&self, processor: &dyn BucketProcessor, cancel: CancellationToken) {
        let mut sleep = self.tick;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("timing wheel: stopped");
                    return;
                }
                _ = tokio::time::sleep(sleep) => {}
            }
            sleep = match self.tick(processor).await {
                Ok(TickReport::Processed { outcome: TickOutcome::Advance, .. }) => Duration::ZERO,
                Ok(_) => self.tick,
                Err(e) => {
                    error!(error = ?e, "timing wheel: tick failed");
                    self.tick
                }
            };
        }
    }
}
