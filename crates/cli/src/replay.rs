//! JSONL replay through the orchestrator.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use stitch_core::{CborCodec, Hit, HitCodec, JsonCodec, SettingsRegistry};
use stitch_persist::SqliteStorage;
use stitch_sessions::meta;
use stitch_sessions::{
    ping_task, BatchedBackend, ChannelRequeuer, Closer, DeduplicatingBackend, EvictionStrategy,
    IsolationGuardFactory, KvWheelState, LoggingCloser, NaiveBackend, Orchestrator, ShardingCloser, Task, TaskError,
    Worker,
};
use stitch_store::{InMemoryKv, InMemorySet, Kv, SetStore};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const SUBMIT_ATTEMPTS: u32 = 3;

#[derive(Debug)]
pub struct Options {
    pub input: Option<PathBuf>,
    /// `Some(None)` opens the default database path.
    pub sqlite: Option<Option<String>>,
    pub cbor: bool,
    pub eviction: EvictionStrategy,
    pub dedup: bool,
    pub log_sessions: bool,
    pub tick: Duration,
    pub batch_size: usize,
    pub queue_cap: usize,
    pub shards: usize,
    pub wheel_name: String,
    pub longest_timeout: Duration,
}

type Input = Lines<BufReader<Box<dyn AsyncRead + Unpin + Send>>>;

async fn open_input(path: Option<&Path>) -> Result<Input> {
    let reader: Box<dyn AsyncRead + Unpin + Send> = match path {
        Some(p) => Box::new(tokio::fs::File::open(p).await.with_context(|| format!("opening {}", p.display()))?),
        None => Box::new(tokio::io::stdin()),
    };
    Ok(BufReader::new(reader).lines())
}

/// Blank lines and `#` comments yield `None`.
fn parse_hit(line: &str, n: usize) -> Result<Option<Hit>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let hit = serde_json::from_str::<Hit>(line).with_context(|| format!("line {n}: not a hit"))?.fill_defaults();
    hit.validate().with_context(|| format!("line {n}"))?;
    Ok(Some(hit))
}

#[derive(Serialize)]
struct ClosedSession<'a> {
    shard: usize,
    session_id: &'a str,
    property_id: &'a str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    hits: &'a [Hit],
}

/// Writes one JSON line per session to stdout.
struct JsonLinesCloser {
    shard: usize,
}

#[async_trait]
impl Closer for JsonLinesCloser {
    async fn close(&self, sessions: &[Vec<Hit>]) -> Result<()> {
        let mut buf = String::new();
        for s in sessions {
            let (Some(first), Some(last)) = (s.first(), s.last()) else { continue };
            let line = serde_json::to_string(&ClosedSession {
                shard: self.shard,
                session_id: meta::isolated_client_id(first),
                property_id: &first.property_id,
                start: first.server_received_time(),
                end: last.server_received_time(),
                hits: s,
            })?;
            buf.push_str(&line);
            buf.push('\n');
        }
        std::io::stdout().lock().write_all(buf.as_bytes()).context("writing closed sessions")?;
        counter!("stitchctl_sessions_written_total", sessions.len() as u64);
        Ok(())
    }
}

async fn submit(worker: &Worker, hits: Vec<Hit>, backoff: Duration) {
    if hits.is_empty() {
        return;
    }
    for attempt in 1..=SUBMIT_ATTEMPTS {
        match worker.handle(Task::hits(hits.clone())).await {
            Ok(()) => return,
            Err(TaskError::Retry(e)) if attempt < SUBMIT_ATTEMPTS => {
                debug!(attempt, error = %e, "replay: retrying batch");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                error!(hits = hits.len(), kind = e.as_str(), error = %e, "replay: giving up on batch");
                counter!("stitchctl_batches_failed_total", 1);
                return;
            }
        }
    }
}

/// Feed back requeued hits until none are left.
async fn drain(worker: &Worker, requeued: &mut mpsc::Receiver<Vec<Hit>>, backoff: Duration) {
    while let Ok(hits) = requeued.try_recv() {
        submit(worker, hits, backoff).await;
    }
}

fn stores(sqlite: Option<&Option<String>>) -> Result<(Arc<dyn Kv>, Arc<dyn SetStore>)> {
    let Some(path) = sqlite else {
        let kv: Arc<dyn Kv> = Arc::new(InMemoryKv::new());
        let sets: Arc<dyn SetStore> = Arc::new(InMemorySet::new());
        return Ok((kv, sets));
    };
    let db = Arc::new(match path {
        Some(p) => SqliteStorage::open(p)?,
        None => SqliteStorage::open_default()?,
    });
    let kv: Arc<dyn Kv> = db.clone();
    let sets: Arc<dyn SetStore> = db;
    Ok((kv, sets))
}

pub async fn run(
    opts: Options,
    registry: Arc<dyn SettingsRegistry>,
    guards: Arc<dyn IsolationGuardFactory>,
) -> Result<()> {
    let (kv, sets) = stores(opts.sqlite.as_ref())?;
    let codec: Arc<dyn HitCodec> = if opts.cbor { Arc::new(CborCodec) } else { Arc::new(JsonCodec) };
    let naive = NaiveBackend::new(kv.clone(), sets, codec);
    let backend: Arc<dyn BatchedBackend> =
        if opts.dedup { Arc::new(DeduplicatingBackend::new(naive)) } else { Arc::new(naive) };
    let children: Vec<Arc<dyn Closer>> = (0..opts.shards)
        .map(|shard| -> Arc<dyn Closer> {
            if opts.log_sessions { Arc::new(LoggingCloser) } else { Arc::new(JsonLinesCloser { shard }) }
        })
        .collect();

    let (tx, mut requeued) = mpsc::channel(opts.queue_cap);
    let orchestrator = Arc::new(
        Orchestrator::builder()
            .backend(backend)
            .wheel_state(Arc::new(KvWheelState::new(kv, &opts.wheel_name)))
            .closer(Arc::new(ShardingCloser::new(children)))
            .requeuer(Arc::new(ChannelRequeuer::new(tx)))
            .registry(registry)
            .eviction(opts.eviction)
            .isolation(guards)
            .tick(opts.tick)
            .build()?,
    );
    let worker = Worker::new(orchestrator.clone());

    let mut lines = open_input(opts.input.as_deref()).await?;
    let mut batch = Vec::with_capacity(opts.batch_size);
    let mut line_no = 0usize;
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            biased;
            _ = &mut interrupted => {
                warn!("replay: interrupted, closing open sessions");
                break;
            }
            Some(hits) = requeued.recv() => submit(&worker, hits, opts.tick).await,
            line = lines.next_line() => {
                let Some(line) = line.context("reading input")? else { break };
                line_no += 1;
                match parse_hit(&line, line_no) {
                    Ok(Some(hit)) => {
                        batch.push(hit);
                        if batch.len() >= opts.batch_size {
                            submit(&worker, std::mem::take(&mut batch), opts.tick).await;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "replay: skipping malformed line");
                        counter!("stitchctl_malformed_lines_total", 1);
                    }
                }
            }
        }
    }
    submit(&worker, std::mem::take(&mut batch), opts.tick).await;
    drain(&worker, &mut requeued, opts.tick).await;

    let mut closed = 0;
    if let Some(t) = orchestrator.wheel().current_time() {
        let horizon = chrono::Duration::from_std(opts.longest_timeout + opts.tick * 2).context("session horizon")?;
        let until = t.checked_add_signed(horizon).context("session horizon overflows")?;
        worker.handle(ping_task(until)).await?;
        closed = orchestrator.catch_up().await.context("closing remaining sessions")?;
        drain(&worker, &mut requeued, opts.tick).await;
    }
    orchestrator.stop().await?;
    info!(lines = line_no, buckets = closed, stats = ?orchestrator.stats(), "replay finished");
    Ok(())
}

#[derive(Serialize)]
struct IsolatedIds<'a> {
    id: &'a str,
    property_id: &'a str,
    isolated_client_id: String,
    session_stamp: String,
    user_id: Option<String>,
}

pub async fn print_ids(
    input: Option<PathBuf>,
    registry: &dyn SettingsRegistry,
    guards: &dyn IsolationGuardFactory,
) -> Result<()> {
    let mut lines = open_input(input.as_deref()).await?;
    let mut n = 0;
    while let Some(line) = lines.next_line().await.context("reading input")? {
        n += 1;
        let Some(hit) = parse_hit(&line, n)? else { continue };
        let guard = guards.guard(&registry.get_by_property_id(&hit.property_id)?);
        let user_id = hit.user_id.as_ref().map(|_| guard.isolated_user_id(&hit)).transpose()?;
        let ids = IsolatedIds {
            id: &hit.id,
            property_id: &hit.property_id,
            isolated_client_id: guard.isolated_client_id(&hit)?,
            session_stamp: guard.isolated_session_stamp(&hit)?,
            user_id,
        };
        println!("{}", serde_json::to_string(&ids)?);
    }
    Ok(())
}
