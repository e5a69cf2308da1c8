//! Sinks for closed sessions and evicted hits.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use stitch_core::Hit;
use tokio::sync::mpsc;
use tracing::info;

use crate::meta;

/// Receives finished sessions, each sorted by server received time.
#[async_trait]
pub trait Closer: Send + Sync {
    async fn close(&self, sessions: &[Vec<Hit>]) -> Result<()>;
}

/// Reinjects evicted hits into the ingest stream.
#[async_trait]
pub trait Requeuer: Send + Sync {
    async fn push(&self, hits: Vec<Hit>) -> Result<()>;
}

pub fn fnv1a_32(data: &[u8]) -> u32 {
    data.iter().fold(0x811c_9dc5_u32, |h, b| (h ^ u32::from(*b)).wrapping_mul(0x0100_0193))
}

/// Fans sessions out to child closers by a hash of their proto-session id.
pub struct ShardingCloser {
    children: Vec<Arc<dyn Closer>>,
}

impl ShardingCloser {
    pub fn new(children: Vec<Arc<dyn Closer>>) -> Self { Self { children } }

    pub fn shard_of(&self, session: &[Hit]) -> usize {
        let n = self.children.len().max(1);
        let id = session.first().map(meta::isolated_client_id).unwrap_or_default();
        fnv1a_32(id.as_bytes()) as usize % n
    }
}

#[async_trait]
impl Closer for ShardingCloser {
    async fn close(&self, sessions: &[Vec<Hit>]) -> Result<()> {
        if self.children.is_empty() {
            anyhow::bail!("sharding closer has no children");
        }
        let mut shards: Vec<Vec<Vec<Hit>>> = vec![Vec::new(); self.children.len()];
        for s in sessions {
            shards[self.shard_of(s)].push(s.clone());
        }
        let calls = self.children.iter().zip(&shards).enumerate().filter(|(_, (_, batch))| !batch.is_empty()).map(
            |(i, (child, batch))| async move { child.close(batch).await.with_context(|| format!("closer shard {i}")) },
        );
        join_all(calls).await.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }
}

/// Logs one line per closed session.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCloser;

#[async_trait]
impl Closer for LoggingCloser {
    async fn close(&self, sessions: &[Vec<Hit>]) -> Result<()> {
        for s in sessions {
            let (Some(first), Some(last)) = (s.first(), s.last()) else { continue };
            info!(
                session = %meta::isolated_client_id(first),
                property = %first.property_id,
                hits = s.len(),
                start = %first.server_received_time(),
                end = %last.server_received_time(),
                "session closed"
            );
        }
        Ok(())
    }
}

/// Forwards evicted hits into a tokio channel.
#[derive(Clone)]
pub struct ChannelRequeuer {
    tx: mpsc::Sender<Vec<Hit>>,
}

impl ChannelRequeuer {
    pub fn new(tx: mpsc::Sender<Vec<Hit>>) -> Self { Self { tx } }
}

#[async_trait]
impl Requeuer for ChannelRequeuer {
    async fn push(&self, hits: Vec<Hit>) -> Result<()> {
        self.tx.send(hits).await.map_err(|_| anyhow::anyhow!("requeue channel closed"))
    }
}
