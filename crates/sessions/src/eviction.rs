//! What happens to a hit whose identifiers are already owned by another client.

use std::collections::BTreeMap;

use stitch_core::{ClientId, Hit};

use crate::meta;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvictionStrategy {
    /// Retarget the hit to the owner and save it with the rest of the batch.
    #[default]
    RewriteInPlace,
    /// Retarget the hit and requeue it together with the owner's stored proto-session.
    EvictWholeProtosession,
}

impl EvictionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RewriteInPlace => "rewrite",
            Self::EvictWholeProtosession => "evict-whole",
        }
    }

    pub fn apply(
        &self,
        mut hit: Hit,
        owner: &ClientId,
        to_save: &mut Vec<Hit>,
        for_eviction: &mut BTreeMap<ClientId, Vec<Hit>>,
    ) {
        meta::mark_for_eviction(&mut hit, owner);
        match self {
            Self::RewriteInPlace => to_save.push(hit),
            Self::EvictWholeProtosession => for_eviction.entry(owner.clone()).or_default().push(hit),
        }
    }
}
