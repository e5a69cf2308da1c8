//! Builders for identifier claim and release requests.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use stitch_core::{Hit, Settings};

use crate::batched::{ConflictRequest, Identifier, IdentifierKind, RemoveIdentifier};
use crate::meta;

fn identifiers(hit: &Hit, settings: &Settings) -> SmallVec<[Identifier; 2]> {
    let mut out = SmallVec::new();
    if settings.session_join_by_session_stamp {
        if let Some(stamp) = meta::session_stamp(hit) {
            out.push(Identifier::new(IdentifierKind::SessionStamp, stamp));
        }
    }
    if settings.session_join_by_user_id && hit.user_id.is_some() {
        if let Some(user) = meta::user_id_stamp(hit) {
            out.push(Identifier::new(IdentifierKind::UserId, user));
        }
    }
    out
}

/// One claim per enabled join, owned by the hit's current owner.
pub fn conflict_requests(hit: &Hit, settings: &Settings) -> SmallVec<[ConflictRequest; 2]> {
    identifiers(hit, settings)
        .into_iter()
        .map(|identifier| ConflictRequest { identifier, owner: hit.authoritative_client_id.clone() })
        .collect()
}

/// Release requests for every distinct identifier the hits claimed.
pub fn identifier_cleanup_requests(hits: &[Hit], settings: &Settings) -> Vec<RemoveIdentifier> {
    let mut seen = FxHashSet::default();
    let mut out = Vec::new();
    for hit in hits {
        for identifier in identifiers(hit, settings) {
            if seen.insert(identifier.clone()) {
                out.push(RemoveIdentifier { identifier });
            }
        }
    }
    out
}
