//! Metadata keys the orchestrator stamps on hits.

use stitch_core::{ClientId, Hit};

pub const ORIGINAL_AUTHORITATIVE_CLIENT_ID: &str = "original_authoritative_client_id";
pub const MARKED_FOR_EVICTION: &str = "marked_for_eviction";
pub const ISOLATED_CLIENT_ID: &str = "isolated_client_id";
pub const ISOLATED_SESSION_STAMP: &str = "isolated_session_stamp";
pub const ISOLATED_USER_ID: &str = "isolated_user_id";

/// Record the current owner as the original one, flag the hit and retarget it to `owner`.
pub fn mark_for_eviction(hit: &mut Hit, owner: &ClientId) {
    hit.metadata.insert(ORIGINAL_AUTHORITATIVE_CLIENT_ID.to_string(), hit.authoritative_client_id.clone());
    hit.metadata.insert(MARKED_FOR_EVICTION.to_string(), "true".to_string());
    hit.authoritative_client_id = owner.clone();
}

pub fn is_marked_for_eviction(hit: &Hit) -> bool {
    hit.metadata.get(MARKED_FOR_EVICTION).is_some_and(|v| v == "true")
}

pub fn original_authoritative_client_id(hit: &Hit) -> Option<&str> {
    hit.metadata.get(ORIGINAL_AUTHORITATIVE_CLIENT_ID).map(String::as_str)
}

pub fn set_isolated_client_id(hit: &mut Hit, id: ClientId) {
    hit.metadata.insert(ISOLATED_CLIENT_ID.to_string(), id);
}

/// Proto-session id of a hit; falls back to the authoritative client id.
pub fn isolated_client_id(hit: &Hit) -> &str {
    hit.metadata.get(ISOLATED_CLIENT_ID).map(String::as_str).unwrap_or(&hit.authoritative_client_id)
}

pub fn set_session_stamp(hit: &mut Hit, stamp: String) {
    hit.metadata.insert(ISOLATED_SESSION_STAMP.to_string(), stamp);
}

pub fn session_stamp(hit: &Hit) -> Option<&str> {
    hit.metadata.get(ISOLATED_SESSION_STAMP).map(String::as_str)
}

pub fn set_user_id_stamp(hit: &mut Hit, stamp: String) {
    hit.metadata.insert(ISOLATED_USER_ID.to_string(), stamp);
}

pub fn user_id_stamp(hit: &Hit) -> Option<&str> {
    hit.metadata.get(ISOLATED_USER_ID).map(String::as_str)
}
