//! Property-scoped fingerprints for client ids, session stamps and user ids.
//!
//! Every fingerprint mixes in the property id so identical raw values from
//! different properties never collide. The header/IP session stamp is salted
//! with the UTC day of the hit's server received time.

use sha2::{Digest, Sha256};
use stitch_core::{ClientId, Hit, Settings};

/// Headers that make up the browser fingerprint of a session stamp.
pub const FINGERPRINT_HEADERS: [&str; 10] = [
    "Accept",
    "Accept-Encoding",
    "Accept-Language",
    "User-Agent",
    "Sec-CH-UA",
    "Sec-CH-UA-Mobile",
    "Sec-CH-UA-Platform",
    "Sec-CH-UA-Platform-Version",
    "Sec-CH-UA-Model",
    "Sec-CH-UA-Full-Version",
];

/// Query parameter that forces an explicit session stamp.
pub const FORCED_STAMP_PARAM: &str = "fss";

/// Client-provided stamp; an empty value means none.
fn forced_stamp(hit: &Hit) -> Option<&str> { hit.request.query_param(FORCED_STAMP_PARAM).filter(|v| !v.is_empty()) }

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IsolationError {
    #[error("hit {0} has no user id")]
    MissingUserId(String),
}

pub trait IsolationGuard: Send + Sync {
    fn isolated_client_id(&self, hit: &Hit) -> Result<ClientId, IsolationError>;
    fn isolated_session_stamp(&self, hit: &Hit) -> Result<String, IsolationError>;
    fn isolated_user_id(&self, hit: &Hit) -> Result<String, IsolationError>;
}

/// Builds a guard for one property's settings.
pub trait IsolationGuardFactory: Send + Sync {
    fn guard(&self, settings: &Settings) -> Box<dyn IsolationGuard>;
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

fn fingerprint(hit: &Hit) -> String {
    let mut parts: Vec<&str> = FINGERPRINT_HEADERS.iter().map(|h| hit.request.header(h).unwrap_or("")).collect();
    parts.push(&hit.request.ip);
    parts.join("|")
}

fn day(hit: &Hit) -> String {
    hit.server_received_time().format("%Y-%m-%d").to_string()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultIsolationFactory;

impl IsolationGuardFactory for DefaultIsolationFactory {
    fn guard(&self, _settings: &Settings) -> Box<dyn IsolationGuard> { Box::new(DefaultIsolationGuard) }
}

/// Hashing guard used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultIsolationGuard;

impl IsolationGuard for DefaultIsolationGuard {
    fn isolated_client_id(&self, hit: &Hit) -> Result<ClientId, IsolationError> {
        Ok(sha256_hex(&format!("{}|{}", hit.property_id, hit.authoritative_client_id)))
    }

    fn isolated_session_stamp(&self, hit: &Hit) -> Result<String, IsolationError> {
        if let Some(forced) = forced_stamp(hit) {
            return Ok(sha256_hex(&format!("{FORCED_STAMP_PARAM}={forced}|{}", hit.property_id)));
        }
        Ok(sha256_hex(&format!("{}|{}|{}", fingerprint(hit), hit.property_id, day(hit))))
    }

    fn isolated_user_id(&self, hit: &Hit) -> Result<String, IsolationError> {
        let user = hit.user_id.as_deref().ok_or_else(|| IsolationError::MissingUserId(hit.id.clone()))?;
        Ok(sha256_hex(&format!("{}|{}", hit.property_id, user)))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoIsolationFactory;

impl IsolationGuardFactory for NoIsolationFactory {
    fn guard(&self, _settings: &Settings) -> Box<dyn IsolationGuard> { Box::new(NoIsolationGuard) }
}

/// Passes raw identifiers through. Meant for debugging single-property setups.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIsolationGuard;

impl IsolationGuard for NoIsolationGuard {
    fn isolated_client_id(&self, hit: &Hit) -> Result<ClientId, IsolationError> {
        Ok(hit.authoritative_client_id.clone())
    }

    fn isolated_session_stamp(&self, hit: &Hit) -> Result<String, IsolationError> {
        if let Some(forced) = forced_stamp(hit) {
            return Ok(sha256_hex(&format!("{FORCED_STAMP_PARAM}={forced}")));
        }
        Ok(sha256_hex(&format!("{}|{}", fingerprint(hit), day(hit))))
    }

    fn isolated_user_id(&self, hit: &Hit) -> Result<String, IsolationError> {
        hit.user_id.clone().ok_or_else(|| IsolationError::MissingUserId(hit.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn hit(property: &str, t: &str) -> Hit {
        let t: DateTime<Utc> = t.parse().unwrap();
        let mut h = Hit::new(property, "client-a", t);
        h.request.ip = "10.1.2.3".into();
        h.request.headers.insert("User-Agent".into(), vec!["Mozilla/5.0".into()]);
        h.request.headers.insert("Accept-Language".into(), vec!["en-US".into()]);
        h
    }

    #[test]
    fn stamp_rotates_at_utc_midnight() {
        let g = DefaultIsolationGuard;
        let before = hit("p", "2025-01-01T23:59:59Z");
        let after = hit("p", "2025-01-02T00:00:01Z");
        let same_day = hit("p", "2025-01-01T08:00:00Z");
        let s = g.isolated_session_stamp(&before).unwrap();
        assert_ne!(s, g.isolated_session_stamp(&after).unwrap());
        assert_eq!(s, g.isolated_session_stamp(&same_day).unwrap());
    }

    #[test]
    fn every_fingerprint_depends_on_property() {
        let g = DefaultIsolationGuard;
        let mut a = hit("p1", "2025-01-01T12:00:00Z");
        let mut b = hit("p2", "2025-01-01T12:00:00Z");
        a.user_id = Some("u".into());
        b.user_id = Some("u".into());
        assert_ne!(g.isolated_client_id(&a).unwrap(), g.isolated_client_id(&b).unwrap());
        assert_ne!(g.isolated_session_stamp(&a).unwrap(), g.isolated_session_stamp(&b).unwrap());
        assert_ne!(g.isolated_user_id(&a).unwrap(), g.isolated_user_id(&b).unwrap());

        a.request.query.insert("fss".into(), vec!["s".into()]);
        b.request.query.insert("fss".into(), vec!["s".into()]);
        assert_ne!(g.isolated_session_stamp(&a).unwrap(), g.isolated_session_stamp(&b).unwrap());
    }

    #[test]
    fn forced_stamp_ignores_headers_and_day() {
        let g = DefaultIsolationGuard;
        let mut a = hit("p", "2025-01-01T12:00:00Z");
        let mut b = hit("p", "2025-03-09T12:00:00Z");
        b.request.ip = "192.168.0.1".into();
        a.request.query.insert("fss".into(), vec!["forced".into()]);
        b.request.query.insert("fss".into(), vec!["forced".into()]);
        assert_eq!(g.isolated_session_stamp(&a).unwrap(), sha256_hex("fss=forced|p"));
        assert_eq!(g.isolated_session_stamp(&a).unwrap(), g.isolated_session_stamp(&b).unwrap());
    }

    #[test]
    fn empty_forced_stamp_falls_back_to_fingerprint() {
        let mut a = hit("p", "2025-01-01T12:00:00Z");
        let mut b = a.clone();
        b.request.ip = "172.16.0.9".into();
        b.request.headers.insert("User-Agent".into(), vec!["curl/8".into()]);
        a.request.query.insert("fss".into(), vec![String::new()]);
        b.request.query.insert("fss".into(), vec![String::new()]);
        for g in [&DefaultIsolationGuard as &dyn IsolationGuard, &NoIsolationGuard] {
            let stamp = g.isolated_session_stamp(&a).unwrap();
            assert_ne!(stamp, g.isolated_session_stamp(&b).unwrap());
            a.request.query.remove("fss");
            assert_eq!(stamp, g.isolated_session_stamp(&a).unwrap());
            a.request.query.insert("fss".into(), vec![String::new()]);
        }
    }

    #[test]
    fn stamp_covers_headers_and_ip() {
        let g = DefaultIsolationGuard;
        let a = hit("p", "2025-01-01T12:00:00Z");
        let mut other_ip = a.clone();
        other_ip.request.ip = "10.9.9.9".into();
        let mut other_ua = a.clone();
        other_ua.request.headers.insert("User-Agent".into(), vec!["curl/8".into()]);
        let stamp = g.isolated_session_stamp(&a).unwrap();
        assert_ne!(stamp, g.isolated_session_stamp(&other_ip).unwrap());
        assert_ne!(stamp, g.isolated_session_stamp(&other_ua).unwrap());
    }

    #[test]
    fn outputs_are_pure() {
        let g = DefaultIsolationGuard;
        let a = hit("p", "2025-01-01T12:00:00Z");
        let mut b = a.clone();
        b.id = "another-id".into();
        assert_eq!(g.isolated_session_stamp(&a).unwrap(), g.isolated_session_stamp(&b).unwrap());
        assert_eq!(g.isolated_client_id(&a).unwrap(), g.isolated_client_id(&b).unwrap());
    }

    #[test]
    fn user_id_is_required() {
        let h = hit("p", "2025-01-01T12:00:00Z");
        assert_eq!(DefaultIsolationGuard.isolated_user_id(&h), Err(IsolationError::MissingUserId(h.id.clone())));
        assert!(NoIsolationGuard.isolated_user_id(&h).is_err());
    }

    #[test]
    fn no_isolation_passes_raw_ids() {
        let mut h = hit("p", "2025-01-01T12:00:00Z");
        h.user_id = Some("u-1".into());
        let g = NoIsolationFactory.guard(&Settings::default());
        assert_eq!(g.isolated_client_id(&h).unwrap(), "client-a");
        assert_eq!(g.isolated_user_id(&h).unwrap(), "u-1");
        let mut other = h.clone();
        other.property_id = "q".into();
        assert_eq!(g.isolated_session_stamp(&h).unwrap(), g.isolated_session_stamp(&other).unwrap());
    }
}
