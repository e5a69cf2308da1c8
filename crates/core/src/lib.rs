//! Stitch core types: hits, property settings and the registry contract.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

pub mod codec;

pub use codec::{CborCodec, CodecError, HitCodec, JsonCodec};

/// Identifier of the client a hit is filed under.
pub type ClientId = String;

/// Multi-valued string map used for headers and query parameters.
pub type Multimap = BTreeMap<String, Vec<String>>;

/// Server side view of the tracking request a hit was parsed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Request {
    pub method: String,
    pub host: String,
    pub path: String,
    pub ip: String,
    pub headers: Multimap,
    pub query: Multimap,
    pub body: Vec<u8>,
    pub server_received_time: DateTime<Utc>,
}

impl Request {
    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first())
            .map(String::as_str)
    }

    /// First value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).and_then(|v| v.first()).map(String::as_str)
    }
}

/// One parsed tracking request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Hit {
    pub id: String,
    pub client_id: ClientId,
    /// Owner the hit is currently filed under; rewritten on eviction.
    pub authoritative_client_id: ClientId,
    pub property_id: String,
    pub user_id: Option<String>,
    pub event_name: String,
    pub metadata: BTreeMap<String, String>,
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HitError {
    #[error("hit {0}: empty property id")]
    EmptyProperty(String),
    #[error("hit {0}: missing server received time")]
    MissingTimestamp(String),
    #[error("hit {0}: empty authoritative client id")]
    EmptyAuthoritativeClientId(String),
}

impl Hit {
    /// New hit with a fresh id, owned by `client_id`.
    pub fn new(property_id: impl Into<String>, client_id: impl Into<ClientId>, server_received_time: DateTime<Utc>) -> Self {
        let client_id = client_id.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            authoritative_client_id: client_id.clone(),
            client_id,
            property_id: property_id.into(),
            request: Request { server_received_time, ..Request::default() },
            ..Self::default()
        }
    }

    pub fn server_received_time(&self) -> DateTime<Utc> { self.request.server_received_time }

    /// Fill in an id and owner for loosely formed input.
    pub fn fill_defaults(mut self) -> Self {
        if self.id.is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }
        if self.authoritative_client_id.is_empty() {
            self.authoritative_client_id = self.client_id.clone();
        }
        self
    }

    pub fn validate(&self) -> Result<(), HitError> {
        if self.property_id.is_empty() {
            return Err(HitError::EmptyProperty(self.id.clone()));
        }
        if self.request.server_received_time.timestamp_millis() == 0 {
            return Err(HitError::MissingTimestamp(self.id.clone()));
        }
        if self.authoritative_client_id.is_empty() {
            return Err(HitError::EmptyAuthoritativeClientId(self.id.clone()));
        }
        Ok(())
    }
}

/// Per-property sessionization settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub property_id: String,
    pub session_timeout: Duration,
    pub session_join_by_session_stamp: bool,
    pub session_join_by_user_id: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            property_id: String::new(),
            session_timeout: Duration::from_secs(30 * 60),
            session_join_by_session_stamp: true,
            session_join_by_user_id: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("property not found: {0}")]
    NotFound(String),
    #[error("settings registry unavailable: {0}")]
    Unavailable(String),
}

/// Lookup of property settings.
pub trait SettingsRegistry: Send + Sync {
    fn get_by_property_id(&self, property_id: &str) -> Result<Settings, RegistryError>;
}

/// Registry backed by a fixed map with an optional fallback configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticSettingsRegistry {
    by_id: FxHashMap<String, Settings>,
    default: Option<Settings>,
}

impl StaticSettingsRegistry {
    pub fn new(props: impl IntoIterator<Item = Settings>) -> Self {
        let by_id = props.into_iter().map(|s| (s.property_id.clone(), s)).collect();
        Self { by_id, default: None }
    }

    /// Settings returned for property ids that are not configured explicitly.
    pub fn with_default(mut self, settings: Settings) -> Self {
        self.default = Some(settings);
        self
    }

    pub fn len(&self) -> usize { self.by_id.len() }
    pub fn is_empty(&self) -> bool { self.by_id.is_empty() }
}

impl SettingsRegistry for StaticSettingsRegistry {
    fn get_by_property_id(&self, property_id: &str) -> Result<Settings, RegistryError> {
        if let Some(s) = self.by_id.get(property_id) {
            return Ok(s.clone());
        }
        match &self.default {
            Some(d) => Ok(Settings { property_id: property_id.to_string(), ..d.clone() }),
            None => Err(RegistryError::NotFound(property_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> { "2025-01-01T12:00:00Z".parse().unwrap() }

    #[test]
    fn header_lookup_ignores_case() {
        let mut h = Hit::new("p", "a", ts());
        h.request.headers.insert("user-agent".into(), vec!["ua/1".into(), "ua/2".into()]);
        assert_eq!(h.request.header("User-Agent"), Some("ua/1"));
        assert_eq!(h.request.header("Accept"), None);
    }

    #[test]
    fn validate_rejects_missing_fields() {
        let ok = Hit::new("p", "a", ts());
        assert!(ok.validate().is_ok());

        let mut no_prop = ok.clone();
        no_prop.property_id.clear();
        assert!(matches!(no_prop.validate(), Err(HitError::EmptyProperty(_))));

        let mut no_time = ok.clone();
        no_time.request.server_received_time = DateTime::<Utc>::default();
        assert!(matches!(no_time.validate(), Err(HitError::MissingTimestamp(_))));

        let mut no_owner = ok;
        no_owner.authoritative_client_id.clear();
        assert!(matches!(no_owner.validate(), Err(HitError::EmptyAuthoritativeClientId(_))));
    }

    #[test]
    fn fill_defaults_copies_client_id() {
        let h = Hit { client_id: "c".into(), ..Hit::default() }.fill_defaults();
        assert_eq!(h.authoritative_client_id, "c");
        assert!(!h.id.is_empty());
    }

    #[test]
    fn static_registry_falls_back_to_default() {
        let explicit = Settings { property_id: "p1".into(), session_join_by_user_id: false, ..Settings::default() };
        let reg = StaticSettingsRegistry::new([explicit.clone()]);
        assert_eq!(reg.get_by_property_id("p1").unwrap(), explicit);
        assert_eq!(reg.get_by_property_id("p2"), Err(RegistryError::NotFound("p2".into())));

        let reg = reg.with_default(Settings { session_timeout: Duration::from_secs(60), ..Settings::default() });
        let got = reg.get_by_property_id("p2").unwrap();
        assert_eq!(got.property_id, "p2");
        assert_eq!(got.session_timeout, Duration::from_secs(60));
    }
}
