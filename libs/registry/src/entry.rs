//! Registry records
//!
//! A [`ServiceDescriptor`] is what a backend announces about itself; a
//! [`ServiceEntry`] is the descriptor once accepted, stamped with an id and
//! the time of its most recent heartbeat.

use crate::error::{RegistryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque identity assigned at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(Uuid);

impl ServiceId {
    /// Create a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ServiceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for ServiceId {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| RegistryError::not_found(s))
    }
}

/// What a backend instance announces when registering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    /// Display name
    pub name: String,
    /// Caller-chosen identity, unique across the live fleet
    pub unique_name: String,
    /// Service type tag ("Audit", "Analytics", ...)
    #[serde(rename = "type")]
    pub service_type: String,
    /// Address the gateway dials
    pub url: String,
    /// Semantic version string
    pub version: String,
}

impl ServiceDescriptor {
    pub fn new(
        name: impl Into<String>,
        unique_name: impl Into<String>,
        service_type: impl Into<String>,
        url: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            unique_name: unique_name.into(),
            service_type: service_type.into(),
            url: url.into(),
            version: version.into(),
        }
    }

    /// Reject descriptors the gateway could never route to
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("name", &self.name),
            ("uniqueName", &self.unique_name),
            ("type", &self.service_type),
            ("url", &self.url),
            ("version", &self.version),
        ] {
            if value.trim().is_empty() {
                return Err(RegistryError::invalid(field, "must not be empty"));
            }
        }

        url::Url::parse(&self.url)
            .map_err(|e| RegistryError::invalid("url", e.to_string()))?;

        if !is_dotted_version(&self.version) {
            return Err(RegistryError::invalid(
                "version",
                format!("'{}' is not a dotted numeric version", self.version),
            ));
        }

        Ok(())
    }
}

/// `major.minor[.patch][-pre][+build]`
fn is_dotted_version(version: &str) -> bool {
    let core = version
        .split(|c| c == '-' || c == '+')
        .next()
        .unwrap_or_default();
    let parts: Vec<&str> = core.split('.').collect();
    (2..=4).contains(&parts.len())
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// One live backend instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    pub id: ServiceId,
    pub name: String,
    pub unique_name: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub url: String,
    pub version: String,
    pub last_heartbeat: DateTime<Utc>,
}

impl ServiceEntry {
    pub(crate) fn from_descriptor(descriptor: ServiceDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            id: ServiceId::new(),
            name: descriptor.name,
            unique_name: descriptor.unique_name,
            service_type: descriptor.service_type,
            url: descriptor.url,
            version: descriptor.version,
            last_heartbeat: now,
        }
    }

    /// Whether the last heartbeat is still within `window` of `now`
    pub fn is_live_at(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        now - self.last_heartbeat <= window
    }

    pub fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor {
            name: self.name.clone(),
            unique_name: self.unique_name.clone(),
            service_type: self.service_type.clone(),
            url: self.url.clone(),
            version: self.version.clone(),
        }
    }
}
