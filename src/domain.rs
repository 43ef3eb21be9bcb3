use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    DuplicateUuid { uuid: String },
    UnknownUuid { uuid: String },
    InvalidPort { port: u16 },
    InvalidTtl { ttl: u32 },
    EmptyField { field: &'static str },
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateUuid { .. } => "conflict",
            Self::UnknownUuid { .. } => "not_found",
            Self::InvalidPort { .. } | Self::InvalidTtl { .. } | Self::EmptyField { .. } => {
                "invalid_request"
            }
        }
    }
}

impl std::fmt::Display for DomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateUuid { uuid } => write!(f, "service already registered: {uuid}"),
            Self::UnknownUuid { uuid } => write!(f, "service not found: {uuid}"),
            Self::InvalidPort { port } => write!(f, "invalid port: {port}"),
            Self::InvalidTtl { ttl } => write!(f, "invalid ttl: {ttl}"),
            Self::EmptyField { field } => write!(f, "missing required field: {field}"),
        }
    }
}

impl std::error::Error for DomainError {}

pub fn validate_port(port: u16) -> Result<(), DomainError> {
    if port == 0 {
        return Err(DomainError::InvalidPort { port });
    }
    Ok(())
}

/// A zero TTL would expire the instance at the moment it is registered.
pub fn validate_ttl(ttl: u32) -> Result<(), DomainError> {
    if ttl == 0 {
        return Err(DomainError::InvalidTtl { ttl });
    }
    Ok(())
}

pub fn require_field(field: &'static str, value: &str) -> Result<(), DomainError> {
    if value.is_empty() {
        return Err(DomainError::EmptyField { field });
    }
    Ok(())
}

/// Registrant-supplied fields of a service instance, as accepted on the wire.
///
/// The uuid comes from the request path and the expiration instant is derived
/// once at command construction, so neither belongs here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub version: String,
    pub ttl: u32,
}

/// A registry entry.
///
/// `expires` is an absolute instant computed as `construction_time + ttl`
/// when the registering command is built, and replicated as-is. It is never
/// recomputed on the apply path; replicas applying at different wall-clock
/// moments must store the identical instant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Service {
    pub uuid: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub version: String,
    pub ttl: u32,
    pub expires: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub callbacks: BTreeSet<String>,
}

impl Service {
    pub fn from_spec(uuid: String, spec: ServiceSpec, expires: DateTime<Utc>) -> Self {
        Self {
            uuid,
            name: spec.name,
            host: spec.host,
            port: spec.port,
            environment: spec.environment,
            region: spec.region,
            version: spec.version,
            ttl: spec.ttl,
            expires,
            callbacks: BTreeSet::new(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires <= now
    }

    /// Seconds until expiry, clamped at zero.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> u32 {
        let secs = (self.expires - now).num_seconds();
        u32::try_from(secs).unwrap_or(0)
    }
}
