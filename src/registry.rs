use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{DomainError, Service};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    SerdeJson(serde_json::Error),
    SchemaVersionMismatch { expected: u32, got: u32 },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::SerdeJson(e) => write!(f, "json error: {e}"),
            Self::SchemaVersionMismatch { expected, got } => {
                write!(f, "schema_version mismatch: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::SerdeJson(e) => Some(e),
            Self::SchemaVersionMismatch { .. } => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedRegistry {
    pub schema_version: u32,
    #[serde(default)]
    pub services: BTreeMap<String, Service>,
}

/// Optional filters for read-side lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceQuery {
    pub name: Option<String>,
    pub environment: Option<String>,
    pub region: Option<String>,
}

impl ServiceQuery {
    fn matches(&self, service: &Service) -> bool {
        let field_matches =
            |want: &Option<String>, got: &str| want.as_deref().is_none_or(|w| w == got);
        field_matches(&self.name, &service.name)
            && field_matches(&self.environment, &service.environment)
            && field_matches(&self.region, &service.region)
    }
}

/// The node-local service directory.
///
/// Mutated only by command application, in commit order; the apply loop calls
/// `save` after each batch so a restarted node's contents match the state
/// machine's recorded apply position. Every mutating operation either fully
/// applies or returns an error leaving the map untouched.
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    services: BTreeMap<String, Service>,
}

impl Registry {
    pub fn load_or_init(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;

        let path = data_dir.join("registry.json");
        let services = if path.exists() {
            let bytes = fs::read(&path)?;
            let persisted: PersistedRegistry = serde_json::from_slice(&bytes)?;
            if persisted.schema_version != SCHEMA_VERSION {
                return Err(StoreError::SchemaVersionMismatch {
                    expected: SCHEMA_VERSION,
                    got: persisted.schema_version,
                });
            }
            persisted.services
        } else {
            BTreeMap::new()
        };

        Ok(Self { path, services })
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let persisted = PersistedRegistry {
            schema_version: SCHEMA_VERSION,
            services: self.services.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&persisted)?;
        write_atomic(&self.path, &bytes)?;
        Ok(())
    }

    pub fn add(&mut self, service: Service) -> Result<(), DomainError> {
        if self.services.contains_key(&service.uuid) {
            return Err(DomainError::DuplicateUuid {
                uuid: service.uuid.clone(),
            });
        }
        self.services.insert(service.uuid.clone(), service);
        Ok(())
    }

    pub fn update_ttl(
        &mut self,
        uuid: &str,
        ttl: u32,
        expires: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let service = self
            .services
            .get_mut(uuid)
            .ok_or_else(|| DomainError::UnknownUuid {
                uuid: uuid.to_string(),
            })?;
        service.ttl = ttl;
        service.expires = expires;
        Ok(())
    }

    pub fn remove_uuid(&mut self, uuid: &str) -> Result<(), DomainError> {
        self.services
            .remove(uuid)
            .map(|_| ())
            .ok_or_else(|| DomainError::UnknownUuid {
                uuid: uuid.to_string(),
            })
    }

    pub fn add_callback(
        &mut self,
        service: &Service,
        callback_uuid: &str,
    ) -> Result<(), DomainError> {
        let entry =
            self.services
                .get_mut(&service.uuid)
                .ok_or_else(|| DomainError::UnknownUuid {
                    uuid: service.uuid.clone(),
                })?;
        entry.callbacks.insert(callback_uuid.to_string());
        Ok(())
    }

    pub fn get_uuid(&self, uuid: &str) -> Option<Service> {
        self.services.get(uuid).cloned()
    }

    /// Live instances matching the query. `now` is passed in so lookups stay
    /// clock-free and testable; entries at or past `expires` are skipped.
    pub fn query(&self, query: &ServiceQuery, now: DateTime<Utc>) -> Vec<Service> {
        self.services
            .values()
            .filter(|s| !s.is_expired(now))
            .filter(|s| query.matches(s))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn services(&self) -> &BTreeMap<String, Service> {
        &self.services
    }

    /// Replaces the full contents, used when installing a snapshot.
    pub fn replace_services(&mut self, services: BTreeMap<String, Service>) {
        self.services = services;
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(tmp, path)?;
    Ok(())
}
