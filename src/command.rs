use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    domain::{DomainError, Service, ServiceSpec, require_field, validate_port, validate_ttl},
    registry::Registry,
};

/// A replicated registry mutation.
///
/// The serde tag is the command's log identity: once entries with a given tag
/// exist in any cluster's log, that tag must never change or the log becomes
/// unreplayable. Constructors resolve every time-derived field, so wall-clock
/// time never reaches `apply`: a command carries the absolute `expires`
/// instant computed on the node that accepted the request, and every replica
/// stores that same instant no matter when it applies the entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Command {
    AddService {
        service: Service,
    },
    UpdateTtl {
        uuid: String,
        ttl: u32,
        expires: DateTime<Utc>,
    },
    RemoveService {
        uuid: String,
    },
    AddCallback {
        service: Service,
        callback_uuid: String,
    },
}

impl Command {
    pub fn add_service(uuid: String, spec: ServiceSpec) -> Result<Self, DomainError> {
        require_field("uuid", &uuid)?;
        require_field("name", &spec.name)?;
        require_field("host", &spec.host)?;
        validate_port(spec.port)?;
        validate_ttl(spec.ttl)?;

        let expires = expiration_time(Utc::now(), spec.ttl);
        Ok(Self::AddService {
            service: Service::from_spec(uuid, spec, expires),
        })
    }

    pub fn update_ttl(uuid: String, ttl: u32) -> Result<Self, DomainError> {
        require_field("uuid", &uuid)?;
        validate_ttl(ttl)?;

        Ok(Self::UpdateTtl {
            uuid,
            ttl,
            expires: expiration_time(Utc::now(), ttl),
        })
    }

    pub fn remove_service(uuid: String) -> Result<Self, DomainError> {
        require_field("uuid", &uuid)?;
        Ok(Self::RemoveService { uuid })
    }

    pub fn add_callback(service: Service, callback_uuid: String) -> Result<Self, DomainError> {
        require_field("uuid", &service.uuid)?;
        require_field("callback_uuid", &callback_uuid)?;
        Ok(Self::AddCallback {
            service,
            callback_uuid,
        })
    }

    /// Stable identifier matching the serde tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddService { .. } => "add-service",
            Self::UpdateTtl { .. } => "update-ttl",
            Self::RemoveService { .. } => "remove-service",
            Self::AddCallback { .. } => "add-callback",
        }
    }

    /// Applies this command to the node's registry. Runs exactly once per
    /// committed entry, in commit order, on every node.
    ///
    /// Must stay a pure function of (payload, registry state): no clock,
    /// no randomness, no node identity. Errors are deterministic state
    /// conflicts that every replica reaches identically; they leave the
    /// registry untouched and do not stop the apply loop.
    pub fn apply(&self, registry: &mut Registry) -> Result<CommandOutcome, DomainError> {
        match self {
            Self::AddService { service } => {
                registry.add(service.clone())?;
                info!(
                    command = self.name(),
                    uuid = %service.uuid,
                    name = %service.name,
                    expires = %service.expires,
                    "added service"
                );
                Ok(CommandOutcome::Service {
                    service: service.clone(),
                })
            }
            Self::UpdateTtl { uuid, ttl, expires } => {
                registry.update_ttl(uuid, *ttl, *expires)?;
                info!(command = self.name(), uuid = %uuid, ttl, "updated service ttl");
                Ok(CommandOutcome::Uuid { uuid: uuid.clone() })
            }
            Self::RemoveService { uuid } => {
                registry.remove_uuid(uuid)?;
                info!(command = self.name(), uuid = %uuid, "removed service");
                Ok(CommandOutcome::Uuid { uuid: uuid.clone() })
            }
            Self::AddCallback {
                service,
                callback_uuid,
            } => {
                registry.add_callback(service, callback_uuid)?;
                info!(
                    command = self.name(),
                    uuid = %service.uuid,
                    callback_uuid = %callback_uuid,
                    "added callback"
                );
                Ok(CommandOutcome::Service {
                    service: service.clone(),
                })
            }
        }
    }
}

/// The only place wall-clock time enters the command layer. Called at
/// construction, before replication; the result travels in the log entry.
fn expiration_time(now: DateTime<Utc>, ttl: u32) -> DateTime<Utc> {
    now + Duration::seconds(i64::from(ttl))
}

/// What a successfully applied command reports back to the proposer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandOutcome {
    Service { service: Service },
    Uuid { uuid: String },
    /// Blank or membership log entries; nothing touched the registry.
    Applied,
}

/// Replicated-apply response. State conflicts ride back as `Err` data so the
/// consensus runtime treats the entry as delivered and keeps applying.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CommandResponse {
    Ok {
        result: CommandOutcome,
    },
    Err {
        status: u16,
        code: String,
        message: String,
    },
}

impl CommandResponse {
    pub fn from_domain(err: &DomainError) -> Self {
        let status = match err.code() {
            "not_found" => 404,
            "conflict" => 409,
            _ => 400,
        };
        Self::Err {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;
    use pretty_assertions::assert_eq;

    use super::*;

    fn spec(name: &str, ttl: u32) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            host: format!("{name}1.example.com"),
            port: 9000,
            environment: "production".to_string(),
            region: "east".to_string(),
            version: "1.0.0".to_string(),
            ttl,
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn add_at(uuid: &str, name: &str, ttl: u32, constructed_at: DateTime<Utc>) -> Command {
        Command::AddService {
            service: Service::from_spec(
                uuid.to_string(),
                spec(name, ttl),
                expiration_time(constructed_at, ttl),
            ),
        }
    }

    fn registry(tmp: &tempfile::TempDir) -> Registry {
        Registry::load_or_init(tmp.path()).unwrap()
    }

    #[test]
    fn constructors_capture_expiration_at_construction_time() {
        let before = Utc::now();
        let cmd = Command::add_service("u1".to_string(), spec("api", 30)).unwrap();
        let after = Utc::now();

        let Command::AddService { service } = &cmd else {
            panic!("expected AddService, got {cmd:?}");
        };
        assert!(service.expires >= before + Duration::seconds(30));
        assert!(service.expires <= after + Duration::seconds(30));
    }

    #[test]
    fn apply_stores_the_replicated_expiration_regardless_of_apply_moment() {
        // The same committed command reaches two replicas with different lag;
        // both must store the instant carried in the payload, not their own
        // apply time.
        let cmd = add_at("u1", "api", 10, t(0));

        let tmp_a = tempfile::tempdir().unwrap();
        let tmp_b = tempfile::tempdir().unwrap();
        let mut replica_a = registry(&tmp_a);
        let mut replica_b = registry(&tmp_b);

        cmd.apply(&mut replica_a).unwrap();
        cmd.apply(&mut replica_b).unwrap();

        assert_eq!(replica_a.get_uuid("u1").unwrap().expires, t(10));
        assert_eq!(replica_b.get_uuid("u1").unwrap().expires, t(10));
    }

    #[test]
    fn identical_sequences_produce_identical_registries() {
        let sequence = vec![
            add_at("u1", "api", 30, t(0)),
            add_at("u2", "web", 60, t(1)),
            Command::UpdateTtl {
                uuid: "u1".to_string(),
                ttl: 120,
                expires: t(125),
            },
            Command::AddCallback {
                service: match add_at("u2", "web", 60, t(1)) {
                    Command::AddService { service } => service,
                    _ => unreachable!(),
                },
                callback_uuid: "cb-1".to_string(),
            },
            Command::RemoveService {
                uuid: "u1".to_string(),
            },
        ];

        let tmp_a = tempfile::tempdir().unwrap();
        let tmp_b = tempfile::tempdir().unwrap();
        let mut replica_a = registry(&tmp_a);
        let mut replica_b = registry(&tmp_b);

        for cmd in &sequence {
            let a = cmd.apply(&mut replica_a);
            let b = cmd.apply(&mut replica_b);
            assert_eq!(a, b);
        }
        assert_eq!(replica_a.services(), replica_b.services());
    }

    #[test]
    fn duplicate_add_fails_and_leaves_existing_entry_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let mut reg = registry(&tmp);
        add_at("u1", "api", 30, t(0)).apply(&mut reg).unwrap();

        let err = add_at("u1", "impostor", 60, t(5))
            .apply(&mut reg)
            .unwrap_err();
        assert_eq!(err, DomainError::DuplicateUuid { uuid: "u1".to_string() });

        let kept = reg.get_uuid("u1").unwrap();
        assert_eq!(kept.name, "api");
        assert_eq!(kept.expires, t(30));
    }

    #[test]
    fn mutations_on_absent_uuid_fail_not_found_and_are_noops() {
        let tmp = tempfile::tempdir().unwrap();
        let mut reg = registry(&tmp);

        let not_found = DomainError::UnknownUuid { uuid: "ghost".to_string() };
        let ghost_service = Service::from_spec("ghost".to_string(), spec("api", 10), t(10));

        let update = Command::UpdateTtl {
            uuid: "ghost".to_string(),
            ttl: 10,
            expires: t(10),
        };
        let remove = Command::RemoveService {
            uuid: "ghost".to_string(),
        };
        let callback = Command::AddCallback {
            service: ghost_service,
            callback_uuid: "cb-1".to_string(),
        };

        for cmd in [update, remove, callback] {
            assert_eq!(cmd.apply(&mut reg).unwrap_err(), not_found);
        }
        assert!(reg.is_empty());
    }

    #[test]
    fn re_add_after_remove_starts_from_a_clean_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let mut reg = registry(&tmp);

        add_at("u1", "api", 30, t(0)).apply(&mut reg).unwrap();
        let target = reg.get_uuid("u1").unwrap();
        Command::AddCallback {
            service: target,
            callback_uuid: "cb-1".to_string(),
        }
        .apply(&mut reg)
        .unwrap();

        Command::RemoveService {
            uuid: "u1".to_string(),
        }
        .apply(&mut reg)
        .unwrap();
        assert!(reg.get_uuid("u1").is_none());

        add_at("u1", "api", 30, t(100)).apply(&mut reg).unwrap();
        let readded = reg.get_uuid("u1").unwrap();
        assert_eq!(readded.expires, t(130));
        assert!(readded.callbacks.is_empty(), "remove cleared prior state");
    }

    #[test]
    fn register_renew_deregister_scenario() {
        let tmp = tempfile::tempdir().unwrap();
        let mut reg = registry(&tmp);

        // Register at T0 with TTL 30.
        let add = add_at("u1", "api", 30, t(0));
        let outcome = add.apply(&mut reg).unwrap();
        let CommandOutcome::Service { service } = outcome else {
            panic!("add-service reports the service");
        };
        assert_eq!(service.expires, t(30));
        assert_eq!(reg.get_uuid("u1").unwrap().expires, t(30));

        // Renew at T1 with TTL 60; the old lease is discarded.
        let renew = Command::UpdateTtl {
            uuid: "u1".to_string(),
            ttl: 60,
            expires: expiration_time(t(20), 60),
        };
        assert_eq!(
            renew.apply(&mut reg).unwrap(),
            CommandOutcome::Uuid { uuid: "u1".to_string() }
        );
        let renewed = reg.get_uuid("u1").unwrap();
        assert_eq!(renewed.ttl, 60);
        assert_eq!(renewed.expires, t(80));

        // Deregister, then a further renewal must fail not-found.
        Command::RemoveService {
            uuid: "u1".to_string(),
        }
        .apply(&mut reg)
        .unwrap();
        assert!(reg.get_uuid("u1").is_none());

        let late_renew = Command::UpdateTtl {
            uuid: "u1".to_string(),
            ttl: 10,
            expires: t(100),
        };
        assert_eq!(
            late_renew.apply(&mut reg).unwrap_err(),
            DomainError::UnknownUuid { uuid: "u1".to_string() }
        );
    }

    #[test]
    fn wire_tags_are_stable() {
        let add = add_at("u1", "api", 30, t(0));
        let update = Command::UpdateTtl {
            uuid: "u1".to_string(),
            ttl: 60,
            expires: t(60),
        };
        let remove = Command::RemoveService {
            uuid: "u1".to_string(),
        };
        let callback = Command::AddCallback {
            service: Service::from_spec("u1".to_string(), spec("api", 30), t(30)),
            callback_uuid: "cb-1".to_string(),
        };

        for (cmd, tag) in [
            (add, "add-service"),
            (update, "update-ttl"),
            (remove, "remove-service"),
            (callback, "add-callback"),
        ] {
            assert_eq!(cmd.name(), tag);
            let value = serde_json::to_value(&cmd).unwrap();
            assert_eq!(value["command"], tag);
            let decoded: Command = serde_json::from_value(value).unwrap();
            assert_eq!(decoded, cmd);
        }
    }

    #[test]
    fn constructors_reject_malformed_payloads() {
        assert_eq!(
            Command::add_service("".to_string(), spec("api", 30)).unwrap_err(),
            DomainError::EmptyField { field: "uuid" }
        );

        let mut no_port = spec("api", 30);
        no_port.port = 0;
        assert_eq!(
            Command::add_service("u1".to_string(), no_port).unwrap_err(),
            DomainError::InvalidPort { port: 0 }
        );

        assert_eq!(
            Command::add_service("u1".to_string(), spec("api", 0)).unwrap_err(),
            DomainError::InvalidTtl { ttl: 0 }
        );
        assert_eq!(
            Command::update_ttl("u1".to_string(), 0).unwrap_err(),
            DomainError::InvalidTtl { ttl: 0 }
        );
        assert_eq!(
            Command::remove_service("".to_string()).unwrap_err(),
            DomainError::EmptyField { field: "uuid" }
        );
    }

    #[test]
    fn state_conflicts_map_to_delivered_error_responses() {
        let resp =
            CommandResponse::from_domain(&DomainError::UnknownUuid { uuid: "u1".to_string() });
        assert_eq!(
            resp,
            CommandResponse::Err {
                status: 404,
                code: "not_found".to_string(),
                message: "service not found: u1".to_string(),
            }
        );

        let resp =
            CommandResponse::from_domain(&DomainError::DuplicateUuid { uuid: "u1".to_string() });
        let CommandResponse::Err { status, code, .. } = resp else {
            panic!("expected error response");
        };
        assert_eq!((status, code.as_str()), (409, "conflict"));
    }
}
