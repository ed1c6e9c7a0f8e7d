//! Configuration resolution: profile + instance overrides → one flattened,
//! conflict-checked service list.
//!
//! Resolution is a pure function of its inputs: the same (profile,
//! overrides) pair always produces the same ordered output. That property
//! is what makes sandbox launches reproducible and auditable, and it is
//! covered by tests.
//!
//! # Merge algorithm
//!
//! Start from the profile's service list (empty if no profile). For each
//! override service: if the profile already has that kind, merge options
//! into it in place (list-valued options concatenate and de-duplicate,
//! scalar options are replaced last-wins); otherwise append it. Kinds
//! listed as removed are dropped entirely, regardless of where they came
//! from. Profile order is preserved; override-only kinds follow in
//! override-declaration order.

use std::collections::HashMap;

use tracing::{debug, instrument, trace};

use crate::error::ResolveError;
use crate::service::{
    Namespace, NamespaceDemand, NsAccess, Profile, Service, ServiceKind,
};

/// Instance-local changes layered over an optional base profile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceOverrides {
    /// Services to merge into (or append to) the profile's list.
    pub services: Vec<Service>,
    /// Service kinds to drop entirely.
    pub removed: Vec<ServiceKind>,
}

/// The flattened, conflict-checked result of resolution.
///
/// Ordering of `services` is deterministic and drives mount-entry
/// ordering downstream, so it must never be re-sorted.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    services: Vec<Service>,
}

impl ResolvedConfig {
    /// The resolved services in their final order.
    #[must_use]
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Finds the resolved service of a kind, if enabled.
    #[must_use]
    pub fn get(&self, kind: ServiceKind) -> Option<&Service> {
        self.services.iter().find(|service| service.kind() == kind)
    }

    /// True if some service demanded the host network namespace.
    ///
    /// Resolution guarantees no surviving Isolate demand contradicts this.
    #[must_use]
    pub fn network_shared(&self) -> bool {
        self.services
            .iter()
            .flat_map(Service::namespace_demands)
            .any(|demand| demand.namespace == Namespace::Net && demand.access == NsAccess::Share)
    }
}

/// Merges a profile with instance overrides.
///
/// # Errors
///
/// Returns `ResolveError::Conflict` when two services assert mutually
/// exclusive namespace requirements. There is never a silently picked
/// winner.
#[instrument(skip_all, fields(
    profile = profile.map(|p| p.name.as_str()).unwrap_or("<none>"),
    overrides = overrides.services.len(),
))]
pub fn resolve(
    profile: Option<&Profile>,
    overrides: &InstanceOverrides,
) -> Result<ResolvedConfig, ResolveError> {
    let mut services: Vec<Service> = profile
        .map(|p| p.services.clone())
        .unwrap_or_default();

    for incoming in &overrides.services {
        match services
            .iter_mut()
            .find(|existing| existing.kind() == incoming.kind())
        {
            Some(existing) => {
                trace!(kind = %incoming.kind(), "Merging override into profile service");
                merge_service(existing, incoming);
            }
            None => {
                trace!(kind = %incoming.kind(), "Appending override-only service");
                services.push(incoming.clone());
            }
        }
    }

    if !overrides.removed.is_empty() {
        services.retain(|service| !overrides.removed.contains(&service.kind()));
    }

    check_namespace_conflicts(&services)?;

    debug!(services = services.len(), "Configuration resolved");
    Ok(ResolvedConfig { services })
}

/// Per-kind merge policy. Exhaustive over the variant set: a new service
/// kind does not compile until its merge behavior is written down here.
fn merge_service(existing: &mut Service, incoming: &Service) {
    match (existing, incoming) {
        (Service::Filesystem(base), Service::Filesystem(over)) => {
            for grant in &over.grants {
                if !base.grants.contains(grant) {
                    base.grants.push(grant.clone());
                }
            }
        }
        (Service::Network(base), Service::Network(over)) => {
            base.mode = over.mode;
        }
        (Service::PulseAudio(base), Service::PulseAudio(over)) => {
            if over.socket.is_some() {
                base.socket = over.socket.clone();
            }
        }
        (Service::X11(base), Service::X11(over)) => {
            if over.display.is_some() {
                base.display = over.display.clone();
            }
            base.tcp = over.tcp;
        }
        (Service::Wayland(base), Service::Wayland(over)) => {
            if over.display.is_some() {
                base.display = over.display.clone();
            }
        }
        (Service::DBus(base), Service::DBus(over)) => {
            base.session = over.session;
            base.system = over.system;
            for name in &over.talk {
                if !base.talk.contains(name) {
                    base.talk.push(name.clone());
                }
            }
            for name in &over.own {
                if !base.own.contains(name) {
                    base.own.push(name.clone());
                }
            }
        }
        (Service::Gpu(base), Service::Gpu(over)) => {
            for device in &over.devices {
                if !base.devices.contains(device) {
                    base.devices.push(device.clone());
                }
            }
        }
        (Service::Notification, Service::Notification) | (Service::Systray, Service::Systray) => {}
        // resolve() only merges same-kind pairs.
        (existing, incoming) => unreachable!(
            "merge called with mismatched kinds {} and {}",
            existing.kind(),
            incoming.kind()
        ),
    }
}

fn check_namespace_conflicts(services: &[Service]) -> Result<(), ResolveError> {
    let mut claims: HashMap<Namespace, (NsAccess, ServiceKind)> = HashMap::new();

    for service in services {
        for NamespaceDemand { namespace, access } in service.namespace_demands() {
            match claims.get(&namespace) {
                None => {
                    claims.insert(namespace, (access, service.kind()));
                }
                Some(&(prior_access, prior_kind)) if prior_access != access => {
                    let (share_service, isolate_service) = match access {
                        NsAccess::Share => (service.kind(), prior_kind),
                        NsAccess::Isolate => (prior_kind, service.kind()),
                    };
                    return Err(ResolveError::Conflict {
                        namespace: namespace.name(),
                        share_service,
                        isolate_service,
                    });
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{
        AccessMode, DbusOptions, FilesystemGrant, FilesystemOptions, NetworkMode, NetworkOptions,
        X11Options,
    };

    fn web_browser_profile() -> Profile {
        Profile {
            name: "web-browser".to_string(),
            services: vec![
                Service::Network(NetworkOptions {
                    mode: NetworkMode::Shared,
                }),
                Service::Filesystem(FilesystemOptions {
                    grants: vec![FilesystemGrant::read_write("~/Downloads")],
                }),
            ],
            desktop_entry: None,
            mime_types: Vec::new(),
        }
    }

    #[test]
    fn test_resolve_without_profile() {
        let overrides = InstanceOverrides {
            services: vec![Service::Wayland(Default::default())],
            removed: Vec::new(),
        };
        let resolved = resolve(None, &overrides).expect("resolution must succeed");
        assert_eq!(resolved.services().len(), 1);
        assert_eq!(resolved.services()[0].kind(), ServiceKind::Wayland);
    }

    #[test]
    fn test_web_browser_scenario() {
        // Profile grants Downloads read-write; the instance adds Pictures
        // read-only. The merged filesystem service keeps both grants in
        // order, each with its own mode.
        let profile = web_browser_profile();
        let overrides = InstanceOverrides {
            services: vec![Service::Filesystem(FilesystemOptions {
                grants: vec![FilesystemGrant::read_only("~/Pictures")],
            })],
            removed: Vec::new(),
        };

        let resolved = resolve(Some(&profile), &overrides).expect("resolution must succeed");

        assert_eq!(resolved.services().len(), 2);
        let Service::Filesystem(fs) = resolved.get(ServiceKind::Filesystem).expect("filesystem")
        else {
            panic!("expected filesystem service");
        };
        assert_eq!(fs.grants.len(), 2);
        assert_eq!(fs.grants[0].path.to_str(), Some("~/Downloads"));
        assert_eq!(fs.grants[0].mode, AccessMode::ReadWrite);
        assert_eq!(fs.grants[1].path.to_str(), Some("~/Pictures"));
        assert_eq!(fs.grants[1].mode, AccessMode::ReadOnly);
        assert!(resolved.network_shared());
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let profile = web_browser_profile();
        let overrides = InstanceOverrides {
            services: vec![
                Service::Filesystem(FilesystemOptions {
                    grants: vec![FilesystemGrant::read_only("~/Pictures")],
                }),
                Service::Wayland(Default::default()),
                Service::DBus(DbusOptions {
                    talk: vec!["org.freedesktop.Notifications".to_string()],
                    ..Default::default()
                }),
            ],
            removed: Vec::new(),
        };

        let first = resolve(Some(&profile), &overrides).expect("first resolution");
        let second = resolve(Some(&profile), &overrides).expect("second resolution");
        assert_eq!(first, second);

        let kinds: Vec<_> = first.services().iter().map(Service::kind).collect();
        assert_eq!(
            kinds,
            vec![
                ServiceKind::Network,
                ServiceKind::Filesystem,
                ServiceKind::Wayland,
                ServiceKind::DBus,
            ],
            "profile order first, then override-only kinds in declaration order"
        );
    }

    #[test]
    fn test_duplicate_grants_deduplicated() {
        let profile = web_browser_profile();
        let overrides = InstanceOverrides {
            services: vec![Service::Filesystem(FilesystemOptions {
                grants: vec![FilesystemGrant::read_write("~/Downloads")],
            })],
            removed: Vec::new(),
        };

        let resolved = resolve(Some(&profile), &overrides).expect("resolution must succeed");
        let Service::Filesystem(fs) = resolved.get(ServiceKind::Filesystem).expect("filesystem")
        else {
            panic!("expected filesystem service");
        };
        assert_eq!(fs.grants.len(), 1);
    }

    #[test]
    fn test_scalar_override_wins() {
        let profile = web_browser_profile();
        let overrides = InstanceOverrides {
            services: vec![Service::Network(NetworkOptions {
                mode: NetworkMode::Isolated,
            })],
            removed: Vec::new(),
        };

        let resolved = resolve(Some(&profile), &overrides).expect("resolution must succeed");
        let Service::Network(net) = resolved.get(ServiceKind::Network).expect("network") else {
            panic!("expected network service");
        };
        assert_eq!(net.mode, NetworkMode::Isolated);
        assert!(!resolved.network_shared());
    }

    #[test]
    fn test_removed_kind_dropped_regardless_of_origin() {
        let profile = web_browser_profile();
        let overrides = InstanceOverrides {
            services: vec![Service::Network(NetworkOptions {
                mode: NetworkMode::Shared,
            })],
            removed: vec![ServiceKind::Network],
        };

        let resolved = resolve(Some(&profile), &overrides).expect("resolution must succeed");
        assert!(resolved.get(ServiceKind::Network).is_none());
        assert!(!resolved.network_shared());
    }

    #[test]
    fn test_namespace_conflict_is_an_error() {
        // X over TCP needs the host network; an isolated network service
        // forbids it. That contradiction must surface, not resolve.
        let overrides = InstanceOverrides {
            services: vec![
                Service::Network(NetworkOptions {
                    mode: NetworkMode::Isolated,
                }),
                Service::X11(X11Options {
                    display: None,
                    tcp: true,
                }),
            ],
            removed: Vec::new(),
        };

        let result = resolve(None, &overrides);
        match result {
            Err(ResolveError::Conflict {
                namespace,
                share_service,
                isolate_service,
            }) => {
                assert_eq!(namespace, "network");
                assert_eq!(share_service, ServiceKind::X11);
                assert_eq!(isolate_service, ServiceKind::Network);
            }
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_agreeing_demands_are_not_a_conflict() {
        let overrides = InstanceOverrides {
            services: vec![
                Service::Network(NetworkOptions {
                    mode: NetworkMode::Shared,
                }),
                Service::X11(X11Options {
                    display: None,
                    tcp: true,
                }),
            ],
            removed: Vec::new(),
        };

        let resolved = resolve(None, &overrides).expect("agreeing demands must resolve");
        assert!(resolved.network_shared());
    }
}
