use super::{AttachedPolicies, GroupKind, ObjectSource, OpaqueIr};
use crate::{
    collection::{Equals, Keyed},
    errors::BackendError,
};
use chrono::{offset::Utc, DateTime};
use std::sync::Arc;

/// The cluster that unresolvable backends are routed to.
pub const BLACKHOLE_CLUSTER: &str = "blackhole-cluster";

/// A routable destination contributed by a backend plugin.
#[derive(Clone, Debug, PartialEq)]
pub struct Upstream {
    pub source: ObjectSource,
    /// Zero when the destination has no port.
    pub port: u16,
    pub canonical_hostname: String,
    /// The kind-specific backend object, interpreted by its backend plugin.
    pub ir: OpaqueIr,
    pub attached_policies: AttachedPolicies,
    pub creation_timestamp: Option<DateTime<Utc>>,
}

/// A resolved backend reference.
#[derive(Clone, Debug, PartialEq)]
pub struct BackendRef {
    pub cluster_name: String,
    pub weight: u32,
    pub upstream: Option<Arc<Upstream>>,
    pub error: Option<BackendError>,
}

/// Returns the cluster name for a backend identity and port:
/// `{kind}/{namespace}/{name}:{port}` for core kinds, with the group prepended
/// otherwise. The port suffix is omitted when the port is zero.
///
/// Group, kind, namespace and name never contain `/` or `:`, so distinct
/// identities always produce distinct names.
pub fn cluster_name(source: &ObjectSource, port: u16) -> String {
    let mut name = if source.group.is_empty() {
        format!("{}/{}/{}", source.kind, source.namespace, source.name)
    } else {
        format!(
            "{}/{}/{}/{}",
            source.group, source.kind, source.namespace, source.name
        )
    };
    if port != 0 {
        name.push(':');
        name.push_str(&port.to_string());
    }
    name
}

// === impl Upstream ===

impl Upstream {
    pub fn cluster_name(&self) -> String {
        cluster_name(&self.source, self.port)
    }

    pub fn group_kind(&self) -> GroupKind {
        self.source.group_kind()
    }
}

impl Keyed for Upstream {
    fn resource_name(&self) -> String {
        self.cluster_name()
    }
}

impl Equals for Upstream {
    fn equals(&self, other: &Self) -> bool {
        self.source == other.source
            && self.port == other.port
            && self.canonical_hostname == other.canonical_hostname
            && self.ir == other.ir
            && self.attached_policies == other.attached_policies
    }
}

// === impl BackendRef ===

impl BackendRef {
    pub fn resolved(upstream: Arc<Upstream>, weight: u32) -> Self {
        Self {
            cluster_name: upstream.cluster_name(),
            weight,
            upstream: Some(upstream),
            error: None,
        }
    }

    /// A backend that failed to resolve. It is routed to the black-hole
    /// cluster.
    pub fn failed(error: BackendError, weight: u32) -> Self {
        Self {
            cluster_name: BLACKHOLE_CLUSTER.to_string(),
            weight,
            upstream: None,
            error: Some(error),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none() && self.upstream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(group: &str, kind: &str, ns: &str, name: &str) -> ObjectSource {
        ObjectSource {
            group: group.to_string(),
            kind: kind.to_string(),
            namespace: ns.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn names_core_services() {
        assert_eq!(
            cluster_name(&source("", "Service", "default", "foo"), 8080),
            "Service/default/foo:8080"
        );
    }

    #[test]
    fn names_grouped_kinds_and_portless_upstreams() {
        assert_eq!(
            cluster_name(&source("policy.gateway.dev", "Upstream", "ns", "up"), 0),
            "policy.gateway.dev/Upstream/ns/up"
        );
    }

    #[test]
    fn cluster_names_are_injective() {
        let identities = [
            (source("", "Service", "default", "foo"), 8080),
            (source("", "Service", "default", "foo"), 8081),
            (source("", "Service", "other", "foo"), 8080),
            (source("", "Service", "default", "bar"), 8080),
            (source("", "Service", "default", "foo"), 0),
            (source("x", "Service", "default", "foo"), 8080),
            (source("", "Upstream", "default", "foo"), 8080),
            // A group that looks like a kind must not collide with a core kind.
            (source("Service", "default", "foo", "bar"), 0),
            (source("", "Service", "default", "foo-bar"), 0),
        ];
        let names = identities
            .iter()
            .map(|(s, p)| cluster_name(s, *p))
            .collect::<std::collections::BTreeSet<_>>();
        assert_eq!(names.len(), identities.len());
    }
}
