use super::{AttachedPolicies, BackendRef, GroupKind, ObjectSource};
use crate::{
    collection::{Equals, Keyed},
    http_route::{HttpFilter, HttpRouteMatch},
};
use chrono::{offset::Utc, DateTime};

/// A reference from a route to the resource it attaches to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParentRef {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub section_name: Option<String>,
    pub port: Option<u16>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Route {
    Http(HttpRouteIr),
    Tcp(TcpRouteIr),
}

#[derive(Clone, Debug, PartialEq)]
pub struct HttpRouteIr {
    pub source: ObjectSource,
    pub parent_refs: Vec<ParentRef>,
    pub hostnames: Vec<String>,
    pub rules: Vec<HttpRouteRuleIr>,
    /// Target-ref policies attached to the whole route.
    pub attached_policies: AttachedPolicies,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub generation: Option<i64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HttpRouteRuleIr {
    pub name: Option<String>,
    pub matches: Vec<HttpRouteMatch>,
    pub filters: Vec<HttpFilter>,
    pub backends: Vec<HttpBackendOrDelegate>,
    /// Policies referenced by the rule's extensionRef filters.
    pub extension_refs: AttachedPolicies,
    /// Target-ref policies naming this rule by section name.
    pub attached_policies: AttachedPolicies,
    /// Errors from converting the rule's matches and filters. A rule with
    /// errors is replaced by a direct response.
    pub errors: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum HttpBackendOrDelegate {
    Backend(HttpBackend),
    /// Delegation to HTTPRoutes in `namespace`; a name of `*` selects every
    /// HTTPRoute in the namespace.
    Delegate(DelegateRef),
}

#[derive(Clone, Debug, PartialEq)]
pub struct HttpBackend {
    pub backend: BackendRef,
    pub attached_policies: AttachedPolicies,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DelegateRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TcpRouteIr {
    pub source: ObjectSource,
    pub parent_refs: Vec<ParentRef>,
    pub rules: Vec<TcpRouteRuleIr>,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub generation: Option<i64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TcpRouteRuleIr {
    pub name: Option<String>,
    pub backends: Vec<BackendRef>,
}

// === impl ParentRef ===

impl ParentRef {
    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(self.group.clone(), self.kind.clone())
    }

    pub fn is_gateway(&self) -> bool {
        self.group_kind() == GroupKind::gateway()
    }

    /// Whether this reference names the given resource.
    pub fn targets(&self, source: &ObjectSource) -> bool {
        self.group == source.group
            && self.kind == source.kind
            && self.namespace == source.namespace
            && self.name == source.name
    }
}

// === impl Route ===

impl Route {
    pub fn source(&self) -> &ObjectSource {
        match self {
            Self::Http(r) => &r.source,
            Self::Tcp(r) => &r.source,
        }
    }

    pub fn parent_refs(&self) -> &[ParentRef] {
        match self {
            Self::Http(r) => &r.parent_refs,
            Self::Tcp(r) => &r.parent_refs,
        }
    }

    pub fn creation_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Http(r) => r.creation_timestamp,
            Self::Tcp(r) => r.creation_timestamp,
        }
    }

    pub fn generation(&self) -> Option<i64> {
        match self {
            Self::Http(r) => r.generation,
            Self::Tcp(r) => r.generation,
        }
    }

    pub fn as_http(&self) -> Option<&HttpRouteIr> {
        match self {
            Self::Http(r) => Some(r),
            Self::Tcp(_) => None,
        }
    }
}

impl Keyed for Route {
    fn resource_name(&self) -> String {
        self.source().resource_name()
    }
}

impl Equals for Route {
    fn equals(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Http(a), Self::Http(b)) => a.equals(b),
            (Self::Tcp(a), Self::Tcp(b)) => a.equals(b),
            _ => false,
        }
    }
}

// === impl HttpRouteIr ===

impl Equals for HttpRouteIr {
    /// Ignores the creation timestamp and generation.
    fn equals(&self, other: &Self) -> bool {
        self.source == other.source
            && self.parent_refs == other.parent_refs
            && self.hostnames == other.hostnames
            && self.rules == other.rules
            && self.attached_policies == other.attached_policies
    }
}

// === impl TcpRouteIr ===

impl Equals for TcpRouteIr {
    fn equals(&self, other: &Self) -> bool {
        self.source == other.source
            && self.parent_refs == other.parent_refs
            && self.rules == other.rules
    }
}

// === impl HttpRouteRuleIr ===

impl HttpRouteRuleIr {
    /// Whether the rule has at least one delegate and no direct backends.
    pub fn delegates_only(&self) -> bool {
        !self.backends.is_empty()
            && self
                .backends
                .iter()
                .all(|b| matches!(b, HttpBackendOrDelegate::Delegate(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn http_route(generation: i64, hostname: &str) -> Route {
        Route::Http(HttpRouteIr {
            source: ObjectSource::new(&GroupKind::http_route(), "ns", "web"),
            parent_refs: vec![],
            hostnames: vec![hostname.to_string()],
            rules: vec![],
            attached_policies: Default::default(),
            creation_timestamp: Utc.timestamp_opt(generation, 0).single(),
            generation: Some(generation),
        })
    }

    #[test]
    fn equality_ignores_generation_and_creation() {
        assert!(http_route(1, "example.com").equals(&http_route(2, "example.com")));
        assert!(!http_route(1, "example.com").equals(&http_route(1, "example.org")));

        let tcp = Route::Tcp(TcpRouteIr {
            source: ObjectSource::new(&GroupKind::http_route(), "ns", "web"),
            parent_refs: vec![],
            rules: vec![],
            creation_timestamp: None,
            generation: Some(1),
        });
        assert!(!http_route(1, "example.com").equals(&tcp));
    }
}
