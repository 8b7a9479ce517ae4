use super::{AttachedPolicies, GroupKind, ObjectSource};
use crate::{
    collection::{Equals, Keyed},
    labels::Selector,
};
use chrono::{offset::Utc, DateTime};

/// A gateway and its listeners, as observed.
#[derive(Clone, Debug, PartialEq)]
pub struct Gateway {
    pub source: ObjectSource,
    pub gateway_class_name: String,
    pub listeners: Vec<Listener>,
    /// Policies targeting the gateway as a whole.
    pub attached_listener_policies: AttachedPolicies,
    /// HTTP-level policies targeting the gateway, applied to every HTTP filter
    /// chain.
    pub attached_http_policies: AttachedPolicies,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub generation: Option<i64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Listener {
    pub name: String,
    pub port: u16,
    pub protocol: ListenerProtocol,
    pub hostname: Option<String>,
    pub tls: Option<ListenerTls>,
    pub allowed_routes: AllowedRoutes,
    /// Policies targeting this listener by section name.
    pub attached_policies: AttachedPolicies,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ListenerProtocol {
    Http,
    Https,
    Tcp,
    Tls,
    Other(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerTls {
    pub mode: TlsMode,
    pub certificate_refs: Vec<ObjectSource>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TlsMode {
    Terminate,
    Passthrough,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllowedRoutes {
    pub namespaces: AllowedNamespaces,
    /// Route kinds that may attach. Empty when the listener declared kinds that
    /// are all unsupported.
    pub kinds: Vec<GroupKind>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllowedNamespaces {
    Same,
    All,
    Selector(Selector),
}

// === impl Gateway ===

impl Keyed for Gateway {
    fn resource_name(&self) -> String {
        self.source.resource_name()
    }
}

impl Equals for Gateway {
    fn equals(&self, other: &Self) -> bool {
        self == other
    }
}

impl Gateway {
    /// The role under which proxies for this gateway connect:
    /// `{namespace}~{name}`.
    pub fn role(&self) -> String {
        gateway_role(&self.source.namespace, &self.source.name)
    }
}

pub fn gateway_role(namespace: &str, name: &str) -> String {
    format!("{namespace}~{name}")
}

// === impl ListenerProtocol ===

impl ListenerProtocol {
    pub fn parse(protocol: &str) -> Self {
        match protocol {
            "HTTP" => Self::Http,
            "HTTPS" => Self::Https,
            "TCP" => Self::Tcp,
            "TLS" => Self::Tls,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Self::Http | Self::Https)
    }

    /// The route kinds a listener accepts when it does not list any.
    pub fn default_route_kinds(&self) -> Vec<GroupKind> {
        match self {
            Self::Http | Self::Https => vec![GroupKind::http_route()],
            Self::Tcp | Self::Tls => vec![GroupKind::tcp_route()],
            Self::Other(_) => vec![],
        }
    }
}

impl std::fmt::Display for ListenerProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => f.write_str("HTTP"),
            Self::Https => f.write_str("HTTPS"),
            Self::Tcp => f.write_str("TCP"),
            Self::Tls => f.write_str("TLS"),
            Self::Other(p) => f.write_str(p),
        }
    }
}

// === impl AllowedRoutes ===

impl Default for AllowedRoutes {
    fn default() -> Self {
        Self {
            namespaces: AllowedNamespaces::Same,
            kinds: vec![GroupKind::http_route()],
        }
    }
}
