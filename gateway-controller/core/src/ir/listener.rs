//! The translation-ready form of a gateway: listeners merged by port, routes
//! attached and delegation expanded.

use super::{AttachedPolicies, BackendRef, HttpBackend, ObjectSource};
use crate::{
    collection::{Equals, Keyed},
    http_route::{HttpFilter, HttpRouteMatch},
};
use chrono::{offset::Utc, DateTime};

#[derive(Clone, Debug, PartialEq)]
pub struct GatewayIr {
    pub source: ObjectSource,
    pub listeners: Vec<ListenerIr>,
    /// Policies applied to every listener.
    pub attached_policies: AttachedPolicies,
    /// Policies applied to every HTTP filter chain.
    pub attached_http_policies: AttachedPolicies,
}

/// One Envoy listener, possibly merging several gateway listeners that share a
/// port.
#[derive(Clone, Debug, PartialEq)]
pub struct ListenerIr {
    pub name: String,
    pub bind_address: String,
    pub bind_port: u16,
    pub attached_policies: AttachedPolicies,
    pub http_filter_chains: Vec<HttpFilterChainIr>,
    pub tcp_filter_chains: Vec<TcpFilterChainIr>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterChainCommon {
    pub name: String,
    pub server_names: Vec<String>,
    pub tls: Option<TlsBundle>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsBundle {
    pub cert_chain: Vec<u8>,
    pub private_key: Vec<u8>,
    pub alpn_protocols: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HttpFilterChainIr {
    pub common: FilterChainCommon,
    pub attached_policies: AttachedPolicies,
    pub virtual_hosts: Vec<VirtualHostIr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VirtualHostIr {
    pub name: String,
    pub hostname: String,
    pub rules: Vec<HttpRouteRuleMatchIr>,
}

/// A single match of a route rule, after delegation has been expanded. Rules
/// inherited from a delegating parent carry the parent's match, narrowed to
/// the child's.
#[derive(Clone, Debug, PartialEq)]
pub struct HttpRouteRuleMatchIr {
    /// The route that declared the rule.
    pub route: ObjectSource,
    /// The delegating route, for rules inlined from a child.
    pub delegated_by: Option<ObjectSource>,
    pub rule_index: usize,
    pub match_index: usize,
    pub matcher: HttpRouteMatch,
    pub filters: Vec<HttpFilter>,
    pub backends: Vec<HttpBackend>,
    pub extension_refs: AttachedPolicies,
    /// Rule-level attachments followed by route-level attachments.
    pub attached_policies: AttachedPolicies,
    pub errors: Vec<String>,
    pub creation_timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TcpFilterChainIr {
    pub common: FilterChainCommon,
    pub route: ObjectSource,
    pub backends: Vec<BackendRef>,
}

// === impl GatewayIr ===

impl Keyed for GatewayIr {
    fn resource_name(&self) -> String {
        self.source.resource_name()
    }
}

impl Equals for GatewayIr {
    fn equals(&self, other: &Self) -> bool {
        self == other
    }
}

// === impl HttpRouteRuleMatchIr ===

impl HttpRouteRuleMatchIr {
    /// `{kind}-{name}-{namespace}-{rule}-{match}`, with the kind lowercased.
    pub fn route_name(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            self.route.kind.to_lowercase(),
            self.route.name,
            self.route.namespace,
            self.rule_index,
            self.match_index
        )
    }
}
