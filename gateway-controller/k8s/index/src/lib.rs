//! Gateway Controller Index
//!
//! Kubernetes resources are ingested into source collections (see
//! [`sources`]). Everything downstream is a derivation over those sources:
//!
//! ```text
//! [ ReferenceGrant ] ─► [ RefGrantIndex ]──────────┐
//! [ Policies ] ───────► [ PolicyIndex ] ─┬─────────┤
//! [ Upstreams ] ──────► [ BackendIndex ]◄┘         ▼
//! [ HTTPRoute/TCPRoute ] ─────────────────► [ RouteIndex ]
//! [ Gateway ] ─► [ ir::Gateway ] ─────────────────► [ GatewayIR builder ]
//! [ Service/EndpointSlice/Pod/Node ] ─► [ endpoints ]
//! ```
//!
//! Backend references are resolved when a route is indexed, so a change to a
//! Service only recomputes the routes that referenced it. Delegation chains
//! are expanded when a gateway's IR is built.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod backends;
mod cluster_info;
pub mod endpoints;
pub mod gateway_ir;
pub mod gateways;
pub mod metrics;
pub mod policies;
pub mod refgrants;
pub mod routes;
pub mod sources;

#[cfg(test)]
mod tests;

pub use self::{
    backends::BackendIndex,
    cluster_info::ClusterInfo,
    gateway_ir::BuiltGateway,
    policies::PolicyIndex,
    refgrants::RefGrantIndex,
    routes::RouteIndex,
    sources::{Obj, Sources},
};
use ahash::AHashMap as HashMap;
use gateway_controller_core::{
    ir::{Gateway, GroupKind, PolicyWrapper, Upstream},
    Collection,
};

/// The derived state shared by the translator: every index, plus the
/// gateways and their IR.
#[derive(Clone, Debug)]
pub struct Index {
    pub policies: PolicyIndex,
    pub refgrants: RefGrantIndex,
    pub backends: BackendIndex,
    pub routes: RouteIndex,
    pub gateways: Collection<Gateway>,
    pub gateway_irs: Collection<BuiltGateway>,
}

// === impl Index ===

impl Index {
    /// Builds the derivation graph over `sources`.
    ///
    /// `policies` holds every policy kind, and `upstreams` holds one collection
    /// per registered backend kind. Both are contributed by plugins.
    pub fn new(
        sources: &Sources,
        cluster: &ClusterInfo,
        policies: Collection<PolicyWrapper>,
        upstreams: HashMap<GroupKind, Collection<Upstream>>,
    ) -> Self {
        let policies = PolicyIndex::new(policies);
        let refgrants = RefGrantIndex::new(&sources.reference_grants);
        let backends = BackendIndex::new(upstreams, &policies);
        let routes = RouteIndex::new(sources, &policies, &refgrants, &backends);
        let gateways = gateways::gateways(sources, cluster, &policies);
        let gateway_irs = gateway_ir::build(sources, &gateways, &routes, &refgrants, &policies);
        Self {
            policies,
            refgrants,
            backends,
            routes,
            gateways,
            gateway_irs,
        }
    }
}
