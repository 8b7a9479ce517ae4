//! Built-in plugins.
//!
//! * [`KubernetesPlugin`]: Service backends, with EDS endpoints.
//! * [`StaticPlugin`]: `Upstream` backends with fixed hosts.
//! * [`RoutePolicyPlugin`], [`DirectResponsePlugin`] and
//!   [`HttpListenerPolicyPlugin`]: the controller's policy resources.
//! * [`IstioPlugin`]: auto-mTLS to mesh workloads, when enabled.
//! * [`LocalityPlugin`]: locality-aware endpoint priorities, when enabled.

mod direct_response;
mod http_listener_policy;
mod istio;
mod kubernetes;
mod locality;
mod route_policy;
mod static_upstream;

pub use self::{
    direct_response::{DirectResponseIr, DirectResponsePlugin},
    http_listener_policy::{HttpListenerPolicyIr, HttpListenerPolicyPlugin},
    istio::{IstioPlugin, ISTIO_TLS_MODE},
    kubernetes::KubernetesPlugin,
    locality::{priority, LocalityPlugin},
    route_policy::{RoutePolicyIr, RoutePolicyPlugin},
    static_upstream::{StaticIr, StaticPlugin},
};
use crate::extensions::Plugins;
use gateway_controller_core::ir::{ObjectSource, OpaqueIr, PolicyTargetRef, PolicyWrapper};
use gateway_controller_k8s_api::{self as k8s, policy::LocalPolicyTargetReference, Resource};
use gateway_controller_k8s_index::{ClusterInfo, Obj, Sources};

#[derive(Clone, Debug, Default)]
pub struct Settings {
    /// Prioritizes endpoints by their locality relative to each client.
    pub locality_priority: bool,
}

/// Registers the built-in plugins over `sources`.
pub fn builtin(sources: &Sources, cluster: &ClusterInfo, settings: &Settings) -> Plugins {
    let mut plugins = Plugins::default()
        .with_backend(KubernetesPlugin::new(sources, cluster))
        .with_backend(StaticPlugin::new(sources))
        .with_policy(RoutePolicyPlugin::new(sources))
        .with_policy(DirectResponsePlugin::new(sources))
        .with_policy(HttpListenerPolicyPlugin::new(sources));
    if cluster.enable_auto_mtls {
        plugins = plugins.with_policy(IstioPlugin::new(cluster));
    }
    if settings.locality_priority {
        plugins = plugins.with_policy(LocalityPlugin);
    }
    plugins
}

/// Wraps a policy resource with its kind-specific payload.
fn wrap<T>(
    obj: &Obj<T>,
    target_refs: &[LocalPolicyTargetReference],
    ir: OpaqueIr,
    errors: Vec<String>,
) -> PolicyWrapper
where
    T: Resource,
{
    PolicyWrapper {
        source: obj.source.clone(),
        target_refs: target_refs
            .iter()
            .map(|t| PolicyTargetRef {
                group: t.group.clone(),
                kind: t.kind.clone(),
                name: t.name.clone(),
                section_name: t.section_name.clone(),
            })
            .collect(),
        ir,
        errors,
        creation_timestamp: k8s::creation_timestamp(&obj.resource),
        generation: obj.resource.meta().generation,
    }
}

/// Returns the Service an upstream was derived from, if it was.
fn service_of(source: &ObjectSource) -> Option<(&str, &str)> {
    (source.group.is_empty() && source.kind == "Service")
        .then(|| (source.namespace.as_str(), source.name.as_str()))
}
