//! Endpoints of Service upstreams, read from EndpointSlices.

use crate::{
    backends::ServicePortIr,
    sources::{self, LocalityPod, Obj, Sources},
    ClusterInfo,
};
use ahash::AHashSet as HashSet;
use gateway_controller_core::{
    ir::{EndpointWithMd, EndpointsForUpstream, GroupKind, Locality, ObjectSource, Upstream},
    Collection, HandlerContext,
};
use gateway_controller_k8s_api::{self as k8s, ResourceExt};
use std::sync::Arc;

/// The pod label marking workloads that accept mutual TLS.
pub const TLS_MODE_LABEL: &str = "security.istio.io/tlsMode";

/// The transport socket match key set on endpoints that accept mutual TLS.
pub const TLS_MODE_MATCH_KEY: &str = "tlsMode";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ServiceKey {
    namespace: String,
    name: String,
}

/// Derives the ready endpoints of every Service upstream. Upstreams of other
/// kinds are skipped.
pub fn service_endpoints(
    upstreams: &Collection<Upstream>,
    sources: &Sources,
    cluster: &ClusterInfo,
) -> Collection<EndpointsForUpstream> {
    let slices = sources
        .endpoint_slices
        .index("endpoint-slices-by-service", |slice: &Obj<k8s::EndpointSlice>| {
            slice
                .resource
                .labels()
                .get(k8s::SERVICE_NAME_LABEL)
                .map(|name| ServiceKey {
                    namespace: slice.source.namespace.clone(),
                    name: name.clone(),
                })
                .into_iter()
                .collect()
        });
    let services = sources.services.clone();
    let pods = sources.locality_pods.clone();
    let nodes = sources.nodes.clone();
    let auto_mtls = cluster.enable_auto_mtls;

    upstreams.map("service-endpoints", move |ctx, upstream: &Upstream| {
        let port = upstream.ir.downcast_ref::<ServicePortIr>()?;
        let svc = ctx.fetch(&services, &upstream.source.resource_name())?;
        let svc_ports = svc
            .resource
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_deref())
            .unwrap_or_default();
        if !svc_ports.iter().any(|p| p.port == i32::from(upstream.port)) {
            tracing::debug!(upstream = %upstream.cluster_name(), "Service no longer exposes port");
            return None;
        }
        let single_port = svc_ports.len() == 1;

        let key = ServiceKey {
            namespace: upstream.source.namespace.clone(),
            name: upstream.source.name.clone(),
        };
        let mut endpoints = EndpointsForUpstream::new(upstream);
        let mut seen = HashSet::new();
        for slice in ctx.fetch_index(&slices, &key) {
            let Some(target_port) = slice_port(&slice.resource, port.port_name.as_deref(), single_port)
            else {
                continue;
            };
            for ep in &slice.resource.endpoints {
                let ready = ep.conditions.as_ref().and_then(|c| c.ready).unwrap_or(true);
                if !ready {
                    continue;
                }
                let pod = endpoint_pod(ctx, &pods, ep);
                let locality = match &pod {
                    Some(pod) => pod.locality.clone(),
                    None => endpoint_node_locality(ctx, &nodes, ep),
                };
                for address in &ep.addresses {
                    if !seen.insert((address.clone(), target_port)) {
                        continue;
                    }
                    let mut md = EndpointWithMd::new(address.clone(), target_port);
                    if let Some(pod) = &pod {
                        md.labels = pod.labels.clone();
                        if let Some(mode) = pod.labels.get(TLS_MODE_LABEL).filter(|_| auto_mtls) {
                            md = md.with_transport_socket_match(TLS_MODE_MATCH_KEY, mode);
                        }
                    }
                    endpoints.add(locality.clone(), md);
                }
            }
        }
        Some(endpoints)
    })
}

/// Returns the target port of a slice for a service port. Ports are matched
/// by name; a single-port service also matches a slice's sole port.
fn slice_port(slice: &k8s::EndpointSlice, name: Option<&str>, single_port: bool) -> Option<u16> {
    let ports = slice.ports.as_deref().unwrap_or_default();
    let port = ports
        .iter()
        .find(|p| p.name.as_deref().unwrap_or_default() == name.unwrap_or_default())
        .or_else(|| ports.first().filter(|_| single_port && ports.len() == 1))?;
    port.port.and_then(|p| u16::try_from(p).ok())
}

/// The locality of an endpoint without a known pod, read from its node's
/// labels. The slice's zone stands in when the node is unknown or unlabeled.
fn endpoint_node_locality(
    ctx: &mut HandlerContext,
    nodes: &Collection<Obj<k8s::Node>>,
    ep: &k8s::Endpoint,
) -> Locality {
    let mut locality = ep
        .node_name
        .as_ref()
        .and_then(|name| ctx.fetch(nodes, &sources::node_key(name.as_str())))
        .map(|node| sources::node_locality(&node.resource))
        .unwrap_or_default();
    if locality.zone.is_empty() {
        locality.zone = ep.zone.clone().unwrap_or_default();
    }
    locality
}

fn endpoint_pod(
    ctx: &mut HandlerContext,
    pods: &Collection<LocalityPod>,
    ep: &k8s::Endpoint,
) -> Option<Arc<LocalityPod>> {
    let target = ep.target_ref.as_ref()?;
    if target.kind.as_deref() != Some("Pod") {
        return None;
    }
    let source = ObjectSource::new(
        &GroupKind::new("", "Pod"),
        target.namespace.clone().unwrap_or_default(),
        target.name.clone().unwrap_or_default(),
    );
    ctx.fetch(pods, &source.resource_name())
}
