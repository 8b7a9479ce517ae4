//! Source collections, written by Kubernetes watches.

use crate::metrics::IngestMetrics;
use futures::prelude::*;
use gateway_controller_core::{
    collection::Item,
    ir::{GroupKind, Locality, ObjectSource, Secret},
    Collection, Equals, Keyed,
};
use gateway_controller_k8s_api::{
    self as k8s,
    gateway::{GatewayClass, Gateway, HttpRoute, ReferenceGrant, TcpRoute},
    policy, watcher, Resource, ResourceExt,
};
use serde::Serialize;
use std::collections::BTreeMap;

pub const REGION_LABEL: &str = "topology.kubernetes.io/region";
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";

/// A watched object, keyed by its identity.
#[derive(Clone, Debug)]
pub struct Obj<T> {
    pub source: ObjectSource,
    pub resource: T,
}

/// A pod's labels and the locality of the node it runs on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalityPod {
    pub source: ObjectSource,
    pub labels: BTreeMap<String, String>,
    pub locality: Locality,
}

/// Every collection fed by a watch.
#[derive(Clone, Debug)]
pub struct Sources {
    pub gateway_classes: Collection<Obj<GatewayClass>>,
    pub gateways: Collection<Obj<Gateway>>,
    pub http_routes: Collection<Obj<HttpRoute>>,
    pub tcp_routes: Collection<Obj<TcpRoute>>,
    pub reference_grants: Collection<Obj<ReferenceGrant>>,
    pub namespaces: Collection<Obj<k8s::Namespace>>,
    pub services: Collection<Obj<k8s::Service>>,
    pub endpoint_slices: Collection<Obj<k8s::EndpointSlice>>,
    pub pods: Collection<Obj<k8s::Pod>>,
    pub nodes: Collection<Obj<k8s::Node>>,
    pub secrets: Collection<Secret>,
    pub route_policies: Collection<Obj<policy::RoutePolicy>>,
    pub direct_responses: Collection<Obj<policy::DirectResponse>>,
    pub http_listener_policies: Collection<Obj<policy::HttpListenerPolicy>>,
    pub upstreams: Collection<Obj<policy::Upstream>>,

    /// Pods joined with the topology labels of their nodes.
    pub locality_pods: Collection<LocalityPod>,
}

/// Returns the identity of a watched resource.
pub fn source_of<R>(resource: &R) -> ObjectSource
where
    R: Resource<DynamicType = ()>,
{
    let gk = GroupKind::new(R::group(&()), R::kind(&()));
    ObjectSource::new(
        &gk,
        resource.namespace().unwrap_or_default(),
        resource.name_unchecked(),
    )
}

/// Wraps a resource with its identity. Managed fields are dropped, as they
/// change on every write and nothing reads them.
pub fn obj<R>(mut resource: R) -> Option<Obj<R>>
where
    R: Resource<DynamicType = ()>,
{
    resource.meta_mut().managed_fields = None;
    Some(Obj {
        source: source_of(&resource),
        resource,
    })
}

pub fn secret(secret: k8s::Secret) -> Option<Secret> {
    let source = source_of(&secret);
    let data = secret
        .data
        .into_iter()
        .flatten()
        .map(|(k, v)| (k, v.0))
        .collect();
    Some(Secret { source, data })
}

/// Applies a watch's events to a source collection.
///
/// Items produced by `convert` must be keyed by the resource's identity. A
/// resource that `convert` rejects is removed from the collection. The
/// collection is marked synced once the initial listing completes; later
/// relists replace its contents.
pub async fn ingest<R, T>(
    events: impl Stream<Item = watcher::Event<R>>,
    collection: Collection<T>,
    metrics: IngestMetrics,
    convert: impl Fn(R) -> Option<T>,
) where
    R: Resource<DynamicType = ()>,
    T: Item,
{
    let kind = R::kind(&()).to_string();
    tokio::pin!(events);
    let mut init = None::<Vec<T>>;
    while let Some(event) = events.next().await {
        match event {
            watcher::Event::Init => init = Some(Vec::new()),
            watcher::Event::InitApply(resource) => {
                let key = source_of(&resource).resource_name();
                match (init.as_mut(), convert(resource)) {
                    (Some(buffer), Some(item)) => buffer.push(item),
                    (Some(_), None) => {}
                    (None, Some(item)) => collection.upsert(item),
                    (None, None) => collection.remove(&key),
                }
            }
            watcher::Event::InitDone => {
                let items = init.take().unwrap_or_default();
                tracing::debug!(%kind, items = items.len(), "Resetting");
                metrics.reset(&kind);
                collection.reset(items);
                collection.mark_synced();
            }
            watcher::Event::Apply(resource) => {
                let key = source_of(&resource).resource_name();
                metrics.apply(&kind);
                match convert(resource) {
                    Some(item) => collection.upsert(item),
                    None => collection.remove(&key),
                }
            }
            watcher::Event::Delete(resource) => {
                metrics.delete(&kind);
                collection.remove(&source_of(&resource).resource_name());
            }
        }
    }
    tracing::debug!(%kind, "Watch ended");
}

// === impl Obj ===

impl<T> Keyed for Obj<T> {
    fn resource_name(&self) -> String {
        self.source.resource_name()
    }
}

impl<T: Resource + Serialize> Equals for Obj<T> {
    /// Objects compare by resource version when both have one, and by value
    /// otherwise.
    fn equals(&self, other: &Self) -> bool {
        if self.source != other.source {
            return false;
        }
        match (
            self.resource.meta().resource_version.as_ref(),
            other.resource.meta().resource_version.as_ref(),
        ) {
            (Some(a), Some(b)) => a == b,
            _ => match (
                serde_json::to_value(&self.resource),
                serde_json::to_value(&other.resource),
            ) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl<T> std::ops::Deref for Obj<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.resource
    }
}

// === impl LocalityPod ===

impl Keyed for LocalityPod {
    fn resource_name(&self) -> String {
        self.source.resource_name()
    }
}

impl Equals for LocalityPod {
    fn equals(&self, other: &Self) -> bool {
        self == other
    }
}

// === impl Sources ===

impl Default for Sources {
    fn default() -> Self {
        Self::new()
    }
}

impl Sources {
    pub fn new() -> Self {
        let pods = Collection::new("pods");
        let nodes = Collection::<Obj<k8s::Node>>::new("nodes");
        let locality_pods = {
            let nodes = nodes.clone();
            pods.map("locality-pods", move |ctx, pod: &Obj<k8s::Pod>| {
                let node_name = pod.resource.spec.as_ref()?.node_name.clone();
                let locality = node_name
                    .and_then(|name| ctx.fetch(&nodes, &node_key(name)))
                    .map(|node| node_locality(&node.resource))
                    .unwrap_or_default();
                Some(LocalityPod {
                    source: pod.source.clone(),
                    labels: pod.resource.labels().clone(),
                    locality,
                })
            })
        };

        Self {
            gateway_classes: Collection::new("gateway-classes"),
            gateways: Collection::new("gateways"),
            http_routes: Collection::new("http-routes"),
            tcp_routes: Collection::new("tcp-routes"),
            reference_grants: Collection::new("reference-grants"),
            namespaces: Collection::new("namespaces"),
            services: Collection::new("services"),
            endpoint_slices: Collection::new("endpoint-slices"),
            pods,
            nodes,
            secrets: Collection::new("secrets"),
            route_policies: Collection::new("route-policies"),
            direct_responses: Collection::new("direct-responses"),
            http_listener_policies: Collection::new("http-listener-policies"),
            upstreams: Collection::new("upstreams"),
            locality_pods,
        }
    }

    /// Resolves once every source has completed its initial listing.
    pub async fn synced(&self) {
        tokio::join!(
            self.gateway_classes.synced(),
            self.gateways.synced(),
            self.http_routes.synced(),
            self.tcp_routes.synced(),
            self.reference_grants.synced(),
            self.namespaces.synced(),
            self.services.synced(),
            self.endpoint_slices.synced(),
            self.pods.synced(),
            self.nodes.synced(),
            self.secrets.synced(),
            self.route_policies.synced(),
            self.direct_responses.synced(),
            self.http_listener_policies.synced(),
            self.upstreams.synced(),
        );
    }
}

/// The collection key of the named node.
pub(crate) fn node_key(name: impl Into<String>) -> String {
    ObjectSource::new(&GroupKind::new("", "Node"), "", name).resource_name()
}

pub(crate) fn node_locality(node: &k8s::Node) -> Locality {
    let labels = node.labels();
    Locality {
        region: labels.get(REGION_LABEL).cloned().unwrap_or_default(),
        zone: labels.get(ZONE_LABEL).cloned().unwrap_or_default(),
        subzone: String::new(),
    }
}
