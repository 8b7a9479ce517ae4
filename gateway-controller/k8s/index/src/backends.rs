use crate::{
    policies::{attach, PolicyIndex},
    sources::Obj,
    ClusterInfo,
};
use ahash::AHashMap as HashMap;
use gateway_controller_core::{
    errors::BackendError,
    ir::{cluster_name, AttachedPolicies, AttachmentKind, GroupKind, ObjectSource, OpaqueIr, Upstream},
    Collection, HandlerContext,
};
use gateway_controller_k8s_api::{self as k8s, gateway::BackendReference};
use std::sync::Arc;

/// Routable upstreams, by backend kind.
#[derive(Clone, Debug, Default)]
pub struct BackendIndex {
    by_kind: Arc<HashMap<GroupKind, Collection<Upstream>>>,
}

/// The backend payload of a Service upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicePortIr {
    pub port_name: Option<String>,
    pub app_protocol: Option<String>,
}

impl BackendIndex {
    /// Wraps each kind's upstreams with the target-ref policies attached to
    /// the backend.
    pub fn new(upstreams: HashMap<GroupKind, Collection<Upstream>>, policies: &PolicyIndex) -> Self {
        let by_kind = upstreams
            .into_iter()
            .map(|(gk, upstreams)| {
                let policies = policies.clone();
                let attached = upstreams.map(
                    format!("{}-with-policies", upstreams.name()),
                    move |ctx, up: &Upstream| {
                        let attached = policies.policies_for(
                            ctx,
                            &up.group_kind(),
                            &up.source.namespace,
                            &up.source.name,
                            None,
                        );
                        Some(Upstream {
                            attached_policies: attach(&attached, AttachmentKind::TargetRef),
                            ..up.clone()
                        })
                    },
                );
                (gk, attached)
            })
            .collect();
        Self {
            by_kind: Arc::new(by_kind),
        }
    }

    pub fn upstreams(&self, gk: &GroupKind) -> Option<&Collection<Upstream>> {
        self.by_kind.get(gk)
    }

    /// Iterates upstream collections in group-kind order.
    pub fn iter(&self) -> impl Iterator<Item = (&GroupKind, &Collection<Upstream>)> {
        let mut kinds = self.by_kind.iter().collect::<Vec<_>>();
        kinds.sort_by(|(a, _), (b, _)| a.cmp(b));
        kinds.into_iter()
    }

    pub fn get(
        &self,
        ctx: &mut HandlerContext,
        gk: &GroupKind,
        namespace: &str,
        name: &str,
        port: Option<u16>,
    ) -> Result<Arc<Upstream>, BackendError> {
        let upstreams = self
            .by_kind
            .get(gk)
            .ok_or_else(|| BackendError::UnknownBackendKind(gk.clone()))?;
        let source = ObjectSource::new(gk, namespace, name);
        let key = cluster_name(&source, port.unwrap_or(0));
        ctx.fetch(upstreams, &key)
            .ok_or(BackendError::NotFound(source))
    }

    /// Resolves a backend reference. The group defaults to the core group,
    /// the kind to `Service` and the namespace to `local_namespace`.
    pub fn get_from_ref(
        &self,
        ctx: &mut HandlerContext,
        backend: &BackendReference,
        local_namespace: &str,
    ) -> Result<Arc<Upstream>, BackendError> {
        let gk = backend_group_kind(backend);
        let namespace = backend.namespace.as_deref().unwrap_or(local_namespace);
        let port = backend.port.and_then(|p| u16::try_from(p).ok());
        self.get(ctx, &gk, namespace, &backend.name, port)
    }
}

pub fn backend_group_kind(backend: &BackendReference) -> GroupKind {
    GroupKind::from_ref(backend.group.as_deref(), backend.kind.as_deref(), "Service")
}

/// Derives one upstream per Service port.
pub fn service_upstreams(
    services: &Collection<Obj<k8s::Service>>,
    cluster: &ClusterInfo,
) -> Collection<Upstream> {
    let cluster = cluster.clone();
    services.flat_map("service-upstreams", move |_, svc: &Obj<k8s::Service>| {
        let ports = svc
            .resource
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref());
        let created = k8s::creation_timestamp(&svc.resource);
        let hostname = cluster.service_dns_name(&svc.source.namespace, &svc.source.name);
        ports
            .into_iter()
            .flatten()
            .filter_map(|p| {
                let port = u16::try_from(p.port).ok().filter(|p| *p != 0)?;
                Some(Upstream {
                    source: svc.source.clone(),
                    port,
                    canonical_hostname: hostname.clone(),
                    ir: OpaqueIr::new(ServicePortIr {
                        port_name: p.name.clone(),
                        app_protocol: p.app_protocol.clone(),
                    }),
                    attached_policies: AttachedPolicies::default(),
                    creation_timestamp: created,
                })
            })
            .collect()
    })
}
