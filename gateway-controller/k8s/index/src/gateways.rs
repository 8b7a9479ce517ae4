//! Gateways managed by this controller.

use crate::{
    policies::{attach, PolicyIndex},
    sources::{Obj, Sources},
    ClusterInfo,
};
use gateway_controller_core::{
    ir::{
        AllowedNamespaces, AllowedRoutes, AttachmentKind, Gateway, GroupKind, Listener,
        ListenerProtocol, ListenerTls, ObjectSource, TlsMode, GATEWAY_GROUP,
    },
    labels::{Requirement, Selector},
    Collection, HandlerContext,
};
use gateway_controller_k8s_api::{
    self as k8s,
    gateway::{self as api, GatewayClass},
    Resource,
};

/// Derives the IR of every Gateway whose class is managed by this
/// controller.
pub fn gateways(
    sources: &Sources,
    cluster: &ClusterInfo,
    policies: &PolicyIndex,
) -> Collection<Gateway> {
    let classes = sources.gateway_classes.clone();
    let cluster = cluster.clone();
    let policies = policies.clone();
    sources
        .gateways
        .map("gateway-irs", move |ctx, gw: &Obj<k8s::gateway::Gateway>| {
            let spec = match api::view::<_, api::GatewaySpec>(&gw.resource.spec) {
                Ok(spec) => spec,
                Err(error) => {
                    tracing::warn!(%error, gateway = %gw.source, "Invalid Gateway");
                    return None;
                }
            };
            if !is_managed(ctx, &classes, &cluster, &spec.gateway_class_name) {
                return None;
            }
            Some(gateway(ctx, &policies, gw, spec))
        })
}

fn is_managed(
    ctx: &mut HandlerContext,
    classes: &Collection<Obj<GatewayClass>>,
    cluster: &ClusterInfo,
    class_name: &str,
) -> bool {
    let gk = GroupKind::new(GatewayClass::group(&()), GatewayClass::kind(&()));
    let key = ObjectSource::new(&gk, "", class_name).resource_name();
    match ctx.fetch(classes, &key) {
        Some(class) => api::view::<_, api::GatewayClassSpec>(&class.resource.spec)
            .map(|spec| spec.controller_name == cluster.controller_name)
            .unwrap_or(false),
        None => class_name == cluster.gateway_class,
    }
}

fn gateway(
    ctx: &mut HandlerContext,
    policies: &PolicyIndex,
    gw: &Obj<k8s::gateway::Gateway>,
    spec: api::GatewaySpec,
) -> Gateway {
    let gk = GroupKind::gateway();
    let ns = gw.source.namespace.as_str();
    let name = gw.source.name.as_str();

    let listeners = spec
        .listeners
        .into_iter()
        .map(|l| {
            let attached = policies.section_policies(ctx, &gk, ns, name, &l.name);
            let mut listener = listener(ns, l);
            listener.attached_policies = attach(&attached, AttachmentKind::TargetRef);
            listener
        })
        .collect();

    // Gateway-wide policies apply both to listeners and to their HTTP filter
    // chains.
    let gateway_policies = policies.policies_for(ctx, &gk, ns, name, None);
    let attached = attach(&gateway_policies, AttachmentKind::TargetRef);

    Gateway {
        source: gw.source.clone(),
        gateway_class_name: spec.gateway_class_name,
        listeners,
        attached_listener_policies: attached.clone(),
        attached_http_policies: attached,
        creation_timestamp: k8s::creation_timestamp(&gw.resource),
        generation: gw.resource.meta().generation,
    }
}

fn listener(ns: &str, l: api::Listener) -> Listener {
    let protocol = ListenerProtocol::parse(&l.protocol);
    let tls = l.tls.map(|tls| ListenerTls {
        mode: match tls.mode.as_deref() {
            Some("Passthrough") => TlsMode::Passthrough,
            _ => TlsMode::Terminate,
        },
        certificate_refs: tls
            .certificate_refs
            .into_iter()
            .flatten()
            .map(|r| {
                ObjectSource::new(
                    &GroupKind::from_ref(r.group.as_deref(), r.kind.as_deref(), "Secret"),
                    r.namespace.unwrap_or_else(|| ns.to_string()),
                    r.name,
                )
            })
            .collect(),
    });

    let allowed = l.allowed_routes.unwrap_or_default();
    let namespaces = match allowed.namespaces {
        Some(api::RouteNamespaces {
            from: Some(from), ..
        }) if from == "All" => AllowedNamespaces::All,
        Some(api::RouteNamespaces {
            from: Some(from),
            selector,
        }) if from == "Selector" => {
            AllowedNamespaces::Selector(selector.map(label_selector).unwrap_or_default())
        }
        _ => AllowedNamespaces::Same,
    };
    let supported = protocol.default_route_kinds();
    let kinds = match allowed.kinds {
        Some(kinds) if !kinds.is_empty() => kinds
            .into_iter()
            .map(|k| {
                let group = k.group.as_deref().unwrap_or(GATEWAY_GROUP);
                GroupKind::from_ref(Some(group), Some(&k.kind), "")
            })
            .filter(|gk| supported.contains(gk))
            .collect(),
        _ => supported,
    };

    Listener {
        name: l.name,
        port: u16::try_from(l.port).unwrap_or(0),
        protocol,
        hostname: l.hostname,
        tls,
        allowed_routes: AllowedRoutes { namespaces, kinds },
        attached_policies: Default::default(),
    }
}

fn label_selector(selector: api::LabelSelector) -> Selector {
    let requirements = selector
        .match_expressions
        .into_iter()
        .flatten()
        .map(|e| Requirement::parse(e.key, &e.operator, e.values.unwrap_or_default()))
        .collect::<anyhow::Result<Vec<_>>>();
    match requirements {
        Ok(requirements) => Selector::new(selector.match_labels.unwrap_or_default(), requirements),
        Err(error) => {
            tracing::warn!(%error, "Invalid namespace selector selects no namespaces");
            Selector::invalid()
        }
    }
}
