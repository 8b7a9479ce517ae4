//! Routes, with their backends resolved and policies attached.

pub mod http;

use crate::{
    backends::{backend_group_kind, BackendIndex},
    policies::{attach, PolicyIndex},
    refgrants::RefGrantIndex,
    sources::{Obj, Sources},
};
use gateway_controller_core::{
    collection::join,
    errors::BackendError,
    http_route::{HttpFilter, HttpRouteMatch},
    ir::{
        AttachedPolicies, AttachmentKind, BackendRef, DelegateRef, GroupKind, HttpBackend,
        HttpBackendOrDelegate, HttpRouteIr, HttpRouteRuleIr, HttpRouteRuleMatchIr, ObjectSource,
        ParentRef, Route, TcpRouteIr, TcpRouteRuleIr, GATEWAY_GROUP,
    },
    Collection, HandlerContext, Index,
};
use gateway_controller_k8s_api::{
    self as k8s,
    gateway::{self as api, HttpRoute, TcpRoute},
    Resource,
};
use std::{collections::BTreeSet, sync::Arc};

/// Every HTTPRoute and TCPRoute, keyed by identity, with lookups by
/// namespace and by parent gateway.
#[derive(Clone, Debug)]
pub struct RouteIndex {
    routes: Collection<Route>,
    by_namespace: Index<String, Route>,
    by_parent: Index<ObjectSource, Route>,
}

/// The rules of a route with its delegation chain inlined.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RouteChain {
    pub rules: Vec<HttpRouteRuleMatchIr>,
    /// Delegations that could not be followed.
    pub errors: Vec<BackendError>,
}

#[derive(Clone, Debug)]
struct Resolver {
    policies: PolicyIndex,
    refgrants: RefGrantIndex,
    backends: BackendIndex,
}

// === impl RouteIndex ===

impl RouteIndex {
    pub fn new(
        sources: &Sources,
        policies: &PolicyIndex,
        refgrants: &RefGrantIndex,
        backends: &BackendIndex,
    ) -> Self {
        let resolver = Resolver {
            policies: policies.clone(),
            refgrants: refgrants.clone(),
            backends: backends.clone(),
        };

        let http = {
            let resolver = resolver.clone();
            sources
                .http_routes
                .map("http-route-irs", move |ctx, route: &Obj<HttpRoute>| {
                    Some(Route::Http(resolver.http_route(ctx, route)))
                })
        };
        let tcp = sources
            .tcp_routes
            .map("tcp-route-irs", move |ctx, route: &Obj<TcpRoute>| {
                Some(Route::Tcp(resolver.tcp_route(ctx, route)))
            });
        let routes = join("routes", &[http, tcp]);

        let by_namespace = routes.index("http-routes-by-namespace", |r: &Route| {
            r.as_http()
                .map(|r| r.source.namespace.clone())
                .into_iter()
                .collect()
        });
        let by_parent = routes.index("routes-by-parent", |r: &Route| {
            r.parent_refs()
                .iter()
                .filter(|p| p.is_gateway())
                .map(|p| ObjectSource::new(&GroupKind::gateway(), &p.namespace, &p.name))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        });

        Self {
            routes,
            by_namespace,
            by_parent,
        }
    }

    pub fn collection(&self) -> &Collection<Route> {
        &self.routes
    }

    /// Routes that name `gateway` in a parent reference, ordered by identity.
    pub fn routes_for_gateway(
        &self,
        ctx: &mut HandlerContext,
        gateway: &ObjectSource,
    ) -> Vec<Arc<Route>> {
        ctx.fetch_index(&self.by_parent, gateway)
    }

    /// Flattens a route's rules, inlining the rules of delegated routes at
    /// the position of the delegating rule.
    ///
    /// A child rule is kept only when its match narrows the delegating
    /// match. A route already on the chain is not followed again; the
    /// delegation is reported as a cyclic reference instead.
    pub fn route_chain(&self, ctx: &mut HandlerContext, route: &HttpRouteIr) -> RouteChain {
        let mut chain = RouteChain::default();
        let mut ancestors = BTreeSet::new();
        self.expand(
            ctx,
            route,
            None,
            &AttachedPolicies::default(),
            &mut ancestors,
            &mut chain,
        );
        chain
    }

    fn expand(
        &self,
        ctx: &mut HandlerContext,
        route: &HttpRouteIr,
        parent: Option<(&ObjectSource, &HttpRouteMatch)>,
        inherited: &AttachedPolicies,
        ancestors: &mut BTreeSet<ObjectSource>,
        chain: &mut RouteChain,
    ) {
        ancestors.insert(route.source.clone());

        for (rule_index, rule) in route.rules.iter().enumerate() {
            let mut attached = rule.attached_policies.clone();
            attached.append(&route.attached_policies);
            attached.append(inherited);

            let backends = rule
                .backends
                .iter()
                .filter_map(|b| match b {
                    HttpBackendOrDelegate::Backend(b) => Some(b.clone()),
                    HttpBackendOrDelegate::Delegate(_) => None,
                })
                .collect::<Vec<_>>();
            let delegates = rule
                .backends
                .iter()
                .filter_map(|b| match b {
                    HttpBackendOrDelegate::Delegate(d) => Some(d),
                    HttpBackendOrDelegate::Backend(_) => None,
                })
                .collect::<Vec<_>>();

            for (match_index, matcher) in rule.matches.iter().enumerate() {
                if let Some((_, parent_match)) = parent {
                    if !matcher.is_contained_by(parent_match) {
                        continue;
                    }
                }

                if !backends.is_empty() || delegates.is_empty() {
                    chain.rules.push(HttpRouteRuleMatchIr {
                        route: route.source.clone(),
                        delegated_by: parent.map(|(p, _)| p.clone()),
                        rule_index,
                        match_index,
                        matcher: matcher.clone(),
                        filters: rule.filters.clone(),
                        backends: backends.clone(),
                        extension_refs: rule.extension_refs.clone(),
                        attached_policies: attached.clone(),
                        errors: rule.errors.clone(),
                        creation_timestamp: route.creation_timestamp,
                    });
                }

                for delegate in &delegates {
                    for child in self.children(ctx, delegate) {
                        let Some(child) = child.as_http() else {
                            continue;
                        };
                        if ancestors.contains(&child.source) {
                            let error = BackendError::CyclicReference {
                                parent: route.source.clone(),
                                child: child.source.clone(),
                            };
                            tracing::debug!(%error, "Skipping delegated route");
                            if !chain.errors.contains(&error) {
                                chain.errors.push(error);
                            }
                            continue;
                        }
                        if !child.parent_refs.is_empty()
                            && !child.parent_refs.iter().any(|p| p.targets(&route.source))
                        {
                            continue;
                        }
                        self.expand(
                            ctx,
                            child,
                            Some((&route.source, matcher)),
                            &attached,
                            ancestors,
                            chain,
                        );
                    }
                }
            }
        }

        ancestors.remove(&route.source);
    }

    fn children(&self, ctx: &mut HandlerContext, delegate: &DelegateRef) -> Vec<Arc<Route>> {
        if delegate.name.is_empty() || delegate.name == "*" {
            return ctx.fetch_index(&self.by_namespace, &delegate.namespace);
        }
        let key =
            ObjectSource::new(&GroupKind::http_route(), &delegate.namespace, &delegate.name)
                .resource_name();
        ctx.fetch(&self.routes, &key).into_iter().collect()
    }
}

// === impl Resolver ===

impl Resolver {
    fn http_route(&self, ctx: &mut HandlerContext, route: &Obj<HttpRoute>) -> HttpRouteIr {
        let gk = GroupKind::http_route();
        let ns = route.source.namespace.as_str();
        let spec = api::view::<_, api::HttpRouteSpec>(&route.resource.spec).unwrap_or_else(|error| {
            tracing::warn!(%error, route = %route.source, "Invalid HTTPRoute");
            Default::default()
        });

        let rules = spec
            .rules
            .iter()
            .flatten()
            .map(|rule| self.http_rule(ctx, ns, &route.source.name, rule))
            .collect();
        let attached = self.policies.policies_for(ctx, &gk, ns, &route.source.name, None);

        HttpRouteIr {
            source: route.source.clone(),
            parent_refs: parent_refs(spec.parent_refs.as_deref(), ns),
            hostnames: spec.hostnames.unwrap_or_default(),
            rules,
            attached_policies: attach(&attached, AttachmentKind::TargetRef),
            creation_timestamp: k8s::creation_timestamp(&route.resource),
            generation: route.resource.meta().generation,
        }
    }

    fn http_rule(
        &self,
        ctx: &mut HandlerContext,
        ns: &str,
        route_name: &str,
        rule: &api::HttpRouteRule,
    ) -> HttpRouteRuleIr {
        let from = GroupKind::http_route();
        let mut errors = vec![];

        let mut matches = vec![];
        for m in rule.matches.iter().flatten() {
            match http::try_match(m) {
                Ok(m) => matches.push(m),
                Err(error) => errors.push(format!("invalid match: {error}")),
            }
        }
        if matches.is_empty() && errors.is_empty() {
            matches.push(HttpRouteMatch::default());
        }

        let mut filters = vec![];
        let mut extension_refs = AttachedPolicies::default();
        for f in rule.filters.iter().flatten() {
            if let Some(ext) = &f.extension_ref {
                let gk = GroupKind::from_ref(Some(&ext.group), Some(&ext.kind), "");
                match self.policies.direct(ctx, &gk, ns, &ext.name) {
                    Some(policy) => extension_refs.push(policy.attachment(AttachmentKind::Direct)),
                    None => errors.push(format!("extensionRef {gk} {ns}/{} not found", ext.name)),
                }
                continue;
            }
            match self.filter(ctx, ns, f) {
                Ok(f) => filters.push(f),
                Err(error) => errors.push(format!("invalid filter: {error}")),
            }
        }

        let backends = rule
            .backend_refs
            .iter()
            .flatten()
            .map(|b| {
                let backend = &b.backend;
                if backend_group_kind(backend) == GroupKind::http_route() {
                    return HttpBackendOrDelegate::Delegate(DelegateRef {
                        namespace: backend.namespace.clone().unwrap_or_else(|| ns.to_string()),
                        name: backend.name.clone(),
                    });
                }
                HttpBackendOrDelegate::Backend(HttpBackend {
                    backend: self.backend(ctx, &from, ns, backend),
                    attached_policies: AttachedPolicies::default(),
                })
            })
            .collect();

        let attached_policies = match rule.name.as_deref() {
            Some(section) => {
                let policies = self
                    .policies
                    .section_policies(ctx, &from, ns, route_name, section);
                attach(&policies, AttachmentKind::TargetRef)
            }
            None => AttachedPolicies::default(),
        };

        HttpRouteRuleIr {
            name: rule.name.clone(),
            matches,
            filters,
            backends,
            extension_refs,
            attached_policies,
            errors,
        }
    }

    fn filter(
        &self,
        ctx: &mut HandlerContext,
        ns: &str,
        filter: &api::HttpRouteFilter,
    ) -> anyhow::Result<HttpFilter> {
        if let Some(m) = &filter.request_header_modifier {
            return Ok(HttpFilter::RequestHeaderModifier(http::header_modifier(m)?));
        }
        if let Some(m) = &filter.response_header_modifier {
            return Ok(HttpFilter::ResponseHeaderModifier(http::header_modifier(m)?));
        }
        if let Some(r) = &filter.request_redirect {
            return Ok(HttpFilter::RequestRedirect(http::req_redirect(r)?));
        }
        if let Some(r) = &filter.url_rewrite {
            return Ok(HttpFilter::UrlRewrite(http::url_rewrite(r)?));
        }
        if let Some(m) = &filter.request_mirror {
            let from = GroupKind::http_route();
            return Ok(HttpFilter::RequestMirror(self.backend(
                ctx,
                &from,
                ns,
                &m.backend_ref,
            )));
        }
        anyhow::bail!("unsupported filter type {}", filter.type_)
    }

    fn tcp_route(&self, ctx: &mut HandlerContext, route: &Obj<TcpRoute>) -> TcpRouteIr {
        let from = GroupKind::tcp_route();
        let ns = route.source.namespace.as_str();
        let spec = api::view::<_, api::TcpRouteSpec>(&route.resource.spec).unwrap_or_else(|error| {
            tracing::warn!(%error, route = %route.source, "Invalid TCPRoute");
            Default::default()
        });

        let rules = spec
            .rules
            .iter()
            .map(|rule| TcpRouteRuleIr {
                name: rule.name.clone(),
                backends: rule
                    .backend_refs
                    .iter()
                    .flatten()
                    .map(|b| self.backend(ctx, &from, ns, b))
                    .collect(),
            })
            .collect();

        TcpRouteIr {
            source: route.source.clone(),
            parent_refs: parent_refs(spec.parent_refs.as_deref(), ns),
            rules,
            creation_timestamp: k8s::creation_timestamp(&route.resource),
            generation: route.resource.meta().generation,
        }
    }

    /// Resolves a backend reference from a route of kind `from`. References
    /// into another namespace must be permitted by a ReferenceGrant there.
    fn backend(
        &self,
        ctx: &mut HandlerContext,
        from: &GroupKind,
        ns: &str,
        backend: &api::BackendReference,
    ) -> BackendRef {
        let weight = backend
            .weight
            .map(|w| u32::try_from(w).unwrap_or(0))
            .unwrap_or(1);
        let target = ObjectSource::new(
            &backend_group_kind(backend),
            backend.namespace.as_deref().unwrap_or(ns),
            &backend.name,
        );
        if !self.refgrants.reference_allowed(ctx, from, ns, &target) {
            return BackendRef::failed(
                BackendError::MissingReferenceGrant {
                    target,
                    from_namespace: ns.to_string(),
                },
                weight,
            );
        }
        match self.backends.get_from_ref(ctx, backend, ns) {
            Ok(upstream) => BackendRef::resolved(upstream, weight),
            Err(error) => BackendRef::failed(error, weight),
        }
    }
}

fn parent_refs(refs: Option<&[api::ParentReference]>, ns: &str) -> Vec<ParentRef> {
    refs.into_iter().flatten().map(|p| parent_ref(p, ns)).collect()
}

/// Resolves a route's parent reference, defaulting to a Gateway in the
/// route's namespace.
pub fn parent_ref(p: &api::ParentReference, ns: &str) -> ParentRef {
    ParentRef {
        group: p.group.clone().unwrap_or_else(|| GATEWAY_GROUP.to_string()),
        kind: p.kind.clone().unwrap_or_else(|| "Gateway".to_string()),
        namespace: p.namespace.clone().unwrap_or_else(|| ns.to_string()),
        name: p.name.clone(),
        section_name: p.section_name.clone(),
        port: p.port.and_then(|p| u16::try_from(p).ok()),
    }
}
