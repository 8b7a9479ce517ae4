//! Builds the translation-ready IR of each gateway.
//!
//! Listeners sharing a port are merged into one Envoy listener. Routes are
//! attached to the listeners that accept them, their delegation chains are
//! expanded, and every problem found along the way is recorded in the
//! gateway's reports.

use crate::{
    policies::PolicyIndex,
    refgrants::RefGrantIndex,
    routes::{RouteChain, RouteIndex},
    sources::{Obj, Sources},
};
use gateway_controller_core::{
    errors::RouteError,
    ir::{
        AllowedNamespaces, AttachedPolicies, FilterChainCommon, Gateway, GatewayIr, GroupKind,
        HttpFilterChainIr, Listener, ListenerIr, ListenerProtocol, ObjectSource, ParentRef, PolicyAtt,
        Route, Secret, TcpFilterChainIr, TlsBundle, TlsMode, VirtualHostIr,
    },
    reports::{self, conditions, reasons, Condition, ListenerReport, ReportMap},
    Collection, Equals, HandlerContext, Keyed,
};
use gateway_controller_k8s_api as k8s;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// Envoy cannot bind privileged ports unprivileged; such listener ports are
/// shifted by this offset.
pub const PRIVILEGED_PORT_OFFSET: u16 = 8000;

pub const BIND_ADDRESS: &str = "::";

/// A gateway's IR with the reports produced while building it.
#[derive(Clone, Debug, PartialEq)]
pub struct BuiltGateway {
    pub ir: GatewayIr,
    pub reports: ReportMap,
}

#[derive(Clone, Debug)]
struct Builder {
    namespaces: Collection<Obj<k8s::Namespace>>,
    secrets: Collection<Secret>,
    routes: RouteIndex,
    refgrants: RefGrantIndex,
    policies: PolicyIndex,
}

/// Routes attached to one listener, with the hostnames they matched.
type Attached = BTreeMap<ObjectSource, (Arc<Route>, BTreeSet<String>)>;

pub fn build(
    sources: &Sources,
    gateways: &Collection<Gateway>,
    routes: &RouteIndex,
    refgrants: &RefGrantIndex,
    policies: &PolicyIndex,
) -> Collection<BuiltGateway> {
    let builder = Builder {
        namespaces: sources.namespaces.clone(),
        secrets: sources.secrets.clone(),
        routes: routes.clone(),
        refgrants: refgrants.clone(),
        policies: policies.clone(),
    };
    gateways.map("gateway-ir-builder", move |ctx, gw: &Gateway| {
        Some(builder.build(ctx, gw))
    })
}

/// The port an Envoy listener binds for a gateway listener port.
pub fn bind_port(port: u16) -> u16 {
    if port < 1024 {
        port + PRIVILEGED_PORT_OFFSET
    } else {
        port
    }
}

// === impl BuiltGateway ===

impl Keyed for BuiltGateway {
    fn resource_name(&self) -> String {
        self.ir.source.resource_name()
    }
}

impl Equals for BuiltGateway {
    fn equals(&self, other: &Self) -> bool {
        self == other
    }
}

// === impl Builder ===

impl Builder {
    fn build(&self, ctx: &mut HandlerContext, gw: &Gateway) -> BuiltGateway {
        let mut reports = ReportMap::default();
        let by_port = self.validate_listeners(&mut reports, gw);

        // Attach routes to the listeners that accept them.
        let mut attached = BTreeMap::<String, Attached>::new();
        for route in self.routes.routes_for_gateway(ctx, &gw.source) {
            let report = reports.route(route.source(), route.generation());
            for parent in route.parent_refs().iter().filter(|p| p.targets(&gw.source)) {
                let listeners = by_port.values().flatten().copied();
                match self.accept(ctx, gw, &route, parent, listeners) {
                    Ok(accepted) => {
                        for (listener, hosts) in accepted {
                            let (_, all) = attached
                                .entry(listener.name.clone())
                                .or_default()
                                .entry(route.source().clone())
                                .or_insert_with(|| (route.clone(), BTreeSet::new()));
                            all.extend(hosts);
                        }
                        report.parent(parent);
                    }
                    Err(error) => {
                        report
                            .parent(parent)
                            .fail(conditions::ACCEPTED, error.reason(), error.to_string());
                    }
                }
            }
        }
        {
            let report = reports.gateway(&gw.source, gw.generation);
            for (listener, routes) in &attached {
                report.listener(listener).attached_routes = routes.len() as i32;
            }
        }

        let mut chains = BTreeMap::new();
        let mut listeners = vec![];
        for (port, ls) in &by_port {
            let mut ir = ListenerIr {
                name: format!("listener~{port}"),
                bind_address: BIND_ADDRESS.to_string(),
                bind_port: bind_port(*port),
                attached_policies: AttachedPolicies::default(),
                http_filter_chains: vec![],
                tcp_filter_chains: vec![],
            };
            for l in ls {
                ir.attached_policies.append(&l.attached_policies);
            }

            let empty = Attached::new();
            let routes_of = |l: &Listener| attached.get(&l.name).unwrap_or(&empty);
            match ls[0].protocol {
                ListenerProtocol::Http => {
                    let mut policies = AttachedPolicies::default();
                    for l in ls {
                        policies.append(&l.attached_policies);
                    }
                    let name = ls[0].name.clone();
                    let routes = ls.iter().flat_map(|l| routes_of(*l).values());
                    let virtual_hosts =
                        self.virtual_hosts(ctx, &mut reports, &mut chains, gw, &name, routes);
                    ir.http_filter_chains.push(HttpFilterChainIr {
                        common: FilterChainCommon {
                            name,
                            server_names: vec![],
                            tls: None,
                        },
                        attached_policies: policies,
                        virtual_hosts,
                    });
                }
                ListenerProtocol::Https => {
                    for l in ls {
                        let Some(tls) = self.tls_bundle(ctx, &mut reports, gw, l) else {
                            continue;
                        };
                        let routes = routes_of(*l).values();
                        let virtual_hosts =
                            self.virtual_hosts(ctx, &mut reports, &mut chains, gw, &l.name, routes);
                        ir.http_filter_chains.push(HttpFilterChainIr {
                            common: FilterChainCommon {
                                name: l.name.clone(),
                                server_names: l.hostname.iter().cloned().collect(),
                                tls: Some(tls),
                            },
                            attached_policies: l.attached_policies.clone(),
                            virtual_hosts,
                        });
                    }
                }
                ListenerProtocol::Tcp | ListenerProtocol::Tls => {
                    for l in ls {
                        let tls = match (&l.protocol, l.tls.as_ref().map(|t| t.mode)) {
                            (ListenerProtocol::Tls, Some(TlsMode::Terminate)) => {
                                match self.tls_bundle(ctx, &mut reports, gw, l) {
                                    Some(tls) => Some(tls),
                                    None => continue,
                                }
                            }
                            _ => None,
                        };
                        if let Some(chain) = self.tcp_chain(&mut reports, gw, l, routes_of(*l), tls) {
                            ir.tcp_filter_chains.push(chain);
                        }
                    }
                }
                ListenerProtocol::Other(_) => {}
            }

            if !ir.http_filter_chains.is_empty() || !ir.tcp_filter_chains.is_empty() {
                listeners.push(ir);
            }
        }

        if listeners.is_empty() {
            reports.gateway(&gw.source, gw.generation).set_condition(Condition::new(
                conditions::PROGRAMMED,
                false,
                reasons::INVALID,
                "no listener could be programmed",
            ));
        }

        let ir = GatewayIr {
            source: gw.source.clone(),
            listeners,
            attached_policies: gw.attached_listener_policies.clone(),
            attached_http_policies: gw.attached_http_policies.clone(),
        };
        self.report_policies(ctx, &mut reports, gw, &ir, &chains);
        BuiltGateway { ir, reports }
    }

    /// Groups valid listeners by port, reporting unsupported protocols and
    /// conflicts. The first listener on a port decides its protocol.
    fn validate_listeners<'g>(
        &self,
        reports: &mut ReportMap,
        gw: &'g Gateway,
    ) -> BTreeMap<u16, Vec<&'g Listener>> {
        let report = reports.gateway(&gw.source, gw.generation);
        let mut by_port = BTreeMap::<u16, Vec<&'g Listener>>::new();
        for l in &gw.listeners {
            let lr = report.listener(&l.name);
            lr.supported_kinds = l.allowed_routes.kinds.clone();

            if let ListenerProtocol::Other(protocol) = &l.protocol {
                lr.set_condition(Condition::new(
                    conditions::ACCEPTED,
                    false,
                    reasons::UNSUPPORTED_PROTOCOL,
                    format!("protocol {protocol} is not supported"),
                ));
                continue;
            }
            if l.port == 0 {
                lr.set_condition(Condition::new(
                    conditions::ACCEPTED,
                    false,
                    reasons::INVALID,
                    "listener port is invalid",
                ));
                continue;
            }
            if l.allowed_routes.kinds.is_empty() {
                lr.set_condition(Condition::new(
                    conditions::RESOLVED_REFS,
                    false,
                    reasons::INVALID_ROUTE_KINDS,
                    "no supported route kinds are allowed",
                ));
            }

            let peers = by_port.entry(l.port).or_default();
            if peers.first().is_some_and(|p| p.protocol != l.protocol) {
                lr.set_condition(Condition::new(
                    conditions::CONFLICTED,
                    true,
                    reasons::PROTOCOL_CONFLICT,
                    format!("port {} is already used with another protocol", l.port),
                ));
                continue;
            }
            if peers.iter().any(|p| p.hostname == l.hostname) {
                lr.set_condition(Condition::new(
                    conditions::CONFLICTED,
                    true,
                    reasons::HOSTNAME_CONFLICT,
                    format!("port {} is already used with the same hostname", l.port),
                ));
                continue;
            }
            peers.push(l);
        }
        by_port.retain(|_, ls| !ls.is_empty());
        by_port
    }

    /// Returns the listeners a parent reference attaches the route to, with
    /// the hostnames the route matches on each.
    fn accept<'g>(
        &self,
        ctx: &mut HandlerContext,
        gw: &Gateway,
        route: &Route,
        parent: &ParentRef,
        listeners: impl Iterator<Item = &'g Listener>,
    ) -> Result<Vec<(&'g Listener, Vec<String>)>, RouteError> {
        let candidates = listeners
            .filter(|l| parent.section_name.as_ref().map_or(true, |s| *s == l.name))
            .filter(|l| parent.port.map_or(true, |p| p == l.port))
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            return Err(RouteError::NoMatchingParent);
        }

        let route_gk = route.source().group_kind();
        let route_ns = route.source().namespace.as_str();
        let allowed = candidates
            .into_iter()
            .filter(|l| l.allowed_routes.kinds.contains(&route_gk))
            .filter(|l| self.namespace_allowed(ctx, gw, l, route_ns))
            .collect::<Vec<_>>();
        if allowed.is_empty() {
            return Err(RouteError::NotAllowedByListeners);
        }

        let Route::Http(http) = route else {
            return Ok(allowed.into_iter().map(|l| (l, vec![])).collect());
        };
        let matched = allowed
            .into_iter()
            .filter_map(|l| {
                let hosts = intersect_hostnames(l.hostname.as_deref(), &http.hostnames);
                (!hosts.is_empty()).then_some((l, hosts))
            })
            .collect::<Vec<_>>();
        if matched.is_empty() {
            return Err(RouteError::NoMatchingListenerHostname);
        }
        Ok(matched)
    }

    fn namespace_allowed(
        &self,
        ctx: &mut HandlerContext,
        gw: &Gateway,
        listener: &Listener,
        route_ns: &str,
    ) -> bool {
        match &listener.allowed_routes.namespaces {
            AllowedNamespaces::All => true,
            AllowedNamespaces::Same => route_ns == gw.source.namespace,
            AllowedNamespaces::Selector(selector) => {
                let key = ObjectSource::new(&GroupKind::new("", "Namespace"), "", route_ns);
                ctx.fetch(&self.namespaces, &key.resource_name())
                    .is_some_and(|ns| selector.matches(ns.resource.metadata.labels.as_ref()))
            }
        }
    }

    /// Builds one virtual host per hostname from the HTTP routes attached to
    /// a filter chain.
    fn virtual_hosts<'r>(
        &self,
        ctx: &mut HandlerContext,
        reports: &mut ReportMap,
        chains: &mut BTreeMap<ObjectSource, RouteChain>,
        gw: &Gateway,
        chain_name: &str,
        routes: impl Iterator<Item = &'r (Arc<Route>, BTreeSet<String>)>,
    ) -> Vec<VirtualHostIr> {
        let mut by_host = BTreeMap::<String, Vec<_>>::new();
        for (route, hosts) in routes {
            let Route::Http(http) = route.as_ref() else {
                continue;
            };
            let chain = chains
                .entry(http.source.clone())
                .or_insert_with(|| {
                    let chain = self.routes.route_chain(ctx, http);
                    report_chain(reports, gw, route, &chain);
                    chain
                });
            for host in hosts {
                by_host
                    .entry(host.clone())
                    .or_default()
                    .extend(chain.rules.iter().cloned());
            }
        }

        by_host
            .into_iter()
            .map(|(hostname, rules)| VirtualHostIr {
                name: format!("{chain_name}~{hostname}"),
                hostname,
                rules,
            })
            .collect()
    }

    /// Builds a TCP filter chain for the oldest TCPRoute attached to a
    /// listener.
    fn tcp_chain(
        &self,
        reports: &mut ReportMap,
        gw: &Gateway,
        listener: &Listener,
        routes: &Attached,
        tls: Option<TlsBundle>,
    ) -> Option<TcpFilterChainIr> {
        let route = routes
            .values()
            .filter_map(|(r, _)| match r.as_ref() {
                Route::Tcp(tcp) => Some((r, tcp)),
                Route::Http(_) => None,
            })
            .min_by(|(_, a), (_, b)| {
                a.creation_timestamp
                    .cmp(&b.creation_timestamp)
                    .then_with(|| a.source.cmp(&b.source))
            });
        let Some((route, tcp)) = route else {
            tracing::debug!(gateway = %gw.source, listener = %listener.name, "No TCPRoute attached");
            return None;
        };

        let backends = tcp
            .rules
            .first()
            .map(|r| r.backends.clone())
            .unwrap_or_default();
        for parent in route.parent_refs().iter().filter(|p| p.targets(&gw.source)) {
            let report = reports.route(route.source(), route.generation()).parent(parent);
            for error in backends.iter().filter_map(|b| b.error.as_ref()) {
                report.fail(conditions::RESOLVED_REFS, error.reason(), error.to_string());
            }
        }

        Some(TcpFilterChainIr {
            common: FilterChainCommon {
                name: format!("{}.{}-rule-0", tcp.source.namespace, tcp.source.name),
                server_names: match listener.protocol {
                    ListenerProtocol::Tls => listener.hostname.iter().cloned().collect(),
                    _ => vec![],
                },
                tls,
            },
            route: tcp.source.clone(),
            backends,
        })
    }

    /// Loads the certificate of a TLS-terminating listener. Problems are
    /// reported on the listener, which is then left out.
    fn tls_bundle(
        &self,
        ctx: &mut HandlerContext,
        reports: &mut ReportMap,
        gw: &Gateway,
        listener: &Listener,
    ) -> Option<TlsBundle> {
        let report = reports
            .gateway(&gw.source, gw.generation)
            .listener(&listener.name);
        let invalid = |report: &mut ListenerReport, reason: &str, message: String| {
            report.set_condition(Condition::new(
                conditions::RESOLVED_REFS,
                false,
                reason,
                message,
            ));
            None
        };

        let Some(cert) = listener.tls.as_ref().and_then(|t| t.certificate_refs.first()) else {
            return invalid(
                report,
                reasons::INVALID_CERTIFICATE_REF,
                "no certificate reference".to_string(),
            );
        };
        if cert.group_kind() != GroupKind::secret() {
            return invalid(
                report,
                reasons::INVALID_CERTIFICATE_REF,
                format!("unsupported certificate kind {}", cert.group_kind()),
            );
        }
        if !self
            .refgrants
            .reference_allowed(ctx, &GroupKind::gateway(), &gw.source.namespace, cert)
        {
            return invalid(
                report,
                reasons::REF_NOT_PERMITTED,
                format!("certificate {} is not permitted by any ReferenceGrant", cert.namespaced_name()),
            );
        }
        let secret = ctx.fetch(&self.secrets, &cert.resource_name());
        let Some((cert_chain, private_key)) = secret.as_deref().and_then(Secret::tls_pair) else {
            return invalid(
                report,
                reasons::INVALID_CERTIFICATE_REF,
                format!("secret {} is not a valid TLS secret", cert.namespaced_name()),
            );
        };

        let alpn_protocols = match listener.protocol {
            ListenerProtocol::Https => vec!["h2".to_string(), "http/1.1".to_string()],
            _ => vec![],
        };
        Some(TlsBundle {
            cert_chain: cert_chain.to_vec(),
            private_key: private_key.to_vec(),
            alpn_protocols,
        })
    }

    /// Records, for every policy involved in the gateway, whether it was
    /// accepted with the gateway as its ancestor.
    fn report_policies(
        &self,
        ctx: &mut HandlerContext,
        reports: &mut ReportMap,
        gw: &Gateway,
        ir: &GatewayIr,
        chains: &BTreeMap<ObjectSource, RouteChain>,
    ) {
        let mut report = |att: &PolicyAtt| {
            let Some(source) = &att.source else { return };
            let condition = if att.errors.is_empty() {
                Condition::new(conditions::ACCEPTED, true, reasons::ACCEPTED, "")
            } else {
                Condition::new(
                    conditions::ACCEPTED,
                    false,
                    reasons::INVALID,
                    att.errors.join("; "),
                )
            };
            let ancestor = reports.policy(source, None).ancestor(&gw.source);
            reports::set_condition(ancestor, condition);
        };

        let gateway_policies = [&ir.attached_policies, &ir.attached_http_policies];
        let listener_policies = ir.listeners.iter().map(|l| &l.attached_policies);
        let rule_policies = chains.values().flat_map(|c| {
            c.rules
                .iter()
                .flat_map(|r| [&r.attached_policies, &r.extension_refs])
        });
        for attached in gateway_policies
            .into_iter()
            .chain(listener_policies)
            .chain(rule_policies)
        {
            for (_, att) in attached.iter() {
                report(att);
            }
        }

        let gw_gk = GroupKind::gateway();
        let listener_names = gw.listeners.iter().map(|l| l.name.as_str()).collect::<Vec<_>>();
        let mut unknown = self.policies.unknown_sections(
            ctx,
            &gw_gk,
            &gw.source.namespace,
            &gw.source.name,
            &listener_names,
        );
        for route in chains.keys() {
            let Some(route) = ctx.fetch(self.routes.collection(), &route.resource_name()) else {
                continue;
            };
            let Some(http) = route.as_http() else { continue };
            let rule_names = http
                .rules
                .iter()
                .filter_map(|r| r.name.as_deref())
                .collect::<Vec<_>>();
            unknown.extend(self.policies.unknown_sections(
                ctx,
                &GroupKind::http_route(),
                &http.source.namespace,
                &http.source.name,
                &rule_names,
            ));
        }
        for (policy, section) in unknown {
            let ancestor = reports
                .policy(&policy.source, policy.generation)
                .ancestor(&gw.source);
            reports::set_condition(
                ancestor,
                Condition::new(
                    conditions::ACCEPTED,
                    false,
                    reasons::TARGET_NOT_FOUND,
                    format!("section {section} does not exist"),
                ),
            );
        }
    }
}

/// Reports the problems of an expanded route on each of its references to
/// the gateway.
fn report_chain(reports: &mut ReportMap, gw: &Gateway, route: &Route, chain: &RouteChain) {
    let report = reports.route(route.source(), route.generation());
    for parent in route.parent_refs().iter().filter(|p| p.targets(&gw.source)) {
        let parent = report.parent(parent);
        for error in &chain.errors {
            parent.fail(conditions::RESOLVED_REFS, error.reason(), error.to_string());
        }
        for rule in &chain.rules {
            for error in rule.backends.iter().filter_map(|b| b.backend.error.as_ref()) {
                parent.fail(conditions::RESOLVED_REFS, error.reason(), error.to_string());
            }
            if !rule.errors.is_empty() {
                parent.fail(
                    conditions::ACCEPTED,
                    reasons::UNSUPPORTED_VALUE,
                    rule.errors.join("; "),
                );
            }
        }
    }
}

/// Returns the hostnames a route serves on a listener.
///
/// A listener without a hostname accepts every route hostname; a route
/// without hostnames inherits the listener's. Wildcards match a single
/// leading label or more, and the more specific name is kept.
pub fn intersect_hostnames(listener: Option<&str>, route: &[String]) -> Vec<String> {
    let mut hosts = match (listener, route.is_empty()) {
        (None, true) => vec!["*".to_string()],
        (None, false) => route.to_vec(),
        (Some(l), true) => vec![l.to_string()],
        (Some(l), false) => route
            .iter()
            .filter_map(|h| {
                if h == l || wildcard_matches(l, h) {
                    Some(h.clone())
                } else if wildcard_matches(h, l) {
                    Some(l.to_string())
                } else {
                    None
                }
            })
            .collect(),
    };
    hosts.sort();
    hosts.dedup();
    hosts
}

fn wildcard_matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix('*') {
        Some(suffix) if suffix.starts_with('.') => {
            host.len() > suffix.len() && host.ends_with(suffix) && !host.starts_with('*')
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privileged_ports_are_shifted() {
        assert_eq!(bind_port(80), 8080);
        assert_eq!(bind_port(443), 8443);
        assert_eq!(bind_port(8080), 8080);
    }

    #[test]
    fn hostnames_intersect() {
        let hosts = |l: Option<&str>, r: &[&str]| {
            intersect_hostnames(l, &r.iter().map(|s| s.to_string()).collect::<Vec<_>>())
        };
        assert_eq!(hosts(None, &[]), ["*"]);
        assert_eq!(hosts(None, &["a.example.com"]), ["a.example.com"]);
        assert_eq!(hosts(Some("a.example.com"), &[]), ["a.example.com"]);
        assert_eq!(
            hosts(Some("*.example.com"), &["a.example.com", "b.other.com"]),
            ["a.example.com"]
        );
        assert_eq!(hosts(Some("a.example.com"), &["*.example.com"]), ["a.example.com"]);
        assert!(hosts(Some("a.example.com"), &["b.example.com"]).is_empty());
    }
}
