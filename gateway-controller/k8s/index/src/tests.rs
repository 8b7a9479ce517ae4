use crate::{
    backends::service_upstreams, endpoints::service_endpoints, sources, ClusterInfo, Index,
    Sources,
};
use gateway_controller_core::{
    errors::BackendError,
    ir::{
        BackendRef, EndpointsForUpstream, GroupKind, HttpBackendOrDelegate, ListenerProtocol,
        ObjectSource, ParentRef, Route, BLACKHOLE_CLUSTER, GATEWAY_GROUP,
    },
    reports::{conditions, find_condition, reasons, Condition},
    Collection, HandlerContext,
};
use gateway_controller_k8s_api::{self as k8s, gateway as api};
use maplit::btreemap;
use serde_json::json;
use tracing::Level;

struct Fixture {
    sources: Sources,
    index: Index,
}

impl Fixture {
    fn new() -> Self {
        Self::with_cluster(ClusterInfo::default())
    }

    fn with_cluster(cluster: ClusterInfo) -> Self {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();

        let sources = Sources::new();
        let upstreams = service_upstreams(&sources.services, &cluster);
        let index = Index::new(
            &sources,
            &cluster,
            Collection::new("policies"),
            [(GroupKind::service(), upstreams)].into_iter().collect(),
        );
        Self { sources, index }
    }

    fn apply_service(&self, ns: &str, name: &str, ports: &[i32]) {
        self.sources
            .services
            .upsert(sources::obj(mk_service(ns, name, ports)).unwrap());
    }

    fn apply_gateway(&self, value: serde_json::Value) {
        let gw = serde_json::from_value::<api::Gateway>(value).expect("valid gateway");
        self.sources.gateways.upsert(sources::obj(gw).unwrap());
    }

    fn apply_http_route(&self, value: serde_json::Value) {
        let route = serde_json::from_value::<api::HttpRoute>(value).expect("valid route");
        self.sources.http_routes.upsert(sources::obj(route).unwrap());
    }

    fn apply_grant(&self, ns: &str, from_kind: &str, from_ns: &str) {
        let grant = serde_json::from_value::<api::ReferenceGrant>(json!({
            "apiVersion": "gateway.networking.k8s.io/v1beta1",
            "kind": "ReferenceGrant",
            "metadata": { "namespace": ns, "name": "allow" },
            "spec": {
                "from": [{
                    "group": GATEWAY_GROUP,
                    "kind": from_kind,
                    "namespace": from_ns,
                }],
                "to": [{ "group": "", "kind": "Service" }],
            },
        }))
        .expect("valid grant");
        self.sources
            .reference_grants
            .upsert(sources::obj(grant).unwrap());
    }

    fn route(&self, ns: &str, name: &str) -> std::sync::Arc<Route> {
        let key = ObjectSource::new(&GroupKind::http_route(), ns, name).resource_name();
        self.index
            .routes
            .collection()
            .get(&key)
            .expect("route must be indexed")
    }

    /// The direct backends of a route's first rule.
    fn backends(&self, ns: &str, name: &str) -> Vec<BackendRef> {
        let route = self.route(ns, name);
        let http = route.as_http().expect("HTTP route");
        http.rules[0]
            .backends
            .iter()
            .filter_map(|b| match b {
                HttpBackendOrDelegate::Backend(b) => Some(b.backend.clone()),
                HttpBackendOrDelegate::Delegate(_) => None,
            })
            .collect()
    }

    /// The condition of `type_` reported on a route's reference to the test
    /// gateway.
    fn route_condition(&self, ns: &str, name: &str, type_: &str) -> Option<Condition> {
        let gw = ObjectSource::new(&GroupKind::gateway(), "default", "gw");
        let built = self.index.gateway_irs.get(&gw.resource_name())?;
        let route = ObjectSource::new(&GroupKind::http_route(), ns, name);
        let parent = ParentRef {
            group: GATEWAY_GROUP.to_string(),
            kind: "Gateway".to_string(),
            namespace: "default".to_string(),
            name: "gw".to_string(),
            section_name: None,
            port: None,
        };
        let report = built.reports.routes.get(&route)?.parents.get(&parent)?;
        find_condition(&report.conditions, type_).cloned()
    }
}

pub(crate) fn mk_service(ns: &str, name: &str, ports: &[i32]) -> k8s::Service {
    k8s::Service {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(k8s::ServiceSpec {
            ports: Some(
                ports
                    .iter()
                    .map(|p| k8s::ServicePort {
                        name: Some(format!("port-{p}")),
                        port: *p,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn gateway(listeners: serde_json::Value) -> serde_json::Value {
    json!({
        "apiVersion": "gateway.networking.k8s.io/v1",
        "kind": "Gateway",
        "metadata": { "namespace": "default", "name": "gw" },
        "spec": {
            "gatewayClassName": gateway_controller_core::DEFAULT_GATEWAY_CLASS,
            "listeners": listeners,
        },
    })
}

fn http_gateway() -> serde_json::Value {
    gateway(json!([{
        "name": "http",
        "port": 80,
        "protocol": "HTTP",
        "allowedRoutes": { "namespaces": { "from": "All" } },
    }]))
}

fn http_route(ns: &str, name: &str, rules: serde_json::Value) -> serde_json::Value {
    json!({
        "apiVersion": "gateway.networking.k8s.io/v1",
        "kind": "HTTPRoute",
        "metadata": { "namespace": ns, "name": name },
        "spec": {
            "parentRefs": [{ "name": "gw", "namespace": "default" }],
            "rules": rules,
        },
    })
}

fn backend_rule(ns: &str, name: &str, port: i32) -> serde_json::Value {
    json!([{ "backendRefs": [{ "name": name, "namespace": ns, "port": port }] }])
}

#[test]
fn same_namespace_backend_resolves() {
    let test = Fixture::new();
    test.apply_service("default", "foo", &[8080]);
    test.apply_http_route(http_route("default", "route", backend_rule("default", "foo", 8080)));

    let backends = test.backends("default", "route");
    assert_eq!(backends.len(), 1);
    assert_eq!(backends[0].cluster_name, "Service/default/foo:8080");
    assert_eq!(backends[0].weight, 1);
    assert_eq!(backends[0].error, None);
}

#[test]
fn cross_namespace_backend_with_grant_resolves() {
    let test = Fixture::new();
    test.apply_service("other", "foo", &[8080]);
    test.apply_grant("other", "HTTPRoute", "default");
    test.apply_http_route(http_route("default", "route", backend_rule("other", "foo", 8080)));

    let backends = test.backends("default", "route");
    assert_eq!(backends[0].cluster_name, "Service/other/foo:8080");
    assert_eq!(backends[0].weight, 1);
    assert_eq!(backends[0].error, None);
}

#[test]
fn cross_namespace_backend_without_grant_is_blackholed() {
    let test = Fixture::new();
    test.apply_gateway(http_gateway());
    test.apply_service("other", "foo", &[8080]);
    test.apply_http_route(http_route("default", "route", backend_rule("other", "foo", 8080)));

    let backends = test.backends("default", "route");
    assert_eq!(backends[0].cluster_name, BLACKHOLE_CLUSTER);
    assert!(matches!(
        backends[0].error,
        Some(BackendError::MissingReferenceGrant { .. })
    ));

    let condition = test
        .route_condition("default", "route", conditions::RESOLVED_REFS)
        .expect("route must report unresolved refs");
    assert!(!condition.status);
    assert_eq!(condition.reason, "RefNotPermitted");
}

#[test]
fn grant_for_another_kind_does_not_permit() {
    let test = Fixture::new();
    test.apply_service("other", "foo", &[8080]);
    test.apply_grant("other", "NotHTTPRoute", "default");
    test.apply_http_route(http_route("default", "route", backend_rule("other", "foo", 8080)));

    let backends = test.backends("default", "route");
    assert!(matches!(
        backends[0].error,
        Some(BackendError::MissingReferenceGrant { .. })
    ));
}

#[test]
fn grants_apply_after_the_route() {
    let test = Fixture::new();
    test.apply_service("other", "foo", &[8080]);
    test.apply_http_route(http_route("default", "route", backend_rule("other", "foo", 8080)));
    assert!(test.backends("default", "route")[0].error.is_some());

    test.apply_grant("other", "HTTPRoute", "default");
    assert_eq!(test.backends("default", "route")[0].error, None);
}

#[test]
fn unknown_service_is_blackholed() {
    let test = Fixture::new();
    test.apply_gateway(http_gateway());
    test.apply_http_route(http_route("default", "route", backend_rule("default", "nope", 8080)));

    let backends = test.backends("default", "route");
    assert_eq!(backends[0].cluster_name, BLACKHOLE_CLUSTER);
    assert!(matches!(backends[0].error, Some(BackendError::NotFound(_))));

    let condition = test
        .route_condition("default", "route", conditions::RESOLVED_REFS)
        .expect("route must report unresolved refs");
    assert_eq!(condition.reason, "BackendNotFound");

    // The route is attached regardless.
    let gw = ObjectSource::new(&GroupKind::gateway(), "default", "gw");
    let built = test.index.gateway_irs.get(&gw.resource_name()).unwrap();
    let vhosts = &built.ir.listeners[0].http_filter_chains[0].virtual_hosts;
    assert_eq!(vhosts.len(), 1);
    assert_eq!(vhosts[0].hostname, "*");
    assert_eq!(vhosts[0].rules.len(), 1);
}

#[test]
fn cyclic_delegation_is_cut() {
    let test = Fixture::new();
    test.apply_gateway(http_gateway());
    test.apply_service("default", "foo", &[8080]);
    test.apply_http_route(http_route(
        "default",
        "a",
        json!([
            { "backendRefs": [{ "group": GATEWAY_GROUP, "kind": "HTTPRoute", "name": "b" }] },
            { "backendRefs": [{ "name": "foo", "port": 8080 }] },
        ]),
    ));
    test.apply_http_route(json!({
        "apiVersion": "gateway.networking.k8s.io/v1",
        "kind": "HTTPRoute",
        "metadata": { "namespace": "default", "name": "b" },
        "spec": {
            "rules": [
                { "backendRefs": [{ "group": GATEWAY_GROUP, "kind": "HTTPRoute", "name": "a" }] },
            ],
        },
    }));

    let a = test.route("default", "a");
    let ctx = &mut HandlerContext::new();
    let chain = test.index.routes.route_chain(ctx, a.as_http().unwrap());

    assert_eq!(
        chain.errors,
        vec![BackendError::CyclicReference {
            parent: ObjectSource::new(&GroupKind::http_route(), "default", "b"),
            child: ObjectSource::new(&GroupKind::http_route(), "default", "a"),
        }]
    );
    // Only a's direct rule survives; neither route is traversed twice.
    assert_eq!(chain.rules.len(), 1);
    assert_eq!(chain.rules[0].route.name, "a");
    assert_eq!(chain.rules[0].rule_index, 1);
    assert_eq!(
        chain.rules[0].backends[0].backend.cluster_name,
        "Service/default/foo:8080"
    );
}

#[test]
fn delegated_rules_are_inlined() {
    let test = Fixture::new();
    test.apply_service("default", "foo", &[8080]);
    test.apply_http_route(http_route(
        "default",
        "parent",
        json!([{
            "matches": [{ "path": { "type": "PathPrefix", "value": "/api" } }],
            "backendRefs": [{ "group": GATEWAY_GROUP, "kind": "HTTPRoute", "name": "*" }],
        }]),
    ));
    test.apply_http_route(json!({
        "apiVersion": "gateway.networking.k8s.io/v1",
        "kind": "HTTPRoute",
        "metadata": { "namespace": "default", "name": "child" },
        "spec": {
            "rules": [
                {
                    "matches": [{ "path": { "type": "PathPrefix", "value": "/api/v1" } }],
                    "backendRefs": [{ "name": "foo", "port": 8080 }],
                },
                {
                    "matches": [{ "path": { "type": "PathPrefix", "value": "/web" } }],
                    "backendRefs": [{ "name": "foo", "port": 8080 }],
                },
            ],
        },
    }));

    let parent = test.route("default", "parent");
    let ctx = &mut HandlerContext::new();
    let chain = test.index.routes.route_chain(ctx, parent.as_http().unwrap());

    let child_rules = chain
        .rules
        .iter()
        .filter(|r| r.route.name == "child")
        .collect::<Vec<_>>();
    assert_eq!(child_rules.len(), 1, "{chain:#?}");
    assert_eq!(child_rules[0].matcher.path_str(), "/api/v1");
    assert_eq!(
        child_rules[0].delegated_by,
        Some(ObjectSource::new(&GroupKind::http_route(), "default", "parent"))
    );
}

#[test]
fn listeners_on_one_port_are_merged() {
    let test = Fixture::new();
    test.apply_gateway(gateway(json!([
        { "name": "a", "port": 80, "protocol": "HTTP", "hostname": "a.example.com" },
        { "name": "b", "port": 80, "protocol": "HTTP", "hostname": "b.example.com" },
        { "name": "c", "port": 80, "protocol": "TCP" },
        { "name": "d", "port": 80, "protocol": "HTTP", "hostname": "a.example.com" },
        { "name": "e", "port": 9000, "protocol": "UDP" },
    ])));

    let gw = ObjectSource::new(&GroupKind::gateway(), "default", "gw");
    let built = test.index.gateway_irs.get(&gw.resource_name()).unwrap();
    assert_eq!(built.ir.listeners.len(), 1);
    let listener = &built.ir.listeners[0];
    assert_eq!(listener.name, "listener~80");
    assert_eq!(listener.bind_port, 8080);
    assert_eq!(listener.http_filter_chains.len(), 1);
    assert_eq!(listener.http_filter_chains[0].common.name, "a");

    let report = &built.reports.gateways[&gw];
    let reason = |listener: &str, type_: &str| {
        find_condition(&report.listeners[listener].conditions, type_).map(|c| c.reason.clone())
    };
    assert_eq!(
        reason("c", conditions::CONFLICTED).as_deref(),
        Some(reasons::PROTOCOL_CONFLICT)
    );
    assert_eq!(
        reason("d", conditions::CONFLICTED).as_deref(),
        Some(reasons::HOSTNAME_CONFLICT)
    );
    assert_eq!(
        reason("e", conditions::ACCEPTED).as_deref(),
        Some(reasons::UNSUPPORTED_PROTOCOL)
    );
    assert_eq!(reason("a", conditions::CONFLICTED), None);
}

#[test]
fn gateways_of_other_classes_are_ignored() {
    let test = Fixture::new();
    let mut gw = http_gateway();
    gw["spec"]["gatewayClassName"] = json!("someone-else");
    test.apply_gateway(gw);
    assert!(test.index.gateways.is_empty());
    assert!(test.index.gateway_irs.is_empty());
}

#[test]
fn routes_from_other_namespaces_need_permission() {
    let test = Fixture::new();
    test.apply_service("apps", "foo", &[8080]);
    test.apply_gateway(gateway(json!([{ "name": "http", "port": 80, "protocol": "HTTP" }])));
    test.apply_http_route(http_route("apps", "route", backend_rule("apps", "foo", 8080)));

    let condition = test
        .route_condition("apps", "route", conditions::ACCEPTED)
        .expect("route must be rejected");
    assert!(!condition.status);
    assert_eq!(condition.reason, "NotAllowedByListeners");
}

#[test]
fn namespace_selectors_match_labels() {
    let test = Fixture::new();
    test.apply_service("apps", "foo", &[8080]);
    test.sources.namespaces.upsert(
        sources::obj(k8s::Namespace {
            metadata: k8s::ObjectMeta {
                name: Some("apps".to_string()),
                labels: Some(btreemap! { "team".to_string() => "web".to_string() }),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap(),
    );
    test.apply_gateway(gateway(json!([{
        "name": "http",
        "port": 8080,
        "protocol": "HTTP",
        "allowedRoutes": {
            "namespaces": {
                "from": "Selector",
                "selector": { "matchLabels": { "team": "web" } },
            },
        },
    }])));
    test.apply_http_route(http_route("apps", "route", backend_rule("apps", "foo", 8080)));

    assert_eq!(test.route_condition("apps", "route", conditions::ACCEPTED), None);
    let gw = ObjectSource::new(&GroupKind::gateway(), "default", "gw");
    let built = test.index.gateway_irs.get(&gw.resource_name()).unwrap();
    assert_eq!(built.reports.gateways[&gw].listeners["http"].attached_routes, 1);
    assert_eq!(built.ir.listeners[0].bind_port, 8080);
}

#[test]
fn https_listeners_need_certificates() {
    let test = Fixture::new();
    test.apply_gateway(gateway(json!([{
        "name": "https",
        "port": 443,
        "protocol": "HTTPS",
        "hostname": "example.com",
        "tls": { "certificateRefs": [{ "name": "cert" }] },
    }])));
    let gw = ObjectSource::new(&GroupKind::gateway(), "default", "gw");

    let built = test.index.gateway_irs.get(&gw.resource_name()).unwrap();
    assert!(built.ir.listeners.is_empty());
    let listener = &built.reports.gateways[&gw].listeners["https"];
    assert_eq!(
        find_condition(&listener.conditions, conditions::RESOLVED_REFS).map(|c| c.reason.as_str()),
        Some(reasons::INVALID_CERTIFICATE_REF)
    );

    test.sources.secrets.upsert(gateway_controller_core::ir::Secret {
        source: ObjectSource::new(&GroupKind::secret(), "default", "cert"),
        data: btreemap! {
            "tls.crt".to_string() => b"cert".to_vec(),
            "tls.key".to_string() => b"key".to_vec(),
        },
    });
    let built = test.index.gateway_irs.get(&gw.resource_name()).unwrap();
    let chain = &built.ir.listeners[0].http_filter_chains[0];
    assert_eq!(chain.common.server_names, ["example.com"]);
    let tls = chain.common.tls.as_ref().expect("chain must terminate TLS");
    assert_eq!(tls.cert_chain, b"cert");
    assert_eq!(built.ir.listeners[0].bind_port, 8443);
}

#[test]
fn listener_protocols_parse() {
    assert_eq!(ListenerProtocol::parse("HTTPS"), ListenerProtocol::Https);
    assert!(matches!(ListenerProtocol::parse("UDP"), ListenerProtocol::Other(_)));
}

// === endpoints ===

fn endpoint_fixture(cluster: ClusterInfo) -> (Sources, Collection<EndpointsForUpstream>) {
    tracing_subscriber::fmt()
        .with_max_level(Level::TRACE)
        .try_init()
        .ok();
    let sources = Sources::new();
    let upstreams = service_upstreams(&sources.services, &cluster);
    let endpoints = service_endpoints(&upstreams, &sources, &cluster);
    sources
        .services
        .upsert(sources::obj(mk_service("default", "foo", &[8080])).unwrap());
    (sources, endpoints)
}

fn apply_slice(sources: &Sources, name: &str, endpoints: serde_json::Value) {
    let slice = serde_json::from_value::<k8s::EndpointSlice>(json!({
        "apiVersion": "discovery.k8s.io/v1",
        "kind": "EndpointSlice",
        "metadata": {
            "namespace": "default",
            "name": name,
            "labels": { (k8s::SERVICE_NAME_LABEL): "foo" },
        },
        "addressType": "IPv4",
        "ports": [{ "name": "port-8080", "port": 80 }],
        "endpoints": endpoints,
    }))
    .expect("valid slice");
    sources.endpoint_slices.upsert(sources::obj(slice).unwrap());
}

#[test]
fn ready_endpoints_are_collected_once() {
    let (sources, endpoints) = endpoint_fixture(ClusterInfo::default());
    apply_slice(
        &sources,
        "foo-a",
        json!([
            { "addresses": ["10.0.0.1"], "zone": "us-east-1a" },
            { "addresses": ["10.0.0.2"], "conditions": { "ready": false } },
        ]),
    );
    apply_slice(&sources, "foo-b", json!([{ "addresses": ["10.0.0.1"] }]));

    let eps = endpoints
        .get("Service/default/foo:8080")
        .expect("endpoints must exist");
    assert_eq!(eps.len(), 1);
    let (locality, ep) = eps.iter().next().unwrap();
    assert_eq!(ep.address, "10.0.0.1");
    assert_eq!(ep.port, 80);
    assert!(locality.zone == "us-east-1a" || locality.zone.is_empty());
}

#[test]
fn endpoints_carry_pod_locality_and_mtls() {
    let cluster = ClusterInfo {
        enable_auto_mtls: true,
        ..Default::default()
    };
    let (sources, endpoints) = endpoint_fixture(cluster);
    let node = serde_json::from_value::<k8s::Node>(json!({
        "apiVersion": "v1",
        "kind": "Node",
        "metadata": {
            "name": "node-1",
            "labels": {
                (sources::REGION_LABEL): "us-east-1",
                (sources::ZONE_LABEL): "us-east-1b",
            },
        },
    }))
    .unwrap();
    sources.nodes.upsert(sources::obj(node).unwrap());
    let pod = serde_json::from_value::<k8s::Pod>(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "namespace": "default",
            "name": "foo-1",
            "labels": { "app": "foo", "security.istio.io/tlsMode": "istio" },
        },
        "spec": { "nodeName": "node-1", "containers": [] },
    }))
    .unwrap();
    sources.pods.upsert(sources::obj(pod).unwrap());
    apply_slice(
        &sources,
        "foo-a",
        json!([{
            "addresses": ["10.0.0.1"],
            "targetRef": { "kind": "Pod", "namespace": "default", "name": "foo-1" },
        }]),
    );

    let eps = endpoints.get("Service/default/foo:8080").unwrap();
    let (locality, ep) = eps.iter().next().unwrap();
    assert_eq!(locality.region, "us-east-1");
    assert_eq!(locality.zone, "us-east-1b");
    assert_eq!(ep.labels.get("app").map(String::as_str), Some("foo"));
    assert_eq!(
        ep.metadata
            .get(gateway_controller_core::ir::TRANSPORT_SOCKET_MATCH_KEY)
            .and_then(|md| md.get("tlsMode"))
            .map(String::as_str),
        Some("istio")
    );
}

#[test]
fn endpoints_without_pods_use_node_locality() {
    let (sources, endpoints) = endpoint_fixture(ClusterInfo::default());
    let node = serde_json::from_value::<k8s::Node>(json!({
        "apiVersion": "v1",
        "kind": "Node",
        "metadata": {
            "name": "node-2",
            "labels": {
                (sources::REGION_LABEL): "eu-west-1",
                (sources::ZONE_LABEL): "eu-west-1a",
            },
        },
    }))
    .unwrap();
    sources.nodes.upsert(sources::obj(node).unwrap());
    apply_slice(
        &sources,
        "foo-a",
        json!([
            { "addresses": ["10.0.0.1"], "nodeName": "node-2", "zone": "ignored" },
            { "addresses": ["10.0.0.2"], "nodeName": "node-9", "zone": "us-east-1c" },
        ]),
    );

    let eps = endpoints.get("Service/default/foo:8080").unwrap();
    let localities = eps
        .iter()
        .map(|(locality, ep)| (ep.address.clone(), locality.clone()))
        .collect::<std::collections::BTreeMap<_, _>>();
    assert_eq!(localities["10.0.0.1"].region, "eu-west-1");
    assert_eq!(localities["10.0.0.1"].zone, "eu-west-1a");
    assert_eq!(localities["10.0.0.2"].region, "");
    assert_eq!(localities["10.0.0.2"].zone, "us-east-1c");
}

#[test]
fn removed_service_ports_drop_endpoints() {
    let (sources, endpoints) = endpoint_fixture(ClusterInfo::default());
    apply_slice(&sources, "foo-a", json!([{ "addresses": ["10.0.0.1"] }]));
    assert!(endpoints.get("Service/default/foo:8080").is_some());

    sources
        .services
        .upsert(sources::obj(mk_service("default", "foo", &[9090])).unwrap());
    assert!(endpoints.get("Service/default/foo:8080").is_none());
}
