use crate::{
    gateway_translations,
    plugins::{self, Settings},
    translate_endpoints, translate_upstream, GatewayXds, Plugins,
};
use envoy_types::pb::envoy::{
    config::{
        cluster::v3::cluster::{ClusterDiscoveryType, DiscoveryType},
        listener::v3::{filter::ConfigType, Listener},
        route::v3::{route::Action, route_action::ClusterSpecifier, Route},
    },
    extensions::filters::network::http_connection_manager::v3::HttpConnectionManager,
};
use gateway_controller_core::{
    collection::Item,
    ir::{GroupKind, ObjectSource, BLACKHOLE_CLUSTER},
    Collection,
};
use gateway_controller_k8s_api::{self as k8s, gateway as api, policy};
use gateway_controller_k8s_index::{sources, ClusterInfo, Index, Sources};
use prost::Message;
use serde_json::json;
use std::sync::Arc;
use tracing::Level;

struct Fixture {
    sources: Sources,
    plugins: Plugins,
    _index: Index,
    xds: Collection<GatewayXds>,
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
        let plugins = plugins::builtin(&sources, &cluster, &Settings::default());
        let index = Index::new(&sources, &cluster, plugins.policies(), plugins.upstreams());
        let xds = gateway_translations(&index, &plugins);
        Self {
            sources,
            plugins,
            _index: index,
            xds,
        }
    }

    fn apply<R>(&self, collection: &Collection<sources::Obj<R>>, value: serde_json::Value)
    where
        R: k8s::Resource<DynamicType = ()> + serde::de::DeserializeOwned,
        sources::Obj<R>: Item,
    {
        let resource = serde_json::from_value::<R>(value).expect("valid resource");
        collection.upsert(sources::obj(resource).expect("named resource"));
    }

    fn apply_service(&self, name: &str, port: i32, app_protocol: Option<&str>) {
        self.apply(
            &self.sources.services,
            json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": { "namespace": "default", "name": name },
                "spec": {
                    "ports": [{ "name": "http", "port": port, "appProtocol": app_protocol }],
                },
            }),
        );
    }

    fn apply_gateway(&self) {
        self.apply(
            &self.sources.gateways,
            json!({
                "apiVersion": "gateway.networking.k8s.io/v1",
                "kind": "Gateway",
                "metadata": { "namespace": "default", "name": "gw" },
                "spec": {
                    "gatewayClassName": gateway_controller_core::DEFAULT_GATEWAY_CLASS,
                    "listeners": [{
                        "name": "http",
                        "port": 80,
                        "protocol": "HTTP",
                    }],
                },
            }),
        );
    }

    fn apply_route(&self, name: &str, rules: serde_json::Value) {
        self.apply::<api::HttpRoute>(
            &self.sources.http_routes,
            json!({
                "apiVersion": "gateway.networking.k8s.io/v1",
                "kind": "HTTPRoute",
                "metadata": { "namespace": "default", "name": name },
                "spec": {
                    "parentRefs": [{ "name": "gw" }],
                    "rules": rules,
                },
            }),
        );
    }

    fn gateway(&self) -> Arc<GatewayXds> {
        self.xds.get("default~gw").expect("gateway must translate")
    }

    fn listener(&self) -> Listener {
        let xds = self.gateway();
        let [listener] = xds.resources.listeners.as_slice() else {
            panic!("expected one listener: {:?}", xds.resources.listeners);
        };
        listener.clone()
    }

    /// The routes of the first virtual host of the `http` route configuration.
    fn routes(&self) -> Vec<Route> {
        let xds = self.gateway();
        let rc = xds
            .resources
            .route_configurations
            .iter()
            .find(|rc| rc.name == "http")
            .expect("route configuration must exist");
        rc.virtual_hosts[0].routes.clone()
    }
}

fn hcm(listener: &Listener) -> HttpConnectionManager {
    let filter = &listener.filter_chains[0].filters[0];
    let Some(ConfigType::TypedConfig(any)) = filter.config_type.as_ref() else {
        panic!("expected a typed config");
    };
    HttpConnectionManager::decode(any.value.as_slice()).expect("valid HCM")
}

fn cluster_of(route: &Route) -> Option<&ClusterSpecifier> {
    match route.action.as_ref()? {
        Action::Route(action) => action.cluster_specifier.as_ref(),
        _ => None,
    }
}

fn direct_status(route: &Route) -> Option<u32> {
    match route.action.as_ref()? {
        Action::DirectResponse(dr) => Some(dr.status),
        _ => None,
    }
}

#[test]
fn http_listener_routes_to_service() {
    let test = Fixture::new();
    test.apply_service("web", 8080, None);
    test.apply_gateway();
    test.apply_route("web", json!([{ "backendRefs": [{ "name": "web", "port": 8080 }] }]));

    let listener = test.listener();
    assert_eq!(listener.name, "listener~80");
    assert_eq!(listener.filter_chains.len(), 1);

    let hcm = hcm(&listener);
    let names = hcm
        .http_filters
        .iter()
        .map(|f| f.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, ["envoy.filters.http.router"]);

    let routes = test.routes();
    assert_eq!(routes.len(), 1);
    assert_eq!(
        cluster_of(&routes[0]),
        Some(&ClusterSpecifier::Cluster("Service/default/web:8080".to_string()))
    );
}

#[test]
fn translation_is_deterministic() {
    let encode = || {
        let test = Fixture::new();
        test.apply_service("a", 80, None);
        test.apply_service("b", 80, None);
        test.apply_gateway();
        test.apply_route(
            "split",
            json!([{
                "backendRefs": [
                    { "name": "a", "port": 80, "weight": 1 },
                    { "name": "b", "port": 80, "weight": 3 },
                ],
            }]),
        );
        let xds = test.gateway();
        (
            xds.resources.listeners[0].encode_to_vec(),
            xds.resources.route_configurations[0].encode_to_vec(),
        )
    };
    assert_eq!(encode(), encode());
}

#[test]
fn missing_backends_share_the_blackhole() {
    let test = Fixture::new();
    test.apply_service("web", 8080, None);
    test.apply_gateway();
    test.apply_route(
        "web",
        json!([{
            "backendRefs": [
                { "name": "web", "port": 8080 },
                { "name": "missing", "port": 8080 },
            ],
        }]),
    );

    let routes = test.routes();
    let Some(ClusterSpecifier::WeightedClusters(wc)) = cluster_of(&routes[0]) else {
        panic!("expected weighted clusters: {:?}", routes[0]);
    };
    let names = wc.clusters.iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
    assert!(names.contains(&BLACKHOLE_CLUSTER));

    let xds = test.gateway();
    assert!(xds
        .resources
        .clusters
        .iter()
        .any(|c| c.name == BLACKHOLE_CLUSTER));
}

#[test]
fn rules_without_valid_backends_fail_closed() {
    let test = Fixture::new();
    test.apply_gateway();
    test.apply_route("web", json!([{ "backendRefs": [{ "name": "missing", "port": 80 }] }]));

    let routes = test.routes();
    assert_eq!(direct_status(&routes[0]), Some(500));
}

#[test]
fn extension_refs_respond_directly() {
    let test = Fixture::new();
    test.apply_gateway();
    test.apply::<policy::DirectResponse>(
        &test.sources.direct_responses,
        json!({
            "apiVersion": "policy.gateway.dev/v1alpha1",
            "kind": "DirectResponse",
            "metadata": { "namespace": "default", "name": "gone" },
            "spec": { "statusCode": 410, "body": "gone" },
        }),
    );
    test.apply_route(
        "web",
        json!([{
            "filters": [{
                "type": "ExtensionRef",
                "extensionRef": {
                    "group": policy::GROUP,
                    "kind": "DirectResponse",
                    "name": "gone",
                },
            }],
        }]),
    );

    let routes = test.routes();
    assert_eq!(direct_status(&routes[0]), Some(410));
}

#[test]
fn route_policies_set_timeouts() {
    let test = Fixture::new();
    test.apply_service("web", 8080, None);
    test.apply_gateway();
    test.apply_route("web", json!([{ "backendRefs": [{ "name": "web", "port": 8080 }] }]));
    test.apply::<policy::RoutePolicy>(
        &test.sources.route_policies,
        json!({
            "apiVersion": "policy.gateway.dev/v1alpha1",
            "kind": "RoutePolicy",
            "metadata": { "namespace": "default", "name": "slow" },
            "spec": {
                "targetRefs": [{
                    "group": "gateway.networking.k8s.io",
                    "kind": "HTTPRoute",
                    "name": "web",
                }],
                "timeout": 30,
            },
        }),
    );

    let routes = test.routes();
    let Some(Action::Route(action)) = routes[0].action.as_ref() else {
        panic!("expected a route action");
    };
    assert_eq!(action.timeout.as_ref().map(|t| t.seconds), Some(30));
}

#[test]
fn listener_policies_enable_compression() {
    let test = Fixture::new();
    test.apply_gateway();
    test.apply::<policy::HttpListenerPolicy>(
        &test.sources.http_listener_policies,
        json!({
            "apiVersion": "policy.gateway.dev/v1alpha1",
            "kind": "HttpListenerPolicy",
            "metadata": { "namespace": "default", "name": "gzip" },
            "spec": {
                "targetRefs": [{
                    "group": "gateway.networking.k8s.io",
                    "kind": "Gateway",
                    "name": "gw",
                }],
                "compress": true,
            },
        }),
    );

    let hcm = hcm(&test.listener());
    let names = hcm
        .http_filters
        .iter()
        .map(|f| f.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(
        names,
        ["envoy.filters.http.compressor", "envoy.filters.http.router"]
    );
}

#[test]
fn service_clusters_use_eds_and_mesh_mtls() {
    let test = Fixture::with_cluster(ClusterInfo {
        enable_auto_mtls: true,
        ..Default::default()
    });
    test.apply_service("grpc", 9090, Some("kubernetes.io/h2c"));

    let upstreams = test.plugins.upstreams();
    let upstream = upstreams[&GroupKind::service()]
        .get("Service/default/grpc:9090")
        .expect("upstream must exist");
    let cluster = translate_upstream(&test.plugins, None, &upstream).expect("must translate");

    assert_eq!(cluster.name, "Service/default/grpc:9090");
    assert_eq!(
        cluster.cluster_discovery_type,
        Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32))
    );
    assert_eq!(cluster.typed_extension_protocol_options.len(), 1);
    let matches = cluster
        .transport_socket_matches
        .iter()
        .map(|m| m.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(matches, ["tlsMode-istio", "tlsMode-disabled"]);
}

#[test]
fn static_upstreams_inline_their_hosts() {
    let test = Fixture::new();
    test.apply::<policy::Upstream>(
        &test.sources.upstreams,
        json!({
            "apiVersion": "policy.gateway.dev/v1alpha1",
            "kind": "Upstream",
            "metadata": { "namespace": "default", "name": "ext" },
            "spec": { "static": { "hosts": [{ "host": "example.com", "port": 443 }] } },
        }),
    );

    let gk = GroupKind::new(policy::GROUP, "Upstream");
    let name = ObjectSource::new(&gk, "default", "ext");
    let upstreams = test.plugins.upstreams();
    let upstream = upstreams[&gk]
        .get(&gateway_controller_core::ir::cluster_name(&name, 0))
        .expect("upstream must exist");
    let cluster = translate_upstream(&test.plugins, None, &upstream).expect("must translate");
    assert_eq!(
        cluster.cluster_discovery_type,
        Some(ClusterDiscoveryType::Type(DiscoveryType::StrictDns as i32))
    );
    assert!(cluster.load_assignment.is_some());
}

#[test]
fn endpoints_translate_to_load_assignments() {
    let test = Fixture::new();
    test.apply_service("web", 8080, None);
    test.apply::<k8s::EndpointSlice>(
        &test.sources.endpoint_slices,
        json!({
            "apiVersion": "discovery.k8s.io/v1",
            "kind": "EndpointSlice",
            "metadata": {
                "namespace": "default",
                "name": "web-a",
                "labels": { (k8s::SERVICE_NAME_LABEL): "web" },
            },
            "addressType": "IPv4",
            "ports": [{ "name": "http", "port": 80 }],
            "endpoints": [
                { "addresses": ["10.0.0.2"] },
                { "addresses": ["10.0.0.1"] },
            ],
        }),
    );

    let endpoints = test.plugins.endpoints();
    let eps = endpoints
        .get("Service/default/web:8080")
        .expect("endpoints must exist");
    let cla = translate_endpoints(&test.plugins, None, &eps);
    assert_eq!(cla.cluster_name, "Service/default/web:8080");
    let lbs = &cla.endpoints[0].lb_endpoints;
    assert_eq!(lbs.len(), 2);
    // Endpoints are ordered by address.
    assert_eq!(cla, translate_endpoints(&test.plugins, None, &eps));
}
