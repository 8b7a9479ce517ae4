//! Composes the snapshot each client is served from its gateway's
//! translation and the upstreams translated for that client.

use crate::cache::{Resources, Snapshot, SnapshotCache};
use ahash::AHashSet as HashSet;
use envoy_types::pb::envoy::{
    config::{
        cluster::v3::{
            cluster::{ClusterDiscoveryType, DiscoveryType},
            Cluster,
        },
        endpoint::v3::ClusterLoadAssignment,
        listener::v3::{filter, Listener},
        route::v3::{route, route_action::ClusterSpecifier, RouteConfiguration},
    },
    extensions::filters::network::http_connection_manager::v3::{
        http_connection_manager::RouteSpecifier, HttpConnectionManager,
    },
};
use gateway_controller_core::{
    collection::{self, Event, Item},
    ir::{EndpointsForUpstream, Upstream},
    Collection, Equals, Keyed, UniqueClient,
};
use gateway_controller_translator::{
    direct_response,
    envoy::{filter_names, type_urls, XdsResource},
    translate_endpoints, translate_upstream, GatewayXds, Plugins,
};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};
use tokio::{sync::Notify, time};

/// How often refused snapshots are retried.
const RETRY_INTERVAL: time::Duration = time::Duration::from_secs(1);

/// Builds and publishes per-client snapshots.
#[derive(Clone, Debug)]
pub struct Composer {
    clusters: Collection<ClientResource>,
    endpoints: Collection<ClientResource>,
    snapshots: Collection<ClientSnapshot>,
}

/// The snapshot composed for one client.
#[derive(Clone, Debug)]
pub struct ClientSnapshot {
    pub client: String,
    pub snapshot: Arc<Snapshot>,
}

/// A resource translated for one client.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientResource {
    pub client: String,
    pub resource: XdsResource,
    /// Set on clusters whose endpoints are discovered over EDS.
    pub eds: bool,
}

/// Names a resource to be translated for a client.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Pair {
    client: String,
    target: String,
}

// === impl Composer ===

impl Composer {
    /// Derives a snapshot for every client whose role names a translated
    /// gateway.
    ///
    /// Each client fans out a pair per upstream and per endpoint set, and
    /// each pair is translated on its own. An upstream change re-translates
    /// that upstream once per client; a new client translates only its own
    /// pairs.
    pub fn new(
        clients: &Collection<UniqueClient>,
        gateways: &Collection<GatewayXds>,
        upstreams: &Collection<Upstream>,
        endpoints: &Collection<EndpointsForUpstream>,
        plugins: Plugins,
    ) -> Self {
        let cluster_pairs = pairs("client-upstreams", clients, upstreams);
        let clusters = {
            let clients = clients.clone();
            let upstreams = upstreams.clone();
            let plugins = plugins.clone();
            cluster_pairs.map("client-clusters", move |ctx, pair: &Pair| {
                let client = ctx.fetch(&clients, &pair.client)?;
                let upstream = ctx.fetch(&upstreams, &pair.target)?;
                let cluster = translate_upstream(&plugins, Some(&*client), &upstream)
                    .map_err(|error| {
                        tracing::warn!(
                            %error,
                            client = %pair.client,
                            cluster = %pair.target,
                            "Failed to translate upstream"
                        );
                    })
                    .ok()?;
                Some(ClientResource {
                    client: pair.client.clone(),
                    eds: is_eds(&cluster),
                    resource: XdsResource::new(cluster.name.clone(), type_urls::CLUSTER, &cluster),
                })
            })
        };

        let endpoint_pairs = pairs("client-endpoint-sets", clients, endpoints);
        let assignments = {
            let clients = clients.clone();
            let endpoints = endpoints.clone();
            endpoint_pairs.map("client-endpoints", move |ctx, pair: &Pair| {
                let client = ctx.fetch(&clients, &pair.client)?;
                let endpoints = ctx.fetch(&endpoints, &pair.target)?;
                let cla = translate_endpoints(&plugins, Some(&*client), &endpoints);
                Some(ClientResource {
                    client: pair.client.clone(),
                    eds: false,
                    resource: XdsResource::new(
                        cla.cluster_name.clone(),
                        type_urls::CLUSTER_LOAD_ASSIGNMENT,
                        &cla,
                    ),
                })
            })
        };

        let clusters_by_client = clusters.index("clusters-by-client", |r: &ClientResource| {
            vec![r.client.clone()]
        });
        let endpoints_by_client = assignments.index("endpoints-by-client", |r: &ClientResource| {
            vec![r.client.clone()]
        });
        let gateways = gateways.clone();
        let snapshots = clients.map("client-snapshots", move |ctx, client: &UniqueClient| {
            let gateway = ctx.fetch(&gateways, &client.role)?;
            let key = client.resource_name();
            let clusters = ctx.fetch_index(&clusters_by_client, &key);
            let assignments = ctx.fetch_index(&endpoints_by_client, &key);
            let snapshot = compose(&gateway, &clusters, &assignments);
            tracing::debug!(
                client = %key,
                clusters = %snapshot.clusters.version,
                endpoints = %snapshot.endpoints.version,
                listeners = %snapshot.listeners.version,
                routes = %snapshot.routes.version,
                "Composed snapshot"
            );
            Some(ClientSnapshot {
                client: key,
                snapshot: Arc::new(snapshot),
            })
        });

        Self {
            clusters,
            endpoints: assignments,
            snapshots,
        }
    }

    /// Clusters translated per client.
    pub fn clusters(&self) -> &Collection<ClientResource> {
        &self.clusters
    }

    /// Load assignments translated per client.
    pub fn endpoints(&self) -> &Collection<ClientResource> {
        &self.endpoints
    }

    pub fn snapshots(&self) -> &Collection<ClientSnapshot> {
        &self.snapshots
    }

    /// Publishes snapshots to `cache` as they change, until `drain` is
    /// signaled. Snapshots the cache refuses are retried on the next tick
    /// unless a newer one replaces them first.
    pub async fn publish(self, cache: SnapshotCache, drain: drain::Watch) {
        let pending = Arc::new(Mutex::new(BTreeMap::<String, Option<Arc<Snapshot>>>::new()));
        let notify = Arc::new(Notify::new());
        {
            let pending = pending.clone();
            let notify = notify.clone();
            self.snapshots.subscribe(move |events| {
                let mut pending = pending.lock();
                for event in events {
                    match event {
                        Event::Added(s) | Event::Updated { new: s, .. } => {
                            pending.insert(s.client.clone(), Some(s.snapshot.clone()));
                        }
                        Event::Removed(s) => {
                            pending.insert(s.client.clone(), None);
                        }
                    }
                }
                notify.notify_one();
            });
        }
        {
            let mut pending = pending.lock();
            for s in self.snapshots.list() {
                pending.insert(s.client.clone(), Some(s.snapshot.clone()));
            }
        }

        let mut retry = time::interval(RETRY_INTERVAL);
        retry.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        tokio::pin! {
            let shutdown = drain.signaled();
        }
        loop {
            tokio::select! {
                _ = notify.notified() => {}
                _ = retry.tick() => {}
                _ = &mut shutdown => {
                    tracing::debug!("Snapshot publisher shutting down");
                    return;
                }
            }

            let batch = std::mem::take(&mut *pending.lock());
            for (client, snapshot) in batch {
                let Some(snapshot) = snapshot else {
                    tracing::debug!(%client, "Removing snapshot");
                    cache.remove(&client);
                    continue;
                };
                match cache.set(&client, snapshot.clone()) {
                    Ok(()) => tracing::debug!(%client, "Published snapshot"),
                    Err(error) => {
                        tracing::warn!(%error, %client, "Snapshot deferred");
                        pending.lock().entry(client).or_insert(Some(snapshot));
                    }
                }
            }
        }
    }
}

/// Pairs every client with every item of `targets`.
fn pairs<T: Item>(
    name: &str,
    clients: &Collection<UniqueClient>,
    targets: &Collection<T>,
) -> Collection<Pair> {
    let targets = targets.clone();
    clients.flat_map(name, move |ctx, client: &UniqueClient| {
        let client = client.resource_name();
        ctx.fetch_all(&targets)
            .iter()
            .map(|t| Pair {
                client: client.clone(),
                target: t.resource_name(),
            })
            .collect()
    })
}

/// Joins every backend kind's upstreams into one collection.
pub fn all_upstreams<'a>(
    kinds: impl IntoIterator<Item = &'a Collection<Upstream>>,
) -> Collection<Upstream> {
    let kinds = kinds.into_iter().cloned().collect::<Vec<_>>();
    collection::join("all-upstreams", &kinds)
}

/// Combines a gateway's resources with a client's upstreams, so that every
/// name a resource refers to is served:
///
/// - route configurations named by listeners but not translated are served
///   empty;
/// - routes to clusters that are not served respond with a 500;
/// - EDS clusters without endpoints are served an empty assignment;
/// - assignments for clusters that are not served are dropped.
fn compose(
    gateway: &GatewayXds,
    clusters: &[Arc<ClientResource>],
    assignments: &[Arc<ClientResource>],
) -> Snapshot {
    let resources = &gateway.resources;

    let mut eds = HashSet::new();
    let mut served = BTreeMap::new();
    for c in clusters {
        if c.eds {
            eds.insert(c.resource.name.clone());
        }
        served.insert(c.resource.name.clone(), c.resource.clone());
    }
    for c in &resources.clusters {
        if served.contains_key(&c.name) {
            continue;
        }
        if is_eds(c) {
            eds.insert(c.name.clone());
        }
        served.insert(
            c.name.clone(),
            XdsResource::new(c.name.clone(), type_urls::CLUSTER, c),
        );
    }

    let mut routes = resources
        .route_configurations
        .iter()
        .map(|rc| (rc.name.clone(), rc.clone()))
        .collect::<BTreeMap<_, _>>();
    for name in resources.listeners.iter().flat_map(route_config_names) {
        routes.entry(name.clone()).or_insert_with(|| {
            tracing::debug!(gateway = %gateway.source, route_config = %name, "Serving empty route configuration");
            RouteConfiguration {
                name,
                ..Default::default()
            }
        });
    }
    for rc in routes.values_mut() {
        fail_unserved_routes(rc, |name| served.contains_key(name));
    }

    let mut endpoints = assignments
        .iter()
        .filter(|a| eds.contains(&a.resource.name))
        .map(|a| (a.resource.name.clone(), a.resource.clone()))
        .collect::<BTreeMap<_, _>>();
    for name in &eds {
        endpoints.entry(name.clone()).or_insert_with(|| {
            let cla = ClusterLoadAssignment {
                cluster_name: name.clone(),
                ..Default::default()
            };
            XdsResource::new(name.clone(), type_urls::CLUSTER_LOAD_ASSIGNMENT, &cla)
        });
    }

    let clusters = versioned(served.into_values().collect());
    let endpoints = {
        let mut endpoints = versioned(endpoints.into_values().collect());
        endpoints.version = format!("{}-{}", clusters.version, endpoints.version);
        endpoints
    };
    let listeners = versioned(
        resources
            .listeners
            .iter()
            .map(|l| XdsResource::new(l.name.clone(), type_urls::LISTENER, l))
            .collect(),
    );
    let routes = versioned(
        routes
            .into_values()
            .map(|rc| XdsResource::new(rc.name.clone(), type_urls::ROUTE_CONFIGURATION, &rc))
            .collect(),
    );

    Snapshot {
        gateway: gateway.source.clone(),
        clusters,
        endpoints,
        listeners,
        routes,
    }
}

/// The version of a set of resources is the XOR of their hashes, so it does
/// not depend on their order.
fn versioned(items: Vec<XdsResource>) -> Resources {
    let version = items.iter().fold(0u64, |v, r| v ^ r.hash);
    Resources {
        version: version.to_string(),
        items,
    }
}

fn is_eds(cluster: &Cluster) -> bool {
    cluster.cluster_discovery_type == Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32))
}

/// Returns the RDS route configurations a listener's connection managers
/// refer to.
fn route_config_names(listener: &Listener) -> Vec<String> {
    listener
        .filter_chains
        .iter()
        .flat_map(|fc| fc.filters.iter())
        .filter(|f| f.name == filter_names::HTTP_CONNECTION_MANAGER)
        .filter_map(|f| match f.config_type.as_ref() {
            Some(filter::ConfigType::TypedConfig(any)) => {
                <HttpConnectionManager as prost::Message>::decode(any.value.as_slice()).ok()
            }
            _ => None,
        })
        .filter_map(|hcm| match hcm.route_specifier {
            Some(RouteSpecifier::Rds(rds)) => Some(rds.route_config_name),
            _ => None,
        })
        .collect()
}

fn fail_unserved_routes(rc: &mut RouteConfiguration, served: impl Fn(&str) -> bool) {
    for vh in &mut rc.virtual_hosts {
        for r in &mut vh.routes {
            let Some(route::Action::Route(action)) = r.action.as_ref() else {
                continue;
            };
            let missing = match action.cluster_specifier.as_ref() {
                Some(ClusterSpecifier::Cluster(name)) => !served(name),
                Some(ClusterSpecifier::WeightedClusters(wc)) => {
                    wc.clusters.iter().any(|c| !served(&c.name))
                }
                _ => false,
            };
            if missing {
                tracing::debug!(route = %r.name, "Route refers to a cluster that is not served");
                r.action = Some(direct_response(500, None));
            }
        }
    }
}

// === impl ClientSnapshot ===

impl Keyed for ClientSnapshot {
    fn resource_name(&self) -> String {
        self.client.clone()
    }
}

impl Equals for ClientSnapshot {
    fn equals(&self, other: &Self) -> bool {
        self.client == other.client
            && self.snapshot.gateway == other.snapshot.gateway
            && self.snapshot.versions() == other.snapshot.versions()
    }
}

// === impl ClientResource ===

impl Keyed for ClientResource {
    fn resource_name(&self) -> String {
        format!("{}/{}", self.client, self.resource.name)
    }
}

impl Equals for ClientResource {
    fn equals(&self, other: &Self) -> bool {
        self.client == other.client
            && self.eds == other.eds
            && self.resource.name == other.resource.name
            && self.resource.hash == other.resource.hash
    }
}

// === impl Pair ===

impl Keyed for Pair {
    fn resource_name(&self) -> String {
        format!("{}/{}", self.client, self.target)
    }
}

impl Equals for Pair {
    fn equals(&self, other: &Self) -> bool {
        self == other
    }
}
