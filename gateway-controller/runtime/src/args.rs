use crate::{
    core::{collection::Item, Collection, DEFAULT_CONTROLLER_NAME, DEFAULT_GATEWAY_CLASS},
    index::{
        metrics::{CollectionMetrics, IngestMetrics},
        sources, ClusterInfo, Index, Sources,
    },
    k8s::{self, gateway, policy, watcher},
    lease, status,
    translator::{self, plugins},
    xds,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use prometheus_client::registry::Registry;
use serde::de::DeserializeOwned;
use std::{fmt, net::SocketAddr};
use tokio::time::Duration;
use tonic::transport::Server;
use tracing::{info, info_span, instrument, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "gateway", about = "A Gateway API controller serving Envoy over xDS")]
pub struct Args {
    #[clap(long, default_value = "gateway=info,warn", env = "GATEWAY_CONTROLLER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:9977")]
    xds_addr: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:9095")]
    debug_addr: SocketAddr,

    /// The controller name GatewayClasses must name to be managed.
    #[clap(long, default_value = DEFAULT_CONTROLLER_NAME)]
    controller_name: String,

    /// The GatewayClass managed when no such class object exists.
    #[clap(long, default_value = DEFAULT_GATEWAY_CLASS)]
    gateway_class: String,

    #[clap(long, default_value = "cluster.local")]
    cluster_domain: String,

    #[clap(long, default_value = "cluster.local")]
    trust_domain: String,

    /// Originates Istio mutual TLS to endpoints that accept it.
    #[clap(long)]
    enable_auto_mtls: bool,

    /// Prioritizes endpoints by their locality relative to each proxy.
    #[clap(long)]
    locality_priority: bool,

    /// The maximum number of proxies served at once.
    #[clap(long, default_value = "10000")]
    snapshot_capacity: usize,

    #[clap(long, default_value = "5000")]
    status_patch_timeout_ms: u64,

    #[clap(long, default_value = "gateway-system")]
    control_plane_namespace: String,

    #[clap(long, default_value = "gateway-controller")]
    deployment_name: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            xds_addr,
            debug_addr,
            controller_name,
            gateway_class,
            cluster_domain,
            trust_domain,
            enable_auto_mtls,
            locality_priority,
            snapshot_capacity,
            status_patch_timeout_ms,
            control_plane_namespace,
            deployment_name,
        } = self;

        let cluster = ClusterInfo {
            controller_name: controller_name.clone(),
            gateway_class,
            dns_domain: cluster_domain,
            trust_domain,
            enable_auto_mtls,
        };

        let mut prom = <Registry>::default();
        let ingest_metrics = IngestMetrics::register(prom.sub_registry_with_prefix("index"));
        let grpc_metrics =
            xds::GrpcServerMetricsFamily::register(prom.sub_registry_with_prefix("grpc_server"));
        let status_metrics =
            status::ControllerMetrics::register(prom.sub_registry_with_prefix("resource_status"));

        // Build the derivation graph. Every collection stays empty until the
        // watches below fill the sources.
        let sources = Sources::new();
        let plugins = plugins::builtin(
            &sources,
            &cluster,
            &plugins::Settings { locality_priority },
        );
        let index = Index::new(&sources, &cluster, plugins.policies(), plugins.upstreams());
        let gateways = translator::gateway_translations(&index, &plugins);
        let registry = xds::ClientRegistry::new();
        let upstreams = xds::all_upstreams(index.backends.iter().map(|(_, c)| c));
        let endpoints = plugins.endpoints();
        let composer = xds::Composer::new(
            registry.clients(),
            &gateways,
            &upstreams,
            &endpoints,
            plugins.clone(),
        );

        let mut collections = CollectionMetrics::default();
        collections
            .push(&sources.gateways)
            .push(&sources.http_routes)
            .push(&sources.tcp_routes)
            .push(&sources.services)
            .push(&sources.endpoint_slices)
            .push(&index.gateways)
            .push(&index.gateway_irs)
            .push(&upstreams)
            .push(&endpoints)
            .push(&gateways)
            .push(registry.clients())
            .push(composer.clusters())
            .push(composer.endpoints())
            .push(composer.snapshots());
        collections.register(&mut prom);

        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let hostname =
            std::env::var("HOSTNAME").context("Failed to fetch `HOSTNAME` environment variable")?;

        let claims = lease::init(
            &runtime,
            &control_plane_namespace,
            &deployment_name,
            &hostname,
        )
        .await?;

        // Spawn resource watches.

        watch::<_, gateway::GatewayClass, _>(
            &mut runtime,
            "gatewayclasses",
            &sources.gateway_classes,
            &ingest_metrics,
            sources::obj,
        );
        watch::<_, gateway::Gateway, _>(
            &mut runtime,
            "gateways",
            &sources.gateways,
            &ingest_metrics,
            sources::obj,
        );
        watch::<_, gateway::HttpRoute, _>(
            &mut runtime,
            "httproutes",
            &sources.http_routes,
            &ingest_metrics,
            sources::obj,
        );
        watch::<_, gateway::TcpRoute, _>(
            &mut runtime,
            "tcproutes",
            &sources.tcp_routes,
            &ingest_metrics,
            sources::obj,
        );
        watch::<_, gateway::ReferenceGrant, _>(
            &mut runtime,
            "referencegrants",
            &sources.reference_grants,
            &ingest_metrics,
            sources::obj,
        );
        watch::<_, k8s::Namespace, _>(
            &mut runtime,
            "namespaces",
            &sources.namespaces,
            &ingest_metrics,
            sources::obj,
        );
        watch::<_, k8s::Service, _>(
            &mut runtime,
            "services",
            &sources.services,
            &ingest_metrics,
            sources::obj,
        );
        watch::<_, k8s::EndpointSlice, _>(
            &mut runtime,
            "endpointslices",
            &sources.endpoint_slices,
            &ingest_metrics,
            sources::obj,
        );
        watch::<_, k8s::Pod, _>(
            &mut runtime,
            "pods",
            &sources.pods,
            &ingest_metrics,
            sources::obj,
        );
        watch::<_, k8s::Node, _>(
            &mut runtime,
            "nodes",
            &sources.nodes,
            &ingest_metrics,
            sources::obj,
        );
        watch::<_, k8s::Secret, _>(
            &mut runtime,
            "secrets",
            &sources.secrets,
            &ingest_metrics,
            sources::secret,
        );
        watch::<_, policy::RoutePolicy, _>(
            &mut runtime,
            "routepolicies",
            &sources.route_policies,
            &ingest_metrics,
            sources::obj,
        );
        watch::<_, policy::DirectResponse, _>(
            &mut runtime,
            "directresponses",
            &sources.direct_responses,
            &ingest_metrics,
            sources::obj,
        );
        watch::<_, policy::HttpListenerPolicy, _>(
            &mut runtime,
            "httplistenerpolicies",
            &sources.http_listener_policies,
            &ingest_metrics,
            sources::obj,
        );
        watch::<_, policy::Upstream, _>(
            &mut runtime,
            "upstreams",
            &sources.upstreams,
            &ingest_metrics,
            sources::obj,
        );

        let drain = runtime.shutdown_handle();
        let cache = xds::SnapshotCache::new(snapshot_capacity);

        // Publish snapshots once every source has listed, so that proxies
        // never see a partial view of the cluster.
        tokio::spawn({
            let sources = sources.clone();
            let cache = cache.clone();
            let drain = drain.clone();
            async move {
                sources.synced().await;
                info!("Sources synced");
                composer.publish(cache, drain).await
            }
            .instrument(info_span!("publisher"))
        });

        let status_controller = status::Controller::new(
            claims,
            runtime.client(),
            hostname,
            controller_name,
            gateways,
            Duration::from_millis(status_patch_timeout_ms),
            status_metrics,
        );
        tokio::spawn({
            let drain = drain.clone();
            async move {
                sources.synced().await;
                status_controller.run(drain).await
            }
            .instrument(info_span!("status_controller"))
        });

        // Run the xDS server, serving snapshots from the cache.
        tokio::spawn(grpc(
            xds_addr,
            cache.clone(),
            registry,
            grpc_metrics,
            drain.clone(),
        ));

        tokio::spawn(
            xds::debug::serve(debug_addr, cache, drain)
                .map_err(|error| tracing::error!(%error, "Debug server failed"))
                .instrument(info_span!("debug")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Spawns a watch feeding `collection`.
fn watch<S, R, T>(
    runtime: &mut kubert::Runtime<S>,
    name: &'static str,
    collection: &Collection<T>,
    metrics: &IngestMetrics,
    convert: fn(R) -> Option<T>,
) where
    S: 'static,
    R: k8s::Resource<DynamicType = ()>
        + DeserializeOwned
        + Clone
        + fmt::Debug
        + Send
        + Sync
        + 'static,
    T: Item,
{
    let events = runtime.watch_all::<R>(watcher::Config::default());
    tokio::spawn(
        sources::ingest(events, collection.clone(), metrics.clone(), convert)
            .instrument(info_span!("watch", resource = name)),
    );
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn grpc(
    addr: SocketAddr,
    cache: xds::SnapshotCache,
    registry: xds::ClientRegistry,
    metrics: xds::GrpcServerMetricsFamily,
    drain: drain::Watch,
) -> Result<()> {
    let svc = xds::AdsServer::new(cache, registry, metrics, drain.clone()).svc();

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder().add_service(svc).serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "xDS server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}
