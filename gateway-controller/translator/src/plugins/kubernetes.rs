use crate::{
    envoy::{self, filter_names, type_urls},
    extensions::BackendPlugin,
};
use envoy_types::pb::envoy::{
    config::{
        cluster::v3::{
            cluster::{ClusterDiscoveryType, DiscoveryType, EdsClusterConfig, LbPolicy},
            Cluster,
        },
        core::v3::Http2ProtocolOptions,
    },
    extensions::upstreams::http::v3::{
        http_protocol_options::{explicit_http_config::ProtocolConfig, ExplicitHttpConfig, UpstreamProtocolOptions},
        HttpProtocolOptions,
    },
};
use gateway_controller_core::{
    errors::TranslationError,
    ir::{EndpointsForUpstream, GroupKind, Upstream},
    Collection,
};
use gateway_controller_k8s_index::{
    backends::{service_upstreams, ServicePortIr},
    endpoints::service_endpoints,
    ClusterInfo, Sources,
};

/// Service backends. Each Service port is an upstream whose endpoints come
/// from the Service's EndpointSlices.
#[derive(Clone, Debug)]
pub struct KubernetesPlugin {
    upstreams: Collection<Upstream>,
    endpoints: Collection<EndpointsForUpstream>,
}

/// Application protocols served over HTTP/2.
const H2_PROTOCOLS: &[&str] = &["kubernetes.io/h2c", "http2", "grpc"];

// === impl KubernetesPlugin ===

impl KubernetesPlugin {
    pub fn new(sources: &Sources, cluster: &ClusterInfo) -> Self {
        let upstreams = service_upstreams(&sources.services, cluster);
        let endpoints = service_endpoints(&upstreams, sources, cluster);
        Self {
            upstreams,
            endpoints,
        }
    }
}

impl BackendPlugin for KubernetesPlugin {
    fn group_kind(&self) -> GroupKind {
        GroupKind::service()
    }

    fn name(&self) -> &'static str {
        "kubernetes"
    }

    fn upstreams(&self) -> Collection<Upstream> {
        self.upstreams.clone()
    }

    fn endpoints(&self) -> Option<Collection<EndpointsForUpstream>> {
        Some(self.endpoints.clone())
    }

    fn init_upstream(&self, upstream: &Upstream, out: &mut Cluster) -> Result<(), TranslationError> {
        let port = upstream
            .ir
            .downcast_ref::<ServicePortIr>()
            .ok_or_else(|| TranslationError(format!("{} is not a Service port", out.name)))?;

        out.cluster_discovery_type = Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32));
        out.eds_cluster_config = Some(EdsClusterConfig {
            eds_config: Some(envoy::ads_config_source()),
            service_name: String::new(),
        });
        out.lb_policy = LbPolicy::RoundRobin as i32;

        if port
            .app_protocol
            .as_deref()
            .is_some_and(|p| H2_PROTOCOLS.contains(&p))
        {
            let options = HttpProtocolOptions {
                upstream_protocol_options: Some(UpstreamProtocolOptions::ExplicitHttpConfig(
                    ExplicitHttpConfig {
                        protocol_config: Some(ProtocolConfig::Http2ProtocolOptions(
                            Http2ProtocolOptions::default(),
                        )),
                    },
                )),
                ..Default::default()
            };
            out.typed_extension_protocol_options = [(
                filter_names::HTTP_PROTOCOL_OPTIONS.to_string(),
                envoy::to_any(type_urls::HTTP_PROTOCOL_OPTIONS, &options),
            )]
            .into_iter()
            .collect();
        }
        Ok(())
    }
}
