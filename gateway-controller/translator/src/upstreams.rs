//! Cluster and load-assignment translation.

use crate::{
    envoy::{self, string_struct},
    extensions::Plugins,
};
use envoy_types::pb::{
    envoy::config::{
        cluster::v3::Cluster,
        core::v3::{address, socket_address::PortSpecifier, Address, Locality, Metadata, SocketAddress},
        endpoint::v3::{lb_endpoint::HostIdentifier, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints},
    },
    google::protobuf::UInt32Value,
};
use gateway_controller_core::{
    errors::TranslationError,
    ir::{EndpointWithMd, EndpointsForUpstream, Upstream},
    UniqueClient,
};

pub const CONNECT_TIMEOUT_SECS: u32 = 5;

/// Translates an upstream to a cluster.
///
/// The upstream's backend plugin initializes the cluster. Then every policy
/// plugin, in group-kind order, specializes it for `client` and applies its
/// attached and global policies.
pub fn translate_upstream(
    plugins: &Plugins,
    client: Option<&UniqueClient>,
    upstream: &Upstream,
) -> Result<Cluster, TranslationError> {
    let mut out = Cluster {
        name: upstream.cluster_name(),
        connect_timeout: Some(envoy::seconds(CONNECT_TIMEOUT_SECS)),
        metadata: Some(Metadata::default()),
        ..Default::default()
    };

    let gk = upstream.group_kind();
    let backend = plugins
        .backend_plugin(&gk)
        .ok_or_else(|| TranslationError(format!("no backend plugin for {gk}")))?;
    backend.init_upstream(upstream, &mut out)?;

    for (gk, plugin) in plugins.policy_plugins() {
        if let Some(client) = client {
            plugin.per_client_process_upstream(client, upstream, &mut out);
        }
        let global = plugin.global_policy();
        for att in upstream.attached_policies.get(gk).iter().chain(global.as_ref()) {
            if let Err(error) = plugin.process_upstream(att, upstream, &mut out) {
                tracing::info!(%error, cluster = %out.name, policy = plugin.name(), "Policy not applied");
            }
        }
    }
    Ok(out)
}

/// Translates an upstream's endpoints to a load assignment, one locality
/// group per locality.
pub fn translate_endpoints(
    plugins: &Plugins,
    client: Option<&UniqueClient>,
    endpoints: &EndpointsForUpstream,
) -> ClusterLoadAssignment {
    let mut out = ClusterLoadAssignment {
        cluster_name: endpoints.cluster_name.clone(),
        endpoints: endpoints
            .by_locality
            .iter()
            .map(|(locality, eps)| {
                let mut eps = eps.iter().collect::<Vec<_>>();
                eps.sort_by(|a, b| (&a.address, a.port).cmp(&(&b.address, b.port)));
                LocalityLbEndpoints {
                    locality: Some(Locality {
                        region: locality.region.clone(),
                        zone: locality.zone.clone(),
                        sub_zone: locality.subzone.clone(),
                    }),
                    lb_endpoints: eps.into_iter().map(lb_endpoint).collect(),
                    ..Default::default()
                }
            })
            .collect(),
        ..Default::default()
    };

    if let Some(client) = client {
        for (_, plugin) in plugins.policy_plugins() {
            plugin.per_client_process_endpoints(client, endpoints, &mut out);
        }
    }
    out
}

fn lb_endpoint(ep: &EndpointWithMd) -> LbEndpoint {
    let metadata = (!ep.metadata.is_empty()).then(|| Metadata {
        filter_metadata: ep
            .metadata
            .iter()
            .map(|(ns, fields)| {
                let fields = fields.iter().map(|(k, v)| (k.as_str(), v.as_str()));
                (ns.clone(), string_struct(fields))
            })
            .collect(),
        ..Default::default()
    });
    LbEndpoint {
        host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
            address: Some(socket_address(&ep.address, ep.port)),
            ..Default::default()
        })),
        metadata,
        load_balancing_weight: Some(UInt32Value { value: ep.weight }),
        ..Default::default()
    }
}

pub(crate) fn socket_address(host: &str, port: u16) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            address: host.to_string(),
            port_specifier: Some(PortSpecifier::PortValue(u32::from(port))),
            ..Default::default()
        })),
    }
}
