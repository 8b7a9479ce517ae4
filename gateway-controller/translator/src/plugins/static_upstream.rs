use crate::{extensions::BackendPlugin, upstreams::socket_address};
use envoy_types::pb::envoy::config::{
    cluster::v3::{
        cluster::{ClusterDiscoveryType, DiscoveryType, LbPolicy},
        Cluster,
    },
    endpoint::v3::{lb_endpoint::HostIdentifier, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints},
};
use gateway_controller_core::{
    errors::TranslationError,
    ir::{AttachedPolicies, GroupKind, OpaqueIr, Upstream},
    Collection,
};
use gateway_controller_k8s_api::{
    self as k8s,
    policy::{self, StaticHost},
};
use gateway_controller_k8s_index::{Obj, Sources};
use std::net::IpAddr;

/// `Upstream` resources with a fixed list of hosts. Their clusters carry the
/// hosts inline rather than through EDS.
#[derive(Clone, Debug)]
pub struct StaticPlugin {
    upstreams: Collection<Upstream>,
}

/// The backend payload of a static upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticIr {
    pub hosts: Vec<StaticHost>,
}

// === impl StaticPlugin ===

impl StaticPlugin {
    pub fn new(sources: &Sources) -> Self {
        let upstreams = sources.upstreams.flat_map(
            "static-upstreams",
            |_, obj: &Obj<policy::Upstream>| {
                let Some(spec) = obj.resource.spec.static_.as_ref() else {
                    return vec![];
                };
                let Some(first) = spec.hosts.first() else {
                    return vec![];
                };
                vec![Upstream {
                    source: obj.source.clone(),
                    port: 0,
                    canonical_hostname: first.host.clone(),
                    ir: OpaqueIr::new(StaticIr {
                        hosts: spec.hosts.clone(),
                    }),
                    attached_policies: AttachedPolicies::default(),
                    creation_timestamp: k8s::creation_timestamp(&obj.resource),
                }]
            },
        );
        Self { upstreams }
    }
}

impl BackendPlugin for StaticPlugin {
    fn group_kind(&self) -> GroupKind {
        GroupKind::new(policy::GROUP, "Upstream")
    }

    fn name(&self) -> &'static str {
        "static"
    }

    fn upstreams(&self) -> Collection<Upstream> {
        self.upstreams.clone()
    }

    fn init_upstream(&self, upstream: &Upstream, out: &mut Cluster) -> Result<(), TranslationError> {
        let StaticIr { hosts } = upstream
            .ir
            .downcast_ref::<StaticIr>()
            .ok_or_else(|| TranslationError(format!("{} is not a static upstream", out.name)))?;

        let discovery = if hosts.iter().all(|h| h.host.parse::<IpAddr>().is_ok()) {
            DiscoveryType::Static
        } else {
            DiscoveryType::StrictDns
        };
        out.cluster_discovery_type = Some(ClusterDiscoveryType::Type(discovery as i32));
        out.lb_policy = LbPolicy::RoundRobin as i32;
        out.load_assignment = Some(ClusterLoadAssignment {
            cluster_name: out.name.clone(),
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints: hosts
                    .iter()
                    .map(|h| LbEndpoint {
                        host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
                            address: Some(socket_address(&h.host, h.port)),
                            hostname: h.host.clone(),
                            ..Default::default()
                        })),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_controller_core::ir::ObjectSource;

    fn upstream(hosts: &[(&str, u16)]) -> Upstream {
        Upstream {
            source: ObjectSource::new(&GroupKind::new(policy::GROUP, "Upstream"), "ns", "ext"),
            port: 0,
            canonical_hostname: hosts[0].0.to_string(),
            ir: OpaqueIr::new(StaticIr {
                hosts: hosts
                    .iter()
                    .map(|(host, port)| StaticHost {
                        host: host.to_string(),
                        port: *port,
                    })
                    .collect(),
            }),
            attached_policies: AttachedPolicies::default(),
            creation_timestamp: None,
        }
    }

    fn init(upstream: &Upstream) -> Cluster {
        let plugin = StaticPlugin::new(&Sources::default());
        let mut cluster = Cluster {
            name: upstream.cluster_name(),
            ..Default::default()
        };
        plugin.init_upstream(upstream, &mut cluster).expect("must init");
        cluster
    }

    #[test]
    fn addresses_are_static() {
        let cluster = init(&upstream(&[("10.0.0.1", 80), ("10.0.0.2", 80)]));
        assert_eq!(
            cluster.cluster_discovery_type,
            Some(ClusterDiscoveryType::Type(DiscoveryType::Static as i32))
        );
        let cla = cluster.load_assignment.expect("must have endpoints");
        assert_eq!(cla.endpoints[0].lb_endpoints.len(), 2);
    }

    #[test]
    fn hostnames_resolve_through_dns() {
        let cluster = init(&upstream(&[("10.0.0.1", 80), ("example.com", 443)]));
        assert_eq!(
            cluster.cluster_discovery_type,
            Some(ClusterDiscoveryType::Type(DiscoveryType::StrictDns as i32))
        );
    }
}
