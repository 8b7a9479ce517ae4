use crate::{
    envoy::{self, filter_names, type_urls},
    extensions::{sort_filters, GatewayTranslator, Plugins, TranslationPass},
    routes::RouteTranslator,
    TranslationResult, CONNECT_TIMEOUT_SECS,
};
use envoy_types::pb::envoy::{
    config::{
        cluster::v3::{
            cluster::{ClusterDiscoveryType, DiscoveryType},
            Cluster,
        },
        core::v3::{address, data_source, socket_address::PortSpecifier, Address, DataSource, SocketAddress},
        endpoint::v3::ClusterLoadAssignment,
        listener::v3::{filter, listener_filter, Filter, FilterChain, FilterChainMatch, Listener, ListenerFilter},
        route::v3::RouteConfiguration,
    },
    extensions::{
        filters::{
            http::router::v3::Router,
            listener::tls_inspector::v3::TlsInspector,
            network::{
                http_connection_manager::v3::{
                    http_connection_manager::{CodecType, RouteSpecifier},
                    http_filter, HttpConnectionManager, HttpFilter, Rds,
                },
                tcp_proxy::v3::{
                    tcp_proxy::{self, weighted_cluster::ClusterWeight},
                    TcpProxy,
                },
            },
        },
        transport_sockets::tls::v3::{CommonTlsContext, DownstreamTlsContext, TlsCertificate},
    },
};
use gateway_controller_core::{
    errors::{PolicyError, TranslationError},
    ir::{
        FilterChainCommon, GatewayIr, GroupKind, HttpFilterChainIr, ListenerIr, ObjectSource,
        PolicyAtt, TcpFilterChainIr, TlsBundle, BLACKHOLE_CLUSTER,
    },
    reports::{conditions, reasons, set_condition, Condition, ReportMap},
};
use std::{collections::BTreeMap, net::IpAddr};

/// Translates gateway IR with the registered policy plugins' translation
/// passes.
#[derive(Clone, Debug)]
pub struct IrTranslator {
    plugins: Plugins,
}

/// The phases of a gateway translation. A translation only moves forward.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Initialized,
    RoutesCompiled,
    FiltersEmitted,
    ClustersEmitted,
    Finalized,
}

struct Translation<'t> {
    stage: Stage,
    gateway: &'t GatewayIr,
    passes: BTreeMap<GroupKind, Box<dyn TranslationPass>>,
    reports: &'t mut ReportMap,
    uses_blackhole: bool,
}

// === impl Stage ===

impl Stage {
    pub fn advance(&mut self, next: Stage) -> Result<(), TranslationError> {
        if next <= *self {
            return Err(TranslationError(format!(
                "translation cannot move from {self:?} to {next:?}"
            )));
        }
        *self = next;
        Ok(())
    }
}

// === impl IrTranslator ===

impl IrTranslator {
    pub fn new(plugins: Plugins) -> Self {
        Self { plugins }
    }
}

impl GatewayTranslator for IrTranslator {
    fn translate(&self, gateway: &GatewayIr, reports: &mut ReportMap) -> TranslationResult {
        let mut t = Translation {
            stage: Stage::Initialized,
            gateway,
            passes: self.plugins.translation_passes(),
            reports,
            uses_blackhole: false,
        };
        let mut out = TranslationResult::default();

        let listeners = gateway
            .listeners
            .iter()
            .filter_map(|l| Some((l, t.bind(l)?)))
            .collect::<Vec<_>>();

        for (l, _) in &listeners {
            for fc in &l.http_filter_chains {
                out.route_configurations.push(t.route_configuration(fc));
            }
        }
        t.advance(Stage::RoutesCompiled);

        for (l, addr) in &listeners {
            if let Some(listener) = t.listener(l, addr.clone()) {
                out.listeners.push(listener);
            }
        }
        t.advance(Stage::FiltersEmitted);

        let mut clusters = t
            .passes
            .values_mut()
            .flat_map(|p| p.resources_to_add())
            .collect::<Vec<_>>();
        if t.uses_blackhole {
            clusters.push(blackhole_cluster());
        }
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        clusters.dedup_by(|a, b| a.name == b.name);
        out.clusters = clusters;
        t.advance(Stage::ClustersEmitted);

        t.advance(Stage::Finalized);
        out
    }
}

// === impl Translation ===

impl Translation<'_> {
    fn advance(&mut self, next: Stage) {
        if let Err(error) = self.stage.advance(next) {
            tracing::error!(%error, gateway = %self.gateway.source);
        }
    }

    fn bind(&mut self, l: &ListenerIr) -> Option<SocketAddress> {
        match l.bind_address.parse::<IpAddr>() {
            Ok(ip) => Some(SocketAddress {
                address: ip.to_string(),
                port_specifier: Some(PortSpecifier::PortValue(u32::from(l.bind_port))),
                ipv4_compat: ip.is_ipv6(),
                ..Default::default()
            }),
            Err(error) => {
                tracing::info!(%error, listener = %l.name, address = %l.bind_address, "Invalid bind address");
                self.reports
                    .gateways
                    .entry(self.gateway.source.clone())
                    .or_default()
                    .set_condition(Condition::new(
                        conditions::PROGRAMMED,
                        false,
                        reasons::INVALID_ADDRESS,
                        format!("invalid bind address {}: {error}", l.bind_address),
                    ));
                None
            }
        }
    }

    fn route_configuration(&mut self, fc: &HttpFilterChainIr) -> RouteConfiguration {
        let mut routes = RouteTranslator {
            gateway: &self.gateway.source,
            passes: &mut self.passes,
            reports: &mut *self.reports,
            uses_blackhole: false,
        };
        let virtual_hosts = fc
            .virtual_hosts
            .iter()
            .map(|vh| routes.virtual_host(vh))
            .collect();
        self.uses_blackhole |= routes.uses_blackhole;
        RouteConfiguration {
            name: fc.common.name.clone(),
            virtual_hosts,
            ..Default::default()
        }
    }

    fn listener(&mut self, l: &ListenerIr, addr: SocketAddress) -> Option<Listener> {
        let mut filter_chains = Vec::with_capacity(l.http_filter_chains.len() + l.tcp_filter_chains.len());
        for fc in &l.http_filter_chains {
            filter_chains.push(self.http_filter_chain(fc));
        }
        for fc in &l.tcp_filter_chains {
            filter_chains.push(self.tcp_filter_chain(fc));
        }
        if filter_chains.is_empty() {
            tracing::debug!(listener = %l.name, "Skipping listener without filter chains");
            return None;
        }

        let sni = filter_chains.iter().any(|fc| {
            fc.filter_chain_match
                .as_ref()
                .is_some_and(|m| !m.server_names.is_empty())
        });
        let mut listener = Listener {
            name: l.name.clone(),
            address: Some(Address {
                address: Some(address::Address::SocketAddress(addr)),
            }),
            filter_chains,
            listener_filters: if sni { vec![tls_inspector()] } else { vec![] },
            ..Default::default()
        };

        let gateway = self.gateway;
        for (gk, att) in gateway.attached_policies.iter().chain(l.attached_policies.iter()) {
            if !att.errors.is_empty() {
                continue;
            }
            let Some(pass) = self.passes.get_mut(gk) else {
                continue;
            };
            if let Err(error) = pass.apply_listener(att, &mut listener) {
                policy_failed(self.reports, &gateway.source, att, &error);
            }
        }
        Some(listener)
    }

    fn http_filter_chain(&mut self, fc: &HttpFilterChainIr) -> FilterChain {
        let mut hcm = HttpConnectionManager {
            stat_prefix: fc.common.name.clone(),
            codec_type: CodecType::Auto as i32,
            route_specifier: Some(RouteSpecifier::Rds(Rds {
                config_source: Some(envoy::ads_config_source()),
                route_config_name: fc.common.name.clone(),
            })),
            ..Default::default()
        };

        let gateway = self.gateway;
        let policies = gateway
            .attached_http_policies
            .iter()
            .chain(fc.attached_policies.iter());
        for (gk, att) in policies {
            if !att.errors.is_empty() {
                continue;
            }
            let Some(pass) = self.passes.get_mut(gk) else {
                continue;
            };
            if let Err(error) = pass.apply_http_filter_chain(att, &fc.common, &mut hcm) {
                policy_failed(self.reports, &gateway.source, att, &error);
            }
        }

        let staged = self
            .passes
            .values_mut()
            .flat_map(|p| p.http_filters(&fc.common))
            .collect();
        hcm.http_filters = sort_filters(staged);
        hcm.http_filters.push(HttpFilter {
            name: filter_names::ROUTER.to_string(),
            config_type: Some(http_filter::ConfigType::TypedConfig(envoy::to_any(
                type_urls::ROUTER,
                &Router::default(),
            ))),
            ..Default::default()
        });

        filter_chain(
            &fc.common,
            Filter {
                name: filter_names::HTTP_CONNECTION_MANAGER.to_string(),
                config_type: Some(filter::ConfigType::TypedConfig(envoy::to_any(
                    type_urls::HTTP_CONNECTION_MANAGER,
                    &hcm,
                ))),
            },
        )
    }

    fn tcp_filter_chain(&mut self, fc: &TcpFilterChainIr) -> FilterChain {
        let valid = fc
            .backends
            .iter()
            .filter(|b| b.weight > 0 && b.is_valid())
            .collect::<Vec<_>>();
        let cluster = match valid.as_slice() {
            [] => {
                tracing::debug!(chain = %fc.common.name, route = %fc.route, "No valid TCP backends");
                self.uses_blackhole = true;
                tcp_proxy::ClusterSpecifier::Cluster(BLACKHOLE_CLUSTER.to_string())
            }
            [b] => tcp_proxy::ClusterSpecifier::Cluster(b.cluster_name.clone()),
            backends => tcp_proxy::ClusterSpecifier::WeightedClusters(tcp_proxy::WeightedCluster {
                clusters: backends
                    .iter()
                    .map(|b| ClusterWeight {
                        name: b.cluster_name.clone(),
                        weight: b.weight,
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
        };
        let proxy = TcpProxy {
            stat_prefix: fc.common.name.clone(),
            cluster_specifier: Some(cluster),
            ..Default::default()
        };
        filter_chain(
            &fc.common,
            Filter {
                name: filter_names::TCP_PROXY.to_string(),
                config_type: Some(filter::ConfigType::TypedConfig(envoy::to_any(
                    type_urls::TCP_PROXY,
                    &proxy,
                ))),
            },
        )
    }
}

/// Records a policy that could not be applied on the policy's status for
/// this gateway.
pub(crate) fn policy_failed(
    reports: &mut ReportMap,
    gateway: &ObjectSource,
    att: &PolicyAtt,
    error: &PolicyError,
) {
    tracing::info!(%error, %gateway, kind = %att.group_kind, "Policy not applied");
    let Some(source) = &att.source else {
        return;
    };
    let conditions = reports
        .policies
        .entry(source.clone())
        .or_default()
        .ancestor(gateway);
    set_condition(
        conditions,
        Condition::new(conditions::ACCEPTED, false, reasons::INVALID, error.to_string()),
    );
}

fn filter_chain(common: &FilterChainCommon, filter: Filter) -> FilterChain {
    FilterChain {
        name: common.name.clone(),
        filter_chain_match: (!common.server_names.is_empty()).then(|| FilterChainMatch {
            server_names: common.server_names.clone(),
            ..Default::default()
        }),
        filters: vec![filter],
        transport_socket: common.tls.as_ref().map(downstream_tls),
        ..Default::default()
    }
}

fn downstream_tls(tls: &TlsBundle) -> envoy_types::pb::envoy::config::core::v3::TransportSocket {
    let inline = |bytes: &[u8]| DataSource {
        specifier: Some(data_source::Specifier::InlineBytes(bytes.to_vec())),
        ..Default::default()
    };
    let ctx = DownstreamTlsContext {
        common_tls_context: Some(CommonTlsContext {
            tls_certificates: vec![TlsCertificate {
                certificate_chain: Some(inline(&tls.cert_chain)),
                private_key: Some(inline(&tls.private_key)),
                ..Default::default()
            }],
            alpn_protocols: tls.alpn_protocols.clone(),
            ..Default::default()
        }),
        ..Default::default()
    };
    envoy::transport_socket(
        filter_names::TLS_TRANSPORT_SOCKET,
        type_urls::DOWNSTREAM_TLS_CONTEXT,
        &ctx,
    )
}

fn tls_inspector() -> ListenerFilter {
    ListenerFilter {
        name: filter_names::TLS_INSPECTOR.to_string(),
        config_type: Some(listener_filter::ConfigType::TypedConfig(envoy::to_any(
            type_urls::TLS_INSPECTOR,
            &TlsInspector::default(),
        ))),
        ..Default::default()
    }
}

/// A cluster with no endpoints. Envoy answers requests routed to it with a
/// 503.
fn blackhole_cluster() -> Cluster {
    Cluster {
        name: BLACKHOLE_CLUSTER.to_string(),
        connect_timeout: Some(envoy::seconds(CONNECT_TIMEOUT_SECS)),
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Static as i32)),
        load_assignment: Some(ClusterLoadAssignment {
            cluster_name: BLACKHOLE_CLUSTER.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_only_move_forward() {
        let mut stage = Stage::Initialized;
        stage.advance(Stage::RoutesCompiled).unwrap();
        stage.advance(Stage::ClustersEmitted).unwrap();
        assert!(stage.advance(Stage::FiltersEmitted).is_err());
        assert!(stage.advance(Stage::ClustersEmitted).is_err());
        assert_eq!(stage, Stage::ClustersEmitted);
        stage.advance(Stage::Finalized).unwrap();
    }
}
