use super::service_of;
use crate::{
    envoy::{self, filter_names, string_struct, type_urls},
    extensions::PolicyPlugin,
};
use envoy_types::pb::envoy::{
    config::{
        cluster::v3::{cluster::TransportSocketMatch, Cluster},
        core::v3::{
            api_config_source::ApiType, config_source::ConfigSourceSpecifier, grpc_service,
            ApiConfigSource, ApiVersion, ConfigSource, GrpcService,
        },
    },
    extensions::transport_sockets::{
        raw_buffer::v3::RawBuffer,
        tls::v3::{
            common_tls_context::ValidationContextType, CommonTlsContext, SdsSecretConfig,
            UpstreamTlsContext,
        },
    },
};
use gateway_controller_core::{
    errors::PolicyError,
    ir::{AttachmentKind, GroupKind, OpaqueIr, PolicyAtt, Upstream},
};
use gateway_controller_k8s_index::{endpoints::TLS_MODE_MATCH_KEY, ClusterInfo};

/// The endpoint tls mode of workloads that accept mesh mTLS.
pub const ISTIO_TLS_MODE: &str = "istio";

const SDS_CLUSTER: &str = "gateway_proxy_sds";
const ROOT_CA_SECRET: &str = "ROOTCA";
const CERT_SECRET: &str = "default";

/// Originates mesh mTLS to Service endpoints that advertise it, and plaintext
/// to the rest. Applies to every Service upstream.
#[derive(Clone, Debug)]
pub struct IstioPlugin {
    trust_domain: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct AutoMtls;

// === impl IstioPlugin ===

impl IstioPlugin {
    pub fn new(cluster: &ClusterInfo) -> Self {
        Self {
            trust_domain: cluster.trust_domain.clone(),
        }
    }

    fn sni(&self, port: u16, namespace: &str, name: &str) -> String {
        format!(
            "outbound_.{port}_._.{name}.{namespace}.svc.{}",
            self.trust_domain
        )
    }
}

impl PolicyPlugin for IstioPlugin {
    fn group_kind(&self) -> GroupKind {
        GroupKind::new("istioplugin", "istioplugin")
    }

    fn name(&self) -> &'static str {
        "istio"
    }

    fn global_policy(&self) -> Option<PolicyAtt> {
        Some(PolicyAtt {
            group_kind: self.group_kind(),
            source: None,
            ir: OpaqueIr::new(AutoMtls),
            kind: AttachmentKind::TargetRef,
            errors: vec![],
        })
    }

    fn process_upstream(
        &self,
        policy: &PolicyAtt,
        upstream: &Upstream,
        out: &mut Cluster,
    ) -> Result<(), PolicyError> {
        if !policy.ir.is::<AutoMtls>() {
            return Ok(());
        }
        let Some((namespace, name)) = service_of(&upstream.source) else {
            return Ok(());
        };

        let tls = UpstreamTlsContext {
            common_tls_context: Some(CommonTlsContext {
                alpn_protocols: vec![ISTIO_TLS_MODE.to_string()],
                tls_certificate_sds_secret_configs: vec![sds_secret(CERT_SECRET)],
                validation_context_type: Some(
                    ValidationContextType::ValidationContextSdsSecretConfig(sds_secret(
                        ROOT_CA_SECRET,
                    )),
                ),
                ..Default::default()
            }),
            sni: self.sni(upstream.port, namespace, name),
            ..Default::default()
        };
        out.transport_socket_matches = vec![
            TransportSocketMatch {
                name: format!("{TLS_MODE_MATCH_KEY}-{ISTIO_TLS_MODE}"),
                r#match: Some(string_struct([(TLS_MODE_MATCH_KEY, ISTIO_TLS_MODE)])),
                transport_socket: Some(envoy::transport_socket(
                    filter_names::TLS_TRANSPORT_SOCKET,
                    type_urls::UPSTREAM_TLS_CONTEXT,
                    &tls,
                )),
            },
            TransportSocketMatch {
                name: format!("{TLS_MODE_MATCH_KEY}-disabled"),
                r#match: Some(string_struct(std::iter::empty())),
                transport_socket: Some(envoy::transport_socket(
                    filter_names::RAW_BUFFER,
                    type_urls::RAW_BUFFER,
                    &RawBuffer::default(),
                )),
            },
        ];
        Ok(())
    }
}

/// Fetches the named secret from the proxy's SDS server.
fn sds_secret(name: &str) -> SdsSecretConfig {
    SdsSecretConfig {
        name: name.to_string(),
        sds_config: Some(ConfigSource {
            resource_api_version: ApiVersion::V3 as i32,
            config_source_specifier: Some(ConfigSourceSpecifier::ApiConfigSource(
                ApiConfigSource {
                    api_type: ApiType::Grpc as i32,
                    transport_api_version: ApiVersion::V3 as i32,
                    set_node_on_first_message_only: true,
                    grpc_services: vec![GrpcService {
                        target_specifier: Some(grpc_service::TargetSpecifier::EnvoyGrpc(
                            grpc_service::EnvoyGrpc {
                                cluster_name: SDS_CLUSTER.to_string(),
                                ..Default::default()
                            },
                        )),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            )),
            ..Default::default()
        }),
    }
}
