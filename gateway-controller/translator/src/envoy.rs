//! Envoy protobuf helpers shared by the translation passes.

use envoy_types::pb::{
    envoy::config::core::v3::{
        config_source::ConfigSourceSpecifier, AggregatedConfigSource, ApiVersion, ConfigSource,
        TransportSocket, transport_socket,
    },
    google::protobuf::{Any, Duration, Struct, Value, value::Kind},
};
use gateway_controller_core::hash::fnv64_bytes;
use prost::Message;

pub mod type_urls {
    pub const LISTENER: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
    pub const CLUSTER: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
    pub const ROUTE_CONFIGURATION: &str =
        "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
    pub const CLUSTER_LOAD_ASSIGNMENT: &str =
        "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

    pub const HTTP_CONNECTION_MANAGER: &str = "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
    pub const TCP_PROXY: &str =
        "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";
    pub const ROUTER: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
    pub const COMPRESSOR: &str =
        "type.googleapis.com/envoy.extensions.filters.http.compressor.v3.Compressor";
    pub const GZIP: &str =
        "type.googleapis.com/envoy.extensions.compression.gzip.compressor.v3.Gzip";
    pub const TLS_INSPECTOR: &str =
        "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";
    pub const DOWNSTREAM_TLS_CONTEXT: &str =
        "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";
    pub const UPSTREAM_TLS_CONTEXT: &str =
        "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";
    pub const RAW_BUFFER: &str =
        "type.googleapis.com/envoy.extensions.transport_sockets.raw_buffer.v3.RawBuffer";
    pub const HTTP_PROTOCOL_OPTIONS: &str =
        "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
}

pub mod filter_names {
    pub const HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";
    pub const TCP_PROXY: &str = "envoy.filters.network.tcp_proxy";
    pub const ROUTER: &str = "envoy.filters.http.router";
    pub const TLS_INSPECTOR: &str = "envoy.filters.listener.tls_inspector";
    pub const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";
    pub const RAW_BUFFER: &str = "envoy.transport_sockets.raw_buffer";
    pub const HTTP_PROTOCOL_OPTIONS: &str = "envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
}

/// An encoded xDS resource and the FNV-1a hash of its bytes.
///
/// Encoding is deterministic as long as the message holds no map with more
/// than one entry, so the translator never emits such maps.
#[derive(Clone, Debug, PartialEq)]
pub struct XdsResource {
    pub name: String,
    pub any: Any,
    pub hash: u64,
}

// === impl XdsResource ===

impl XdsResource {
    pub fn new<M: Message>(name: impl Into<String>, type_url: &str, msg: &M) -> Self {
        let any = to_any(type_url, msg);
        let hash = fnv64_bytes(&any.value);
        Self {
            name: name.into(),
            any,
            hash,
        }
    }

    pub fn decode<M: Message + Default>(&self) -> Result<M, prost::DecodeError> {
        M::decode(self.any.value.as_slice())
    }
}

pub fn to_any<M: Message>(type_url: &str, msg: &M) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: msg.encode_to_vec(),
    }
}

/// A config source that fetches over the ADS stream the client is already
/// using.
pub fn ads_config_source() -> ConfigSource {
    ConfigSource {
        resource_api_version: ApiVersion::V3 as i32,
        config_source_specifier: Some(ConfigSourceSpecifier::Ads(AggregatedConfigSource {})),
        ..Default::default()
    }
}

pub fn seconds(secs: u32) -> Duration {
    Duration {
        seconds: i64::from(secs),
        nanos: 0,
    }
}

pub fn transport_socket<M: Message>(name: &str, type_url: &str, msg: &M) -> TransportSocket {
    TransportSocket {
        name: name.to_string(),
        config_type: Some(transport_socket::ConfigType::TypedConfig(to_any(type_url, msg))),
    }
}

/// A protobuf struct of string values.
pub fn string_struct<'a>(fields: impl IntoIterator<Item = (&'a str, &'a str)>) -> Struct {
    Struct {
        fields: fields
            .into_iter()
            .map(|(k, v)| {
                let value = Value {
                    kind: Some(Kind::StringValue(v.to_string())),
                };
                (k.to_string(), value)
            })
            .collect(),
    }
}
