//! The intermediate representation shared by the indices, the translator and
//! the snapshot publisher.

mod backend;
mod endpoints;
mod gateway;
mod listener;
mod object;
mod opaque;
mod policy;
mod route;
mod secret;

pub use self::{
    backend::{cluster_name, BackendRef, Upstream, BLACKHOLE_CLUSTER},
    endpoints::{EndpointWithMd, EndpointsForUpstream, Locality, TRANSPORT_SOCKET_MATCH_KEY},
    gateway::{
        gateway_role, AllowedNamespaces, AllowedRoutes, Gateway, Listener, ListenerProtocol,
        ListenerTls, TlsMode,
    },
    listener::{
        FilterChainCommon, GatewayIr, HttpFilterChainIr, HttpRouteRuleMatchIr, ListenerIr,
        TcpFilterChainIr, TlsBundle, VirtualHostIr,
    },
    object::{GroupKind, ObjectSource, GATEWAY_GROUP},
    opaque::{Opaque, OpaqueIr},
    policy::{AttachedPolicies, AttachmentKind, PolicyAtt, PolicyTargetRef, PolicyWrapper},
    route::{
        DelegateRef, HttpBackend, HttpBackendOrDelegate, HttpRouteIr, HttpRouteRuleIr, ParentRef,
        Route, TcpRouteIr, TcpRouteRuleIr,
    },
    secret::{Secret, TLS_CERT_KEY, TLS_KEY_KEY},
};
