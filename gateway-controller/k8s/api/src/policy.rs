//! Controller-specific resources in the `policy.gateway.dev` group.

mod direct_response;
mod http_listener_policy;
mod route_policy;
mod target_ref;
mod upstream;

pub use self::{
    direct_response::{DirectResponse, DirectResponseSpec},
    http_listener_policy::{HttpListenerPolicy, HttpListenerPolicySpec},
    route_policy::{RoutePolicy, RoutePolicySpec},
    target_ref::LocalPolicyTargetReference,
    upstream::{StaticHost, StaticUpstream, Upstream, UpstreamSpec},
};

pub const GROUP: &str = "policy.gateway.dev";

/// Status shared by every policy kind: conditions per ancestor the policy was
/// evaluated against.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    #[serde(default)]
    pub ancestors: Vec<PolicyAncestorStatus>,
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyAncestorStatus {
    pub ancestor_ref: AncestorRef,
    pub controller_name: String,
    #[serde(default)]
    pub conditions: Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AncestorRef {
    pub group: Option<String>,
    pub kind: Option<String>,
    pub namespace: Option<String>,
    pub name: String,
}
