use super::{LocalPolicyTargetReference, PolicyStatus};

/// HTTP connection manager settings for every HTTP listener of a Gateway.
#[derive(
    Clone, Debug, Default, kube::CustomResource, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[kube(
    group = "policy.gateway.dev",
    version = "v1alpha1",
    kind = "HttpListenerPolicy",
    status = "PolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HttpListenerPolicySpec {
    #[serde(default)]
    pub target_refs: Vec<LocalPolicyTargetReference>,

    /// Enables gzip compression of responses.
    #[serde(default)]
    pub compress: bool,
}
