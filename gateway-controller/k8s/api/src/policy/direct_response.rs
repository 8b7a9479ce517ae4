use super::PolicyStatus;

/// A fixed response, referenced from HTTPRoute rules by extensionRef.
#[derive(
    Clone, Debug, kube::CustomResource, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[kube(
    group = "policy.gateway.dev",
    version = "v1alpha1",
    kind = "DirectResponse",
    status = "PolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DirectResponseSpec {
    pub status_code: u32,
    pub body: Option<String>,
}
