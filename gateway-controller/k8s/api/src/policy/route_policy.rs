use super::{LocalPolicyTargetReference, PolicyStatus};

/// Route-level settings, attached to HTTPRoutes by target reference or to a
/// single rule by an extensionRef filter.
#[derive(
    Clone, Debug, Default, kube::CustomResource, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[kube(
    group = "policy.gateway.dev",
    version = "v1alpha1",
    kind = "RoutePolicy",
    status = "PolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RoutePolicySpec {
    #[serde(default)]
    pub target_refs: Vec<LocalPolicyTargetReference>,

    /// Request timeout, in seconds. Zero leaves Envoy's default in place.
    #[serde(default)]
    pub timeout: u32,
}
