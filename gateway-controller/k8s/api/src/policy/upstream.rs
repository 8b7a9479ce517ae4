/// A backend outside the cluster's service registry.
#[derive(
    Clone, Debug, Default, kube::CustomResource, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[kube(
    group = "policy.gateway.dev",
    version = "v1alpha1",
    kind = "Upstream",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSpec {
    #[serde(rename = "static")]
    pub static_: Option<StaticUpstream>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StaticUpstream {
    #[serde(default)]
    pub hosts: Vec<StaticHost>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StaticHost {
    pub host: String,
    pub port: u16,
}
