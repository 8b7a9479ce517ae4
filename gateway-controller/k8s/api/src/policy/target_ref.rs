/// Targets a resource, or one section of it, in the policy's own namespace.
#[derive(
    Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct LocalPolicyTargetReference {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    pub name: String,
    pub section_name: Option<String>,
}

impl LocalPolicyTargetReference {
    /// Checks whether the target references the given resource type.
    pub fn targets_kind<T>(&self) -> bool
    where
        T: kube::Resource,
        T::DynamicType: Default,
    {
        let dt = Default::default();
        let group = match self.group.as_str() {
            "core" => "",
            g => g,
        };
        *group == *T::group(&dt) && *self.kind == *T::kind(&dt)
    }

    /// Returns the target ref kind, qualified by its group, if necessary.
    pub fn canonical_kind(&self) -> String {
        if self.group.is_empty() {
            self.kind.clone()
        } else {
            format!("{}.{}", self.kind, self.group)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{gateway::HttpRoute, Service};

    #[test]
    fn targets_gateway_kinds() {
        let t = LocalPolicyTargetReference {
            group: "gateway.networking.k8s.io".to_string(),
            kind: "HTTPRoute".to_string(),
            name: "r".to_string(),
            section_name: None,
        };
        assert!(t.targets_kind::<HttpRoute>());
        assert!(!t.targets_kind::<Service>());
        assert_eq!(t.canonical_kind(), "HTTPRoute.gateway.networking.k8s.io");
    }

    #[test]
    fn core_alias_targets_core_kinds() {
        let t = LocalPolicyTargetReference {
            group: "core".to_string(),
            kind: "Service".to_string(),
            name: "svc".to_string(),
            section_name: None,
        };
        assert!(t.targets_kind::<Service>());
    }
}
