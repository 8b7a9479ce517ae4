use crate::{
    collection::{Equals, Keyed},
    hash::fnv64,
    ir::Locality,
};
use std::collections::BTreeMap;

/// A distinct proxy configuration target. Proxies that share a role, labels and
/// locality are served the same snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UniqueClient {
    pub role: String,
    pub labels: BTreeMap<String, String>,
    pub locality: Locality,
    resource_name: String,
}

impl UniqueClient {
    pub fn new(role: impl Into<String>, labels: BTreeMap<String, String>, locality: Locality) -> Self {
        let role = role.into();
        let hash = fnv64(&(&labels, &locality));
        Self {
            resource_name: format!("{role}~{hash}"),
            role,
            labels,
            locality,
        }
    }
}

impl Keyed for UniqueClient {
    /// `{role}~{hash(labels, locality)}`; the snapshot cache key.
    fn resource_name(&self) -> String {
        self.resource_name.clone()
    }
}

impl Equals for UniqueClient {
    fn equals(&self, other: &Self) -> bool {
        self == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn equal_descriptors_share_a_name() {
        let a = UniqueClient::new("ns~gw", btreemap! { "a".to_string() => "b".to_string() }, Locality::default());
        let b = UniqueClient::new("ns~gw", btreemap! { "a".to_string() => "b".to_string() }, Locality::default());
        assert_eq!(a.resource_name(), b.resource_name());
        assert!(a.resource_name().starts_with("ns~gw~"));

        let c = UniqueClient::new(
            "ns~gw",
            Default::default(),
            Locality {
                zone: "z".to_string(),
                ..Default::default()
            },
        );
        assert_ne!(a.resource_name(), c.resource_name());
    }
}
