use ahash::AHashMap as HashMap;
use envoy_types::pb::{
    envoy::config::core::v3::Node,
    google::protobuf::{value::Kind, Struct},
};
use gateway_controller_core::{ir::Locality, Collection, Keyed, UniqueClient};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};

/// Node metadata naming the gateway a proxy serves.
pub const ROLE_KEY: &str = "role";
/// Node metadata holding the proxy's labels as a struct of strings.
pub const LABELS_KEY: &str = "labels";

/// The clients with at least one open stream.
#[derive(Clone, Debug)]
pub struct ClientRegistry {
    clients: Collection<UniqueClient>,
    streams: Arc<Mutex<HashMap<String, usize>>>,
}

/// Holds a client in the registry until dropped.
#[derive(Debug)]
pub struct Registration {
    registry: ClientRegistry,
    key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("node metadata has no {ROLE_KEY}")]
pub struct MissingRole;

/// Identifies the client a node belongs to.
pub fn client_from_node(node: &Node) -> Result<UniqueClient, MissingRole> {
    let metadata = node.metadata.as_ref();
    let role = metadata
        .and_then(|md| md.fields.get(ROLE_KEY))
        .and_then(|v| match v.kind.as_ref() {
            Some(Kind::StringValue(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        })
        .ok_or(MissingRole)?;

    let labels = metadata
        .and_then(|md| md.fields.get(LABELS_KEY))
        .and_then(|v| match v.kind.as_ref() {
            Some(Kind::StructValue(s)) => Some(string_fields(s)),
            _ => None,
        })
        .unwrap_or_default();

    let locality = node
        .locality
        .as_ref()
        .map(|l| Locality {
            region: l.region.clone(),
            zone: l.zone.clone(),
            subzone: l.sub_zone.clone(),
        })
        .unwrap_or_default();

    Ok(UniqueClient::new(role, labels, locality))
}

fn string_fields(s: &Struct) -> BTreeMap<String, String> {
    s.fields
        .iter()
        .filter_map(|(k, v)| match v.kind.as_ref() {
            Some(Kind::StringValue(s)) => Some((k.clone(), s.clone())),
            _ => None,
        })
        .collect()
}

// === impl ClientRegistry ===

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: Collection::new("clients"),
            streams: Default::default(),
        }
    }

    pub fn clients(&self) -> &Collection<UniqueClient> {
        &self.clients
    }

    /// Adds a stream for `client`. The client is added to the registry with
    /// its first stream.
    pub fn register(&self, client: UniqueClient) -> Registration {
        let key = client.resource_name();
        let mut streams = self.streams.lock();
        let count = streams.entry(key.clone()).or_default();
        *count += 1;
        if *count == 1 {
            tracing::debug!(client = %key, "Client connected");
            self.clients.upsert(client);
        }
        Registration {
            registry: self.clone(),
            key,
        }
    }

    fn release(&self, key: &str) {
        let mut streams = self.streams.lock();
        let Some(count) = streams.get_mut(key) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            streams.remove(key);
            tracing::debug!(client = %key, "Client disconnected");
            self.clients.remove(key);
        }
    }
}

// === impl Registration ===

impl Registration {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::{envoy::config::core::v3, google::protobuf::Value};

    fn string(s: &str) -> Value {
        Value {
            kind: Some(Kind::StringValue(s.to_string())),
        }
    }

    fn node(role: Option<&str>, zone: &str) -> Node {
        let mut fields = BTreeMap::new();
        if let Some(role) = role {
            fields.insert(ROLE_KEY.to_string(), string(role));
        }
        let labels = Struct {
            fields: maplit::btreemap! { "app".to_string() => string("gw") }
                .into_iter()
                .collect(),
        };
        fields.insert(
            LABELS_KEY.to_string(),
            Value {
                kind: Some(Kind::StructValue(labels)),
            },
        );
        Node {
            id: "gw-1234".to_string(),
            metadata: Some(Struct {
                fields: fields.into_iter().collect(),
            }),
            locality: Some(v3::Locality {
                region: "r".to_string(),
                zone: zone.to_string(),
                sub_zone: String::new(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn clients_from_node_metadata() {
        let client = client_from_node(&node(Some("ns~gw"), "z1")).unwrap();
        assert_eq!(client.role, "ns~gw");
        assert_eq!(client.labels.get("app").map(String::as_str), Some("gw"));
        assert_eq!(client.locality.zone, "z1");

        let other = client_from_node(&node(Some("ns~gw"), "z2")).unwrap();
        assert_ne!(client.resource_name(), other.resource_name());

        assert_eq!(client_from_node(&node(None, "z1")), Err(MissingRole));
    }

    #[test]
    fn clients_leave_with_their_last_stream() {
        let registry = ClientRegistry::new();
        let client = client_from_node(&node(Some("ns~gw"), "z1")).unwrap();
        let key = client.resource_name();

        let first = registry.register(client.clone());
        let second = registry.register(client);
        assert_eq!(registry.clients().len(), 1);

        drop(first);
        assert!(registry.clients().get(&key).is_some());
        drop(second);
        assert!(registry.clients().get(&key).is_none());
    }
}
