use std::fmt;

pub const GATEWAY_GROUP: &str = "gateway.networking.k8s.io";

/// The API group and kind of a resource. The core group is the empty string.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

/// The identity of a resource, used as its key throughout the collection graph.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectSource {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

// === impl GroupKind ===

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }

    pub fn service() -> Self {
        Self::new("", "Service")
    }

    pub fn secret() -> Self {
        Self::new("", "Secret")
    }

    pub fn gateway() -> Self {
        Self::new(GATEWAY_GROUP, "Gateway")
    }

    pub fn http_route() -> Self {
        Self::new(GATEWAY_GROUP, "HTTPRoute")
    }

    pub fn tcp_route() -> Self {
        Self::new(GATEWAY_GROUP, "TCPRoute")
    }

    pub fn reference_grant() -> Self {
        Self::new(GATEWAY_GROUP, "ReferenceGrant")
    }

    /// Builds a group-kind from optional reference fields, treating the
    /// `core` alias as the empty group.
    pub fn from_ref(group: Option<&str>, kind: Option<&str>, default_kind: &str) -> Self {
        let group = match group {
            None | Some("core") => "",
            Some(group) => group,
        };
        Self::new(group, kind.unwrap_or(default_kind))
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}/{}", self.group, self.kind)
        }
    }
}

// === impl ObjectSource ===

impl ObjectSource {
    pub fn new(gk: &GroupKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: gk.group.clone(),
            kind: gk.kind.clone(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(self.group.clone(), self.kind.clone())
    }

    /// The collection key: `{group}/{kind}/{namespace}/{name}`.
    pub fn resource_name(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.group, self.kind, self.namespace, self.name
        )
    }

    /// `{namespace}/{name}`, for logs and status messages.
    pub fn namespaced_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for ObjectSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resource_name())
    }
}
