use crate::ir::{GroupKind, ObjectSource};

/// A backend reference that could not be resolved. The referring rule keeps
/// its match and routes the backend's share of traffic to the black-hole
/// cluster.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error(
        "{} {} in namespace {} is not permitted by any ReferenceGrant",
        .target.kind, .target.name, .target.namespace
    )]
    MissingReferenceGrant {
        target: ObjectSource,
        from_namespace: String,
    },

    #[error("unknown backend kind {0}")]
    UnknownBackendKind(GroupKind),

    #[error("backend {} {} not found", .0.kind, .0.namespaced_name())]
    NotFound(ObjectSource),

    #[error("ignoring child route {}: cyclic reference", .child.namespaced_name())]
    CyclicReference {
        parent: ObjectSource,
        child: ObjectSource,
    },
}

/// A route parent reference that could not be attached.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("no listener matches the parent reference")]
    NoMatchingParent,

    #[error("the route is not allowed by any listener")]
    NotAllowedByListeners,

    #[error("no listener hostname matches the route hostnames")]
    NoMatchingListenerHostname,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("policy cannot be attached: {0}")]
    NotAttachable(String),
}

/// A failure to express part of a gateway's configuration. The translator
/// reports these and omits the affected resource.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TranslationError(pub String);

// === impl BackendError ===

impl BackendError {
    /// The status reason reported on the referring route.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingReferenceGrant { .. } => "RefNotPermitted",
            Self::UnknownBackendKind(_) => "InvalidKind",
            Self::NotFound(_) => "BackendNotFound",
            // Reported as an unresolved reference; the chain is simply cut.
            Self::CyclicReference { .. } => "BackendNotFound",
        }
    }
}

// === impl RouteError ===

impl RouteError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoMatchingParent => "NoMatchingParent",
            Self::NotAllowedByListeners => "NotAllowedByListeners",
            Self::NoMatchingListenerHostname => "NoMatchingListenerHostname",
        }
    }
}

// === impl TranslationError ===

impl TranslationError {
    pub fn new(msg: impl std::fmt::Display) -> Self {
        Self(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_reasons() {
        let svc = ObjectSource::new(&GroupKind::service(), "ns", "foo");
        assert_eq!(
            BackendError::MissingReferenceGrant {
                target: svc.clone(),
                from_namespace: "other".to_string(),
            }
            .reason(),
            "RefNotPermitted"
        );
        assert_eq!(
            BackendError::UnknownBackendKind(GroupKind::new("x", "Y")).reason(),
            "InvalidKind"
        );
        assert_eq!(BackendError::NotFound(svc.clone()).reason(), "BackendNotFound");
        assert_eq!(
            BackendError::NotFound(svc).to_string(),
            "backend Service ns/foo not found"
        );
    }

    #[test]
    fn cyclic_reference_message() {
        let route = ObjectSource::new(&GroupKind::http_route(), "a", "child");
        let err = BackendError::CyclicReference {
            parent: route.clone(),
            child: route,
        };
        assert_eq!(err.to_string(), "ignoring child route a/child: cyclic reference");
    }
}
