#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod gateway;
pub mod policy;

pub use k8s_openapi::{
    api::{
        self,
        core::v1::{Namespace, Node, Pod, Secret, Service, ServicePort, ServiceSpec},
        discovery::v1::{Endpoint, EndpointConditions, EndpointPort, EndpointSlice},
    },
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
};
pub use kube::{
    api::{ObjectMeta, ResourceExt},
    runtime::watcher,
    Resource,
};

/// The label that associates an EndpointSlice with its Service.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Returns the object's creation timestamp as a UTC time.
///
/// The timestamp is read through its RFC 3339 form so that callers do not
/// depend on the time library behind the generated types.
pub fn creation_timestamp<T: Resource>(obj: &T) -> Option<chrono::DateTime<chrono::Utc>> {
    let ts = obj.meta().creation_timestamp.as_ref()?;
    let value = serde_json::to_value(ts).ok()?;
    chrono::DateTime::parse_from_rfc3339(value.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&chrono::Utc))
}
