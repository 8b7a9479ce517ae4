//! Gateway Controller xDS
//!
//! Serves translated configuration to proxies over the aggregated discovery
//! service. Each connected proxy is identified as a [`UniqueClient`]; the
//! [`Composer`] derives one [`Snapshot`] per client and publishes it to the
//! [`SnapshotCache`], from which the [`AdsServer`] streams it.
//!
//! [`UniqueClient`]: gateway_controller_core::UniqueClient

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cache;
pub mod clients;
pub mod composer;
pub mod debug;
pub mod metrics;
mod server;


pub use self::{
    cache::{CacheError, Resources, Snapshot, SnapshotCache},
    clients::{client_from_node, ClientRegistry},
    composer::{all_upstreams, ClientResource, ClientSnapshot, Composer},
    metrics::GrpcServerMetricsFamily,
    server::AdsServer,
};
