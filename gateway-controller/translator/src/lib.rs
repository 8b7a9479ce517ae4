//! Gateway Controller Translator
//!
//! Turns the IR built by the index into Envoy resources. Gateways translate
//! to listeners, route configurations and the clusters their filters need;
//! upstreams and their endpoints translate to clusters and load assignments,
//! optionally specialized for one client.
//!
//! Policy and backend kinds are open: each is contributed by a plugin (see
//! [`extensions`]), and the built-in kinds live in [`plugins`].

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod envoy;
pub mod extensions;
mod gateway;
pub mod plugins;
mod routes;
mod upstreams;

#[cfg(test)]
mod tests;

pub use self::{
    extensions::{
        BackendPlugin, GatewayTranslator, PolicyPlugin, Plugins, RouteContext, TranslationPass,
    },
    gateway::{IrTranslator, Stage},
    routes::direct_response,
    upstreams::{translate_endpoints, translate_upstream, CONNECT_TIMEOUT_SECS},
};
use envoy_types::pb::envoy::config::{
    cluster::v3::Cluster, listener::v3::Listener, route::v3::RouteConfiguration,
};
use gateway_controller_core::{
    ir::ObjectSource, reports::ReportMap, Collection, Equals, Keyed,
};
use gateway_controller_k8s_index::Index;
use std::sync::Arc;

/// The Envoy resources of one gateway.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TranslationResult {
    pub listeners: Vec<Listener>,
    pub route_configurations: Vec<RouteConfiguration>,
    /// Clusters required by the gateway's own filters. Upstream clusters are
    /// translated per client.
    pub clusters: Vec<Cluster>,
}

/// A translated gateway, keyed by the role its proxies connect with.
#[derive(Clone, Debug, PartialEq)]
pub struct GatewayXds {
    pub source: ObjectSource,
    pub role: String,
    pub resources: TranslationResult,
    /// Reports from building and translating the gateway.
    pub reports: ReportMap,
}

// === impl GatewayXds ===

impl Keyed for GatewayXds {
    fn resource_name(&self) -> String {
        self.role.clone()
    }
}

impl Equals for GatewayXds {
    fn equals(&self, other: &Self) -> bool {
        self == other
    }
}

/// Translates every built gateway.
///
/// Each gateway is translated by the first registered translator that
/// accepts it, or by an [`IrTranslator`] over `plugins` when none does.
pub fn gateway_translations(index: &Index, plugins: &Plugins) -> Collection<GatewayXds> {
    let gateways = index.gateways.clone();
    let plugins = plugins.clone();
    let default: Arc<dyn GatewayTranslator> = Arc::new(IrTranslator::new(plugins.clone()));
    index
        .gateway_irs
        .map("gateway-xds", move |ctx, built: &gateway_controller_k8s_index::BuiltGateway| {
            let gateway = ctx.fetch(&gateways, &built.ir.source.resource_name())?;
            let translator = plugins
                .translator_for(&gateway)
                .unwrap_or_else(|| default.clone());
            let mut reports = built.reports.clone();
            let resources = translator.translate(&built.ir, &mut reports);
            tracing::debug!(
                gateway = %built.ir.source,
                listeners = resources.listeners.len(),
                routes = resources.route_configurations.len(),
                "Translated gateway"
            );
            Some(GatewayXds {
                source: built.ir.source.clone(),
                role: gateway.role(),
                resources,
                reports,
            })
        })
}
