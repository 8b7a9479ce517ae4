//! The plugin registry.
//!
//! Policy kinds and backend kinds are contributed by plugins. The IR carries
//! their payloads opaquely and only the plugin that registered a kind
//! interprets them. Plugins are keyed by group-kind and always visited in
//! group-kind order so that translation output is deterministic.

use crate::TranslationResult;
use ahash::AHashMap as HashMap;
use envoy_types::pb::envoy::{
    config::{
        cluster::v3::Cluster,
        endpoint::v3::ClusterLoadAssignment,
        listener::v3::Listener,
        route::v3::Route,
    },
    extensions::filters::network::http_connection_manager::v3::{
        http_filter, HttpConnectionManager, HttpFilter,
    },
};
use gateway_controller_core::{
    collection,
    errors::{PolicyError, TranslationError},
    ir::{
        EndpointsForUpstream, FilterChainCommon, Gateway, GatewayIr, GroupKind,
        HttpRouteRuleMatchIr, ObjectSource, PolicyAtt, PolicyWrapper, Upstream,
    },
    reports::ReportMap,
    Collection, UniqueClient,
};
use std::{collections::BTreeMap, fmt, sync::Arc};

/// A policy kind.
pub trait PolicyPlugin: Send + Sync + 'static {
    fn group_kind(&self) -> GroupKind;

    fn name(&self) -> &'static str;

    /// The policies of this kind. Kinds without a resource, such as global
    /// policies, return `None`.
    fn policies(&self) -> Option<Collection<PolicyWrapper>> {
        None
    }

    /// A policy applied to every upstream, as if attached to each.
    fn global_policy(&self) -> Option<PolicyAtt> {
        None
    }

    fn process_upstream(
        &self,
        _policy: &PolicyAtt,
        _upstream: &Upstream,
        _out: &mut Cluster,
    ) -> Result<(), PolicyError> {
        Ok(())
    }

    fn per_client_process_upstream(
        &self,
        _client: &UniqueClient,
        _upstream: &Upstream,
        _out: &mut Cluster,
    ) {
    }

    fn per_client_process_endpoints(
        &self,
        _client: &UniqueClient,
        _endpoints: &EndpointsForUpstream,
        _out: &mut ClusterLoadAssignment,
    ) {
    }

    /// Creates the state used while translating one gateway.
    fn new_gateway_translation_pass(&self) -> Option<Box<dyn TranslationPass>> {
        None
    }
}

/// A backend kind: where its upstreams come from and how their clusters are
/// initialized.
pub trait BackendPlugin: Send + Sync + 'static {
    fn group_kind(&self) -> GroupKind;

    fn name(&self) -> &'static str;

    fn upstreams(&self) -> Collection<Upstream>;

    /// Endpoints for kinds whose clusters use EDS.
    fn endpoints(&self) -> Option<Collection<EndpointsForUpstream>> {
        None
    }

    fn init_upstream(&self, upstream: &Upstream, out: &mut Cluster) -> Result<(), TranslationError>;
}

/// Translates a gateway's IR into Envoy resources.
pub trait GatewayTranslator: Send + Sync {
    fn translate(&self, gateway: &GatewayIr, reports: &mut ReportMap) -> TranslationResult;
}

pub type TranslatorFactory =
    Arc<dyn Fn(&Gateway) -> Option<Arc<dyn GatewayTranslator>> + Send + Sync>;

/// Per-gateway state of a policy plugin. Every hook is optional.
pub trait TranslationPass: Send {
    fn apply_listener(&mut self, _policy: &PolicyAtt, _out: &mut Listener) -> Result<(), PolicyError> {
        Ok(())
    }

    /// Applies an HTTP-level policy to one HTTP filter chain.
    fn apply_http_filter_chain(
        &mut self,
        _policy: &PolicyAtt,
        _fc: &FilterChainCommon,
        _hcm: &mut HttpConnectionManager,
    ) -> Result<(), PolicyError> {
        Ok(())
    }

    fn apply_for_route(
        &mut self,
        _policy: &PolicyAtt,
        _ctx: &RouteContext<'_>,
        _out: &mut Route,
    ) -> Result<(), PolicyError> {
        Ok(())
    }

    /// HTTP filters to add to a filter chain, called once per chain after its
    /// policies have been applied.
    fn http_filters(&mut self, _fc: &FilterChainCommon) -> Vec<StagedHttpFilter> {
        vec![]
    }

    /// Extra clusters referenced by the filters this pass emitted.
    fn resources_to_add(&mut self) -> Vec<Cluster> {
        vec![]
    }
}

pub struct RouteContext<'a> {
    pub gateway: &'a ObjectSource,
    pub rule: &'a HttpRouteRuleMatchIr,
}

/// The well-known positions of HTTP filters in a filter chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WellKnownStage {
    Fault,
    Cors,
    AuthN,
    AuthZ,
    RateLimit,
    Accepted,
    Route,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RelativeTo {
    Before,
    During,
    After,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FilterStage {
    pub stage: WellKnownStage,
    pub relative: RelativeTo,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StagedHttpFilter {
    pub stage: FilterStage,
    pub filter: HttpFilter,
}

/// Every registered plugin.
#[derive(Clone, Default)]
pub struct Plugins {
    policies: BTreeMap<GroupKind, Arc<dyn PolicyPlugin>>,
    backends: BTreeMap<GroupKind, Arc<dyn BackendPlugin>>,
    translators: Vec<TranslatorFactory>,
}

// === impl FilterStage ===

impl FilterStage {
    pub fn during(stage: WellKnownStage) -> Self {
        Self {
            stage,
            relative: RelativeTo::During,
        }
    }

    pub fn before(stage: WellKnownStage) -> Self {
        Self {
            stage,
            relative: RelativeTo::Before,
        }
    }

    pub fn after(stage: WellKnownStage) -> Self {
        Self {
            stage,
            relative: RelativeTo::After,
        }
    }
}

// === impl StagedHttpFilter ===

impl StagedHttpFilter {
    pub fn new(stage: FilterStage, name: impl Into<String>, config: envoy_types::pb::google::protobuf::Any) -> Self {
        Self {
            stage,
            filter: HttpFilter {
                name: name.into(),
                config_type: Some(http_filter::ConfigType::TypedConfig(config)),
                ..Default::default()
            },
        }
    }
}

/// Orders filters by stage, then by name. Filters with the same name are
/// emitted once.
pub fn sort_filters(mut filters: Vec<StagedHttpFilter>) -> Vec<HttpFilter> {
    filters.sort_by(|a, b| {
        a.stage
            .cmp(&b.stage)
            .then_with(|| a.filter.name.cmp(&b.filter.name))
    });
    filters.dedup_by(|a, b| a.filter.name == b.filter.name);
    filters.into_iter().map(|f| f.filter).collect()
}

// === impl Plugins ===

impl Plugins {
    pub fn with_policy(mut self, plugin: impl PolicyPlugin) -> Self {
        self.policies.insert(plugin.group_kind(), Arc::new(plugin));
        self
    }

    pub fn with_backend(mut self, plugin: impl BackendPlugin) -> Self {
        self.backends.insert(plugin.group_kind(), Arc::new(plugin));
        self
    }

    pub fn with_translator(
        mut self,
        factory: impl Fn(&Gateway) -> Option<Arc<dyn GatewayTranslator>> + Send + Sync + 'static,
    ) -> Self {
        self.translators.push(Arc::new(factory));
        self
    }

    /// Merges `other` into this registry. Plugins registered for the same
    /// group-kind are replaced by `other`'s; translator factories are
    /// consulted in registration order.
    pub fn merge(mut self, other: Plugins) -> Self {
        self.policies.extend(other.policies);
        self.backends.extend(other.backends);
        self.translators.extend(other.translators);
        self
    }

    /// Iterates policy plugins in group-kind order.
    pub fn policy_plugins(&self) -> impl Iterator<Item = (&GroupKind, &Arc<dyn PolicyPlugin>)> {
        self.policies.iter()
    }

    pub fn policy_plugin(&self, gk: &GroupKind) -> Option<&Arc<dyn PolicyPlugin>> {
        self.policies.get(gk)
    }

    pub fn backend_plugin(&self, gk: &GroupKind) -> Option<&Arc<dyn BackendPlugin>> {
        self.backends.get(gk)
    }

    /// Every policy of every registered kind.
    pub fn policies(&self) -> Collection<PolicyWrapper> {
        let inputs = self
            .policies
            .values()
            .filter_map(|p| p.policies())
            .collect::<Vec<_>>();
        collection::join("policies", &inputs)
    }

    /// Upstreams by backend kind.
    pub fn upstreams(&self) -> HashMap<GroupKind, Collection<Upstream>> {
        self.backends
            .iter()
            .map(|(gk, p)| (gk.clone(), p.upstreams()))
            .collect()
    }

    /// Endpoints of every backend kind that has them.
    pub fn endpoints(&self) -> Collection<EndpointsForUpstream> {
        let inputs = self
            .backends
            .values()
            .filter_map(|p| p.endpoints())
            .collect::<Vec<_>>();
        collection::join("endpoints", &inputs)
    }

    /// Returns the first translator that accepts the gateway.
    pub fn translator_for(&self, gateway: &Gateway) -> Option<Arc<dyn GatewayTranslator>> {
        self.translators.iter().find_map(|f| f(gateway))
    }

    /// Creates a translation pass for every policy plugin that has one, in
    /// group-kind order.
    pub fn translation_passes(&self) -> BTreeMap<GroupKind, Box<dyn TranslationPass>> {
        self.policies
            .iter()
            .filter_map(|(gk, p)| Some((gk.clone(), p.new_gateway_translation_pass()?)))
            .collect()
    }
}

impl fmt::Debug for Plugins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugins")
            .field("policies", &self.policies.keys().collect::<Vec<_>>())
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .field("translators", &self.translators.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::google::protobuf::Any;

    struct Named(GroupKind, &'static str);

    impl PolicyPlugin for Named {
        fn group_kind(&self) -> GroupKind {
            self.0.clone()
        }

        fn name(&self) -> &'static str {
            self.1
        }
    }

    struct Fixed(&'static str);

    impl GatewayTranslator for Fixed {
        fn translate(&self, _: &GatewayIr, _: &mut ReportMap) -> TranslationResult {
            TranslationResult {
                listeners: vec![],
                route_configurations: vec![],
                clusters: vec![Cluster {
                    name: self.0.to_string(),
                    ..Default::default()
                }],
            }
        }
    }

    fn gateway(class: &str) -> Gateway {
        Gateway {
            source: ObjectSource::new(&GroupKind::gateway(), "default", "gw"),
            gateway_class_name: class.to_string(),
            listeners: vec![],
            attached_listener_policies: Default::default(),
            attached_http_policies: Default::default(),
            creation_timestamp: None,
            generation: None,
        }
    }

    #[test]
    fn merge_replaces_plugins_of_the_same_kind() {
        let gk = GroupKind::new("example.com", "Policy");
        let merged = Plugins::default()
            .with_policy(Named(gk.clone(), "first"))
            .merge(Plugins::default().with_policy(Named(gk.clone(), "second")));
        assert_eq!(merged.policy_plugin(&gk).map(|p| p.name()), Some("second"));
        assert_eq!(merged.policy_plugins().count(), 1);
    }

    #[test]
    fn first_accepting_translator_wins() {
        let plugins = Plugins::default()
            .with_translator(|gw: &Gateway| {
                (gw.gateway_class_name == "a").then(|| Arc::new(Fixed("a")) as Arc<dyn GatewayTranslator>)
            })
            .merge(Plugins::default().with_translator(|_: &Gateway| {
                Some(Arc::new(Fixed("fallback")) as Arc<dyn GatewayTranslator>)
            }));

        let name = |class: &str| {
            let t = plugins.translator_for(&gateway(class))?;
            let out = t.translate(
                &GatewayIr {
                    source: gateway(class).source,
                    listeners: vec![],
                    attached_policies: Default::default(),
                    attached_http_policies: Default::default(),
                },
                &mut ReportMap::default(),
            );
            out.clusters.first().map(|c| c.name.clone())
        };
        assert_eq!(name("a").as_deref(), Some("a"));
        assert_eq!(name("b").as_deref(), Some("fallback"));
    }

    #[test]
    fn filters_sort_by_stage_then_name() {
        let staged = |stage, name: &str| StagedHttpFilter::new(stage, name, Any::default());
        let sorted = sort_filters(vec![
            staged(FilterStage::after(WellKnownStage::Route), "compressor"),
            staged(FilterStage::during(WellKnownStage::AuthN), "b"),
            staged(FilterStage::during(WellKnownStage::AuthN), "a"),
            staged(FilterStage::before(WellKnownStage::AuthN), "z"),
            staged(FilterStage::during(WellKnownStage::AuthN), "a"),
        ]);
        let names = sorted.iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["z", "a", "b", "compressor"]);
    }
}
