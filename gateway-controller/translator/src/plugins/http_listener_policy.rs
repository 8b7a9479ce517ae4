use super::wrap;
use crate::{
    envoy::{self, type_urls},
    extensions::{FilterStage, PolicyPlugin, StagedHttpFilter, TranslationPass, WellKnownStage},
};
use ahash::AHashSet as HashSet;
use envoy_types::pb::envoy::{
    config::core::v3::TypedExtensionConfig,
    extensions::{
        compression::gzip::compressor::v3::Gzip,
        filters::{
            http::compressor::v3::Compressor,
            network::http_connection_manager::v3::HttpConnectionManager,
        },
    },
};
use gateway_controller_core::{
    errors::PolicyError,
    ir::{FilterChainCommon, GroupKind, OpaqueIr, PolicyAtt, PolicyWrapper},
    Collection,
};
use gateway_controller_k8s_api::policy::{self, HttpListenerPolicy};
use gateway_controller_k8s_index::{Obj, Sources};

const COMPRESSOR_FILTER: &str = "envoy.filters.http.compressor";
const GZIP_LIBRARY: &str = "envoy.compression.gzip.compressor";

#[derive(Clone, Debug)]
pub struct HttpListenerPolicyPlugin {
    policies: Collection<PolicyWrapper>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpListenerPolicyIr {
    pub compress: bool,
}

/// Records which filter chains compress responses.
#[derive(Debug, Default)]
struct Pass {
    compressed: HashSet<String>,
}

// === impl HttpListenerPolicyPlugin ===

impl HttpListenerPolicyPlugin {
    pub fn new(sources: &Sources) -> Self {
        let policies = sources.http_listener_policies.map(
            "http-listener-policies",
            |_, obj: &Obj<HttpListenerPolicy>| {
                let spec = &obj.resource.spec;
                let ir = HttpListenerPolicyIr {
                    compress: spec.compress,
                };
                Some(wrap(obj, &spec.target_refs, OpaqueIr::new(ir), vec![]))
            },
        );
        Self { policies }
    }
}

impl PolicyPlugin for HttpListenerPolicyPlugin {
    fn group_kind(&self) -> GroupKind {
        GroupKind::new(policy::GROUP, "HttpListenerPolicy")
    }

    fn name(&self) -> &'static str {
        "http-listener-policy"
    }

    fn policies(&self) -> Option<Collection<PolicyWrapper>> {
        Some(self.policies.clone())
    }

    fn new_gateway_translation_pass(&self) -> Option<Box<dyn TranslationPass>> {
        Some(Box::<Pass>::default())
    }
}

// === impl Pass ===

impl TranslationPass for Pass {
    fn apply_http_filter_chain(
        &mut self,
        policy: &PolicyAtt,
        fc: &FilterChainCommon,
        _hcm: &mut HttpConnectionManager,
    ) -> Result<(), PolicyError> {
        if let Some(ir) = policy.ir.downcast_ref::<HttpListenerPolicyIr>() {
            if ir.compress {
                self.compressed.insert(fc.name.clone());
            }
        }
        Ok(())
    }

    fn http_filters(&mut self, fc: &FilterChainCommon) -> Vec<StagedHttpFilter> {
        if !self.compressed.contains(&fc.name) {
            return vec![];
        }
        let compressor = Compressor {
            compressor_library: Some(TypedExtensionConfig {
                name: GZIP_LIBRARY.to_string(),
                typed_config: Some(envoy::to_any(type_urls::GZIP, &Gzip::default())),
            }),
            ..Default::default()
        };
        vec![StagedHttpFilter::new(
            FilterStage::before(WellKnownStage::Route),
            COMPRESSOR_FILTER,
            envoy::to_any(type_urls::COMPRESSOR, &compressor),
        )]
    }
}
