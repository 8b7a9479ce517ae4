use super::wrap;
use crate::{
    envoy,
    extensions::{PolicyPlugin, RouteContext, TranslationPass},
};
use envoy_types::pb::envoy::config::route::v3::{route::Action, Route};
use gateway_controller_core::{
    errors::PolicyError,
    ir::{GroupKind, OpaqueIr, PolicyAtt, PolicyWrapper},
    Collection,
};
use gateway_controller_k8s_api::policy::{self, RoutePolicy};
use gateway_controller_k8s_index::{Obj, Sources};

#[derive(Clone, Debug)]
pub struct RoutePolicyPlugin {
    policies: Collection<PolicyWrapper>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutePolicyIr {
    /// Request timeout in seconds, if any.
    pub timeout: Option<u32>,
}

/// Applies timeouts to routes. The first attachment that sets a timeout wins,
/// so rule-level policies take precedence over route-level ones.
#[derive(Debug, Default)]
struct Pass;

// === impl RoutePolicyPlugin ===

impl RoutePolicyPlugin {
    pub fn new(sources: &Sources) -> Self {
        let policies = sources
            .route_policies
            .map("route-policies", |_, obj: &Obj<RoutePolicy>| {
                let spec = &obj.resource.spec;
                let ir = RoutePolicyIr {
                    timeout: (spec.timeout > 0).then_some(spec.timeout),
                };
                Some(wrap(obj, &spec.target_refs, OpaqueIr::new(ir), vec![]))
            });
        Self { policies }
    }
}

impl PolicyPlugin for RoutePolicyPlugin {
    fn group_kind(&self) -> GroupKind {
        GroupKind::new(policy::GROUP, "RoutePolicy")
    }

    fn name(&self) -> &'static str {
        "route-policy"
    }

    fn policies(&self) -> Option<Collection<PolicyWrapper>> {
        Some(self.policies.clone())
    }

    fn new_gateway_translation_pass(&self) -> Option<Box<dyn TranslationPass>> {
        Some(Box::new(Pass))
    }
}

// === impl Pass ===

impl TranslationPass for Pass {
    fn apply_for_route(
        &mut self,
        policy: &PolicyAtt,
        _ctx: &RouteContext<'_>,
        out: &mut Route,
    ) -> Result<(), PolicyError> {
        let Some(ir) = policy.ir.downcast_ref::<RoutePolicyIr>() else {
            return Ok(());
        };
        let Some(timeout) = ir.timeout else {
            return Ok(());
        };
        if let Some(Action::Route(action)) = out.action.as_mut() {
            if action.timeout.is_none() {
                action.timeout = Some(envoy::seconds(timeout));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::config::route::v3::RouteAction;
    use gateway_controller_core::{
        http_route::HttpRouteMatch,
        ir::{AttachmentKind, HttpRouteRuleMatchIr, ObjectSource},
    };

    fn att(timeout: u32) -> PolicyAtt {
        PolicyAtt {
            group_kind: GroupKind::new(policy::GROUP, "RoutePolicy"),
            source: None,
            ir: OpaqueIr::new(RoutePolicyIr {
                timeout: Some(timeout),
            }),
            kind: AttachmentKind::TargetRef,
            errors: vec![],
        }
    }

    #[test]
    fn first_timeout_wins() {
        let gateway = ObjectSource::new(&GroupKind::gateway(), "ns", "gw");
        let rule = HttpRouteRuleMatchIr {
            route: ObjectSource::new(&GroupKind::http_route(), "ns", "r"),
            delegated_by: None,
            rule_index: 0,
            match_index: 0,
            matcher: HttpRouteMatch::default(),
            filters: vec![],
            backends: vec![],
            extension_refs: Default::default(),
            attached_policies: Default::default(),
            errors: vec![],
            creation_timestamp: None,
        };
        let ctx = RouteContext {
            gateway: &gateway,
            rule: &rule,
        };
        let mut route = Route {
            action: Some(Action::Route(RouteAction::default())),
            ..Default::default()
        };

        let mut pass = Pass;
        pass.apply_for_route(&att(3), &ctx, &mut route).unwrap();
        pass.apply_for_route(&att(10), &ctx, &mut route).unwrap();

        let Some(Action::Route(action)) = route.action else {
            panic!("expected a route action");
        };
        assert_eq!(action.timeout, Some(envoy::seconds(3)));
    }
}
