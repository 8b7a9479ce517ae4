use super::wrap;
use crate::{
    extensions::{PolicyPlugin, RouteContext, TranslationPass},
    routes::direct_response,
};
use envoy_types::pb::envoy::config::route::v3::Route;
use gateway_controller_core::{
    errors::PolicyError,
    http_route::HttpFilter,
    ir::{GroupKind, OpaqueIr, PolicyAtt, PolicyWrapper},
    Collection,
};
use gateway_controller_k8s_api::policy::{self, DirectResponse};
use gateway_controller_k8s_index::{Obj, Sources};

/// Fixed responses, referenced from HTTPRoute rules by extensionRef. They
/// have no target references.
#[derive(Clone, Debug)]
pub struct DirectResponsePlugin {
    policies: Collection<PolicyWrapper>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectResponseIr {
    pub status: u32,
    pub body: Option<String>,
}

#[derive(Debug, Default)]
struct Pass;

// === impl DirectResponsePlugin ===

impl DirectResponsePlugin {
    pub fn new(sources: &Sources) -> Self {
        let policies = sources
            .direct_responses
            .map("direct-responses", |_, obj: &Obj<DirectResponse>| {
                let spec = &obj.resource.spec;
                let mut errors = vec![];
                if !(200..=599).contains(&spec.status_code) {
                    errors.push(format!("invalid status code {}", spec.status_code));
                }
                let ir = DirectResponseIr {
                    status: spec.status_code,
                    body: spec.body.clone(),
                };
                Some(wrap(obj, &[], OpaqueIr::new(ir), errors))
            });
        Self { policies }
    }
}

impl PolicyPlugin for DirectResponsePlugin {
    fn group_kind(&self) -> GroupKind {
        GroupKind::new(policy::GROUP, "DirectResponse")
    }

    fn name(&self) -> &'static str {
        "direct-response"
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
        ctx: &RouteContext<'_>,
        out: &mut Route,
    ) -> Result<(), PolicyError> {
        let Some(ir) = policy.ir.downcast_ref::<DirectResponseIr>() else {
            return Ok(());
        };

        let redirects = ctx
            .rule
            .filters
            .iter()
            .any(|f| matches!(f, HttpFilter::RequestRedirect(_)));
        let conflict = if !ctx.rule.backends.is_empty() {
            Some("the rule has backends")
        } else if redirects {
            Some("the rule redirects")
        } else if ctx.rule.extension_refs.get(&policy.group_kind).len() > 1 {
            Some("the rule has more than one direct response")
        } else {
            None
        };
        if let Some(conflict) = conflict {
            out.action = Some(direct_response(500, None));
            return Err(PolicyError::NotAttachable(format!(
                "{conflict}: {}",
                ctx.rule.route_name()
            )));
        }

        out.action = Some(direct_response(ir.status, ir.body.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::config::route::v3::route::Action;
    use gateway_controller_core::{
        http_route::{HttpRouteMatch, RequestRedirectFilter},
        ir::{AttachmentKind, BackendRef, HttpBackend, HttpRouteRuleMatchIr, ObjectSource},
    };

    fn att(status: u32) -> PolicyAtt {
        PolicyAtt {
            group_kind: GroupKind::new(policy::GROUP, "DirectResponse"),
            source: None,
            ir: OpaqueIr::new(DirectResponseIr {
                status,
                body: Some("gone".to_string()),
            }),
            kind: AttachmentKind::Direct,
            errors: vec![],
        }
    }

    fn rule() -> HttpRouteRuleMatchIr {
        HttpRouteRuleMatchIr {
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
        }
    }

    fn status(route: &Route) -> u32 {
        match route.action.as_ref() {
            Some(Action::DirectResponse(dr)) => dr.status,
            action => panic!("unexpected action {action:?}"),
        }
    }

    fn apply(rule: &HttpRouteRuleMatchIr, status: u32) -> (Route, Result<(), PolicyError>) {
        let gateway = ObjectSource::new(&GroupKind::gateway(), "ns", "gw");
        let ctx = RouteContext {
            gateway: &gateway,
            rule,
        };
        let mut route = Route {
            name: rule.route_name(),
            ..Default::default()
        };
        let res = Pass.apply_for_route(&att(status), &ctx, &mut route);
        (route, res)
    }

    #[test]
    fn responds_directly() {
        let (route, res) = apply(&rule(), 410);
        assert!(res.is_ok());
        assert_eq!(status(&route), 410);
    }

    #[test]
    fn conflicts_with_backends() {
        let mut rule = rule();
        rule.backends.push(HttpBackend {
            backend: BackendRef {
                cluster_name: "Service/ns/svc:80".to_string(),
                weight: 1,
                upstream: None,
                error: None,
            },
            attached_policies: Default::default(),
        });
        let (route, res) = apply(&rule, 410);
        assert!(matches!(res, Err(PolicyError::NotAttachable(_))));
        assert_eq!(status(&route), 500);
    }

    #[test]
    fn conflicts_with_redirects() {
        let mut rule = rule();
        rule.filters.push(HttpFilter::RequestRedirect(RequestRedirectFilter {
            scheme: None,
            host: Some("example.com".to_string()),
            path: None,
            port: None,
            status: None,
        }));
        let (route, res) = apply(&rule, 410);
        assert!(res.is_err());
        assert_eq!(status(&route), 500);
    }

    #[test]
    fn multiple_responses_conflict() {
        let mut rule = rule();
        rule.extension_refs.push(att(410));
        rule.extension_refs.push(att(404));
        let (route, res) = apply(&rule, 410);
        assert!(res.is_err());
        assert_eq!(status(&route), 500);
    }
}
