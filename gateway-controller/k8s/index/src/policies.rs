use gateway_controller_core::{
    ir::{AttachedPolicies, AttachmentKind, GroupKind, ObjectSource, PolicyWrapper},
    Collection, HandlerContext, Index,
};
use std::sync::Arc;

/// Looks up policies by the resources they target, and by their own identity
/// for direct (extensionRef) attachment.
#[derive(Clone, Debug)]
pub struct PolicyIndex {
    policies: Collection<PolicyWrapper>,
    by_target: Index<TargetKey, PolicyWrapper>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct TargetKey {
    gk: GroupKind,
    namespace: String,
    name: String,
}

impl PolicyIndex {
    pub fn new(policies: Collection<PolicyWrapper>) -> Self {
        let by_target = policies.index("policies-by-target", |p: &PolicyWrapper| {
            p.target_refs
                .iter()
                .map(|t| TargetKey {
                    gk: GroupKind::from_ref(Some(&t.group), Some(&t.kind), ""),
                    namespace: p.source.namespace.clone(),
                    name: t.name.clone(),
                })
                .collect()
        });
        Self {
            policies,
            by_target,
        }
    }

    pub fn collection(&self) -> &Collection<PolicyWrapper> {
        &self.policies
    }

    /// Returns the policies targeting a resource, oldest first.
    ///
    /// Policies whose reference has no section name always match. Policies
    /// naming a section match only when `section` names the same one.
    pub fn policies_for(
        &self,
        ctx: &mut HandlerContext,
        gk: &GroupKind,
        namespace: &str,
        name: &str,
        section: Option<&str>,
    ) -> Vec<Arc<PolicyWrapper>> {
        self.targeting(ctx, gk, namespace, name, |s| {
            s.is_none() || s == section
        })
    }

    /// Returns only the policies whose reference names `section` of a
    /// resource.
    pub fn section_policies(
        &self,
        ctx: &mut HandlerContext,
        gk: &GroupKind,
        namespace: &str,
        name: &str,
        section: &str,
    ) -> Vec<Arc<PolicyWrapper>> {
        self.targeting(ctx, gk, namespace, name, |s| s == Some(section))
    }

    /// Returns policies referencing a section of the resource that is not in
    /// `known`, with the missing section name.
    pub fn unknown_sections(
        &self,
        ctx: &mut HandlerContext,
        gk: &GroupKind,
        namespace: &str,
        name: &str,
        known: &[&str],
    ) -> Vec<(Arc<PolicyWrapper>, String)> {
        let key = TargetKey {
            gk: gk.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        let mut unknown = vec![];
        for p in ctx.fetch_index(&self.by_target, &key) {
            for t in p.target_refs.iter() {
                let section = match t.section_name.as_deref() {
                    Some(s) if t.name == name && !known.contains(&s) => s,
                    _ => continue,
                };
                if GroupKind::from_ref(Some(&t.group), Some(&t.kind), "") == *gk {
                    unknown.push((p.clone(), section.to_string()));
                }
            }
        }
        unknown
    }

    /// Returns a policy referenced directly by identity, e.g. from an
    /// extensionRef filter.
    pub fn direct(
        &self,
        ctx: &mut HandlerContext,
        gk: &GroupKind,
        namespace: &str,
        name: &str,
    ) -> Option<Arc<PolicyWrapper>> {
        let key = ObjectSource::new(gk, namespace, name).resource_name();
        ctx.fetch(&self.policies, &key)
    }

    fn targeting(
        &self,
        ctx: &mut HandlerContext,
        gk: &GroupKind,
        namespace: &str,
        name: &str,
        section_matches: impl Fn(Option<&str>) -> bool,
    ) -> Vec<Arc<PolicyWrapper>> {
        let key = TargetKey {
            gk: gk.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        let mut policies = ctx
            .fetch_index(&self.by_target, &key)
            .into_iter()
            .filter(|p| {
                p.target_refs.iter().any(|t| {
                    t.name == name
                        && GroupKind::from_ref(Some(&t.group), Some(&t.kind), "") == *gk
                        && section_matches(t.section_name.as_deref())
                })
            })
            .collect::<Vec<_>>();
        policies.sort_by(|a, b| {
            a.creation_timestamp
                .cmp(&b.creation_timestamp)
                .then_with(|| a.source.cmp(&b.source))
        });
        policies
    }
}

/// Collects policies as attachments of the given kind, preserving order.
pub fn attach<'p>(
    policies: impl IntoIterator<Item = &'p Arc<PolicyWrapper>>,
    kind: AttachmentKind,
) -> AttachedPolicies {
    let mut attached = AttachedPolicies::default();
    for p in policies {
        attached.push(p.attachment(kind));
    }
    attached
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_controller_core::ir::{OpaqueIr, PolicyTargetRef};

    fn policy(name: &str, target: &str, section: Option<&str>) -> PolicyWrapper {
        PolicyWrapper {
            source: ObjectSource::new(&GroupKind::new("policy.gateway.dev", "RoutePolicy"), "ns", name),
            target_refs: vec![PolicyTargetRef {
                group: "gateway.networking.k8s.io".to_string(),
                kind: "HTTPRoute".to_string(),
                name: target.to_string(),
                section_name: section.map(Into::into),
            }],
            ir: OpaqueIr::new(()),
            errors: vec![],
            creation_timestamp: None,
            generation: None,
        }
    }

    fn names(policies: Vec<Arc<PolicyWrapper>>) -> Vec<String> {
        policies.iter().map(|p| p.source.name.clone()).collect()
    }

    #[test]
    fn sections_filter_policies() {
        let policies = Collection::new("policies");
        policies.upsert(policy("whole", "r", None));
        policies.upsert(policy("rule-a", "r", Some("a")));
        policies.upsert(policy("rule-b", "r", Some("b")));
        policies.upsert(policy("other", "s", None));
        let index = PolicyIndex::new(policies);
        let ctx = &mut HandlerContext::new();
        let gk = GroupKind::http_route();

        assert_eq!(names(index.policies_for(ctx, &gk, "ns", "r", None)), ["whole"]);
        assert_eq!(
            names(index.policies_for(ctx, &gk, "ns", "r", Some("a"))),
            ["rule-a", "whole"]
        );
        assert_eq!(names(index.section_policies(ctx, &gk, "ns", "r", "b")), ["rule-b"]);
        assert!(index.policies_for(ctx, &gk, "other-ns", "r", None).is_empty());

        let unknown = index.unknown_sections(ctx, &gk, "ns", "r", &["a"]);
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].1, "b");
    }

    #[test]
    fn direct_lookup_is_by_identity() {
        let policies = Collection::new("policies");
        policies.upsert(policy("p", "r", None));
        let index = PolicyIndex::new(policies);
        let ctx = &mut HandlerContext::new();
        let gk = GroupKind::new("policy.gateway.dev", "RoutePolicy");
        assert!(index.direct(ctx, &gk, "ns", "p").is_some());
        assert!(index.direct(ctx, &gk, "other", "p").is_none());
    }
}
