use crate::sources::Obj;
use gateway_controller_core::{
    ir::{GroupKind, ObjectSource},
    HandlerContext, Index,
};
use gateway_controller_k8s_api::gateway::{self as api, ReferenceGrant};

/// Indexes ReferenceGrants by every (from, to) pair they permit.
#[derive(Clone, Debug)]
pub struct RefGrantIndex {
    index: Index<RefGrantKey, Obj<ReferenceGrant>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct RefGrantKey {
    grant_namespace: String,
    to: GroupKind,
    /// Empty when the grant permits any name.
    to_name: String,
    from: GroupKind,
    from_namespace: String,
}

impl RefGrantIndex {
    pub fn new(grants: &gateway_controller_core::Collection<Obj<ReferenceGrant>>) -> Self {
        let index = grants.index("reference-grants-by-pair", grant_keys);
        Self { index }
    }

    /// Whether a resource of kind `from` in `from_namespace` may refer to
    /// `to`. References within a namespace are always allowed.
    pub fn reference_allowed(
        &self,
        ctx: &mut HandlerContext,
        from: &GroupKind,
        from_namespace: &str,
        to: &ObjectSource,
    ) -> bool {
        if to.namespace == from_namespace {
            return true;
        }

        let mut key = RefGrantKey {
            grant_namespace: to.namespace.clone(),
            to: to.group_kind(),
            to_name: String::new(),
            from: from.clone(),
            from_namespace: from_namespace.to_string(),
        };
        if !ctx.fetch_index(&self.index, &key).is_empty() {
            return true;
        }
        key.to_name = to.name.clone();
        !ctx.fetch_index(&self.index, &key).is_empty()
    }
}

fn grant_keys(grant: &Obj<ReferenceGrant>) -> Vec<RefGrantKey> {
    let spec = match api::view::<_, api::ReferenceGrantSpec>(&grant.resource.spec) {
        Ok(spec) => spec,
        Err(error) => {
            tracing::warn!(%error, grant = %grant.source, "Invalid ReferenceGrant");
            return vec![];
        }
    };

    let mut keys = Vec::with_capacity(spec.from.len() * spec.to.len());
    for from in &spec.from {
        for to in &spec.to {
            keys.push(RefGrantKey {
                grant_namespace: grant.source.namespace.clone(),
                to: GroupKind::from_ref(Some(&to.group), Some(&to.kind), ""),
                to_name: to.name.clone().unwrap_or_default(),
                from: GroupKind::from_ref(Some(&from.group), Some(&from.kind), ""),
                from_namespace: from.namespace.clone(),
            });
        }
    }
    keys
}
