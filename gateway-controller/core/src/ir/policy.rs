use super::{GroupKind, ObjectSource, OpaqueIr};
use crate::collection::{Equals, Keyed};
use chrono::{offset::Utc, DateTime};
use std::collections::BTreeMap;

/// A reference from a policy to the resource it applies to. Target references
/// always resolve in the policy's own namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyTargetRef {
    pub group: String,
    pub kind: String,
    pub name: String,
    pub section_name: Option<String>,
}

/// A policy of any kind, with its kind-specific payload left opaque.
#[derive(Clone, Debug, PartialEq)]
pub struct PolicyWrapper {
    pub source: ObjectSource,
    pub target_refs: Vec<PolicyTargetRef>,
    pub ir: OpaqueIr,
    /// Errors found while converting the policy.
    pub errors: Vec<String>,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub generation: Option<i64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AttachmentKind {
    /// Selected through the policy index by the policy's target references.
    TargetRef,
    /// Listed inline on the referring resource, e.g. by a filter's extensionRef.
    Direct,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PolicyAtt {
    pub group_kind: GroupKind,
    /// The policy resource, when the attachment came from one.
    pub source: Option<ObjectSource>,
    pub ir: OpaqueIr,
    pub kind: AttachmentKind,
    pub errors: Vec<String>,
}

/// Policies attached to a resource, grouped by policy kind. Within a kind,
/// direct attachments precede target-ref attachments, and rule-level
/// attachments precede route-level attachments.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttachedPolicies {
    pub policies: BTreeMap<GroupKind, Vec<PolicyAtt>>,
}

// === impl PolicyTargetRef ===

impl PolicyTargetRef {
    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(self.group.clone(), self.kind.clone())
    }
}

// === impl PolicyWrapper ===

impl Keyed for PolicyWrapper {
    fn resource_name(&self) -> String {
        self.source.resource_name()
    }
}

impl Equals for PolicyWrapper {
    fn equals(&self, other: &Self) -> bool {
        self.source == other.source
            && self.target_refs == other.target_refs
            && self.ir == other.ir
            && self.errors == other.errors
    }
}

impl PolicyWrapper {
    pub fn attachment(&self, kind: AttachmentKind) -> PolicyAtt {
        PolicyAtt {
            group_kind: self.source.group_kind(),
            source: Some(self.source.clone()),
            ir: self.ir.clone(),
            kind,
            errors: self.errors.clone(),
        }
    }
}

// === impl AttachedPolicies ===

impl AttachedPolicies {
    pub fn is_empty(&self) -> bool {
        self.policies.values().all(Vec::is_empty)
    }

    pub fn push(&mut self, att: PolicyAtt) {
        self.policies
            .entry(att.group_kind.clone())
            .or_default()
            .push(att);
    }

    /// Appends every attachment of `other` after the existing attachments of
    /// the same kind.
    pub fn append(&mut self, other: &AttachedPolicies) {
        for (gk, atts) in &other.policies {
            self.policies
                .entry(gk.clone())
                .or_default()
                .extend(atts.iter().cloned());
        }
    }

    pub fn get(&self, gk: &GroupKind) -> &[PolicyAtt] {
        self.policies.get(gk).map(Vec::as_slice).unwrap_or_default()
    }

    /// Iterates attachments in group-kind order.
    pub fn iter(&self) -> impl Iterator<Item = (&GroupKind, &PolicyAtt)> + '_ {
        self.policies
            .iter()
            .flat_map(|(gk, atts)| atts.iter().map(move |att| (gk, att)))
    }
}
