//! Status conditions accumulated while building and translating gateways.
//!
//! Reports only hold what went wrong, plus the few positive facts the status
//! writer cannot infer (listener route counts, supported kinds). Missing
//! conditions are filled with their positive defaults when status is written.

use crate::ir::{GroupKind, ObjectSource, ParentRef};
use std::collections::BTreeMap;

pub mod conditions {
    pub const ACCEPTED: &str = "Accepted";
    pub const PROGRAMMED: &str = "Programmed";
    pub const RESOLVED_REFS: &str = "ResolvedRefs";
    pub const CONFLICTED: &str = "Conflicted";
}

pub mod reasons {
    pub const ACCEPTED: &str = "Accepted";
    pub const PROGRAMMED: &str = "Programmed";
    pub const RESOLVED_REFS: &str = "ResolvedRefs";
    pub const NO_CONFLICTS: &str = "NoConflicts";
    pub const INVALID: &str = "Invalid";
    pub const UNSUPPORTED_PROTOCOL: &str = "UnsupportedProtocol";
    pub const PROTOCOL_CONFLICT: &str = "ProtocolConflict";
    pub const HOSTNAME_CONFLICT: &str = "HostnameConflict";
    pub const INVALID_CERTIFICATE_REF: &str = "InvalidCertificateRef";
    pub const REF_NOT_PERMITTED: &str = "RefNotPermitted";
    pub const INVALID_ROUTE_KINDS: &str = "InvalidRouteKinds";
    pub const INVALID_ADDRESS: &str = "InvalidAddress";
    pub const TARGET_NOT_FOUND: &str = "TargetNotFound";
    pub const UNSUPPORTED_VALUE: &str = "UnsupportedValue";
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Condition {
    pub type_: String,
    pub status: bool,
    pub reason: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReportMap {
    pub gateways: BTreeMap<ObjectSource, GatewayReport>,
    pub routes: BTreeMap<ObjectSource, RouteReport>,
    pub policies: BTreeMap<ObjectSource, PolicyReport>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GatewayReport {
    pub observed_generation: Option<i64>,
    pub conditions: Vec<Condition>,
    pub listeners: BTreeMap<String, ListenerReport>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListenerReport {
    pub conditions: Vec<Condition>,
    pub supported_kinds: Vec<GroupKind>,
    pub attached_routes: i32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RouteReport {
    pub observed_generation: Option<i64>,
    pub parents: BTreeMap<ParentRef, ParentRefReport>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParentRefReport {
    pub conditions: Vec<Condition>,
}

/// Conditions on a policy, per ancestor it was evaluated against.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PolicyReport {
    pub observed_generation: Option<i64>,
    pub ancestors: BTreeMap<ObjectSource, Vec<Condition>>,
}

// === impl Condition ===

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Replaces any condition of the same type.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(c) => *c = condition,
        None => conditions.push(condition),
    }
}

pub fn find_condition<'c>(conditions: &'c [Condition], type_: &str) -> Option<&'c Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

// === impl ReportMap ===

impl ReportMap {
    pub fn gateway(&mut self, source: &ObjectSource, generation: Option<i64>) -> &mut GatewayReport {
        let report = self.gateways.entry(source.clone()).or_default();
        report.observed_generation = generation;
        report
    }

    pub fn route(&mut self, source: &ObjectSource, generation: Option<i64>) -> &mut RouteReport {
        let report = self.routes.entry(source.clone()).or_default();
        report.observed_generation = generation;
        report
    }

    pub fn policy(&mut self, source: &ObjectSource, generation: Option<i64>) -> &mut PolicyReport {
        let report = self.policies.entry(source.clone()).or_default();
        report.observed_generation = generation;
        report
    }

    /// Merges another gateway's reports. Route parents and policy ancestors are
    /// distinct per gateway, so entries from `other` replace ours only when they
    /// describe the same parent.
    pub fn merge(&mut self, other: ReportMap) {
        self.gateways.extend(other.gateways);
        for (source, report) in other.routes {
            let ours = self.routes.entry(source).or_default();
            ours.observed_generation = report.observed_generation;
            for (parent, parent_report) in report.parents {
                let conds = &mut ours.parents.entry(parent).or_default().conditions;
                for c in parent_report.conditions {
                    set_condition(conds, c);
                }
            }
        }
        for (source, report) in other.policies {
            let ours = self.policies.entry(source).or_default();
            ours.observed_generation = report.observed_generation;
            ours.ancestors.extend(report.ancestors);
        }
    }
}

// === impl GatewayReport ===

impl GatewayReport {
    pub fn set_condition(&mut self, condition: Condition) {
        set_condition(&mut self.conditions, condition)
    }

    pub fn listener(&mut self, name: &str) -> &mut ListenerReport {
        self.listeners.entry(name.to_string()).or_default()
    }
}

// === impl ListenerReport ===

impl ListenerReport {
    pub fn set_condition(&mut self, condition: Condition) {
        set_condition(&mut self.conditions, condition)
    }
}

// === impl RouteReport ===

impl RouteReport {
    pub fn parent(&mut self, parent: &ParentRef) -> &mut ParentRefReport {
        self.parents.entry(parent.clone()).or_default()
    }
}

// === impl ParentRefReport ===

impl ParentRefReport {
    pub fn set_condition(&mut self, condition: Condition) {
        set_condition(&mut self.conditions, condition)
    }

    /// Records a failed condition unless one of the same type has already
    /// failed; the first failure is the one reported.
    pub fn fail(&mut self, type_: &str, reason: &str, message: impl Into<String>) {
        if find_condition(&self.conditions, type_).is_some_and(|c| !c.status) {
            return;
        }
        self.set_condition(Condition::new(type_, false, reason, message));
    }
}

// === impl PolicyReport ===

impl PolicyReport {
    pub fn ancestor(&mut self, ancestor: &ObjectSource) -> &mut Vec<Condition> {
        self.ancestors.entry(ancestor.clone()).or_default()
    }
}
