//! Builds status subresources from translation reports.
//!
//! Reports only carry failures; every condition type a resource is expected
//! to have is filled with its positive default here. A condition keeps its
//! previous `lastTransitionTime` for as long as its status does not change.

use gateway_controller_core::{
    ir::{GroupKind, ObjectSource},
    reports::{self, conditions, reasons, GatewayReport, PolicyReport, RouteReport},
};
use gateway_controller_k8s_api::{self as k8s, gateway, policy};
use gateway_controller_k8s_index::routes::parent_ref;

type Defaults = &'static [(&'static str, bool, &'static str)];

const GATEWAY_DEFAULTS: Defaults = &[
    (conditions::ACCEPTED, true, reasons::ACCEPTED),
    (conditions::PROGRAMMED, true, reasons::PROGRAMMED),
];

const LISTENER_DEFAULTS: Defaults = &[
    (conditions::ACCEPTED, true, reasons::ACCEPTED),
    (conditions::CONFLICTED, false, reasons::NO_CONFLICTS),
    (conditions::RESOLVED_REFS, true, reasons::RESOLVED_REFS),
    (conditions::PROGRAMMED, true, reasons::PROGRAMMED),
];

const ROUTE_DEFAULTS: Defaults = &[
    (conditions::ACCEPTED, true, reasons::ACCEPTED),
    (conditions::RESOLVED_REFS, true, reasons::RESOLVED_REFS),
];

const POLICY_DEFAULTS: Defaults = &[(conditions::ACCEPTED, true, reasons::ACCEPTED)];

/// Computes a Gateway's status. Listeners are listed in spec order; the
/// addresses field is left to whoever provisions the gateway.
pub fn gateway_status(
    report: &GatewayReport,
    spec: &gateway::GatewaySpec,
    current: &gateway::GatewayStatus,
    generation: Option<i64>,
    now: &k8s::Time,
) -> gateway::GatewayStatus {
    let generation = report.observed_generation.or(generation);
    let listeners = spec
        .listeners
        .iter()
        .map(|listener| {
            let reported = report.listeners.get(&listener.name);
            let old = current.listeners.iter().find(|l| l.name == listener.name);
            gateway::ListenerStatus {
                name: listener.name.clone(),
                supported_kinds: reported
                    .map(|r| r.supported_kinds.iter().map(route_group_kind).collect())
                    .unwrap_or_default(),
                attached_routes: reported.map_or(0, |r| r.attached_routes),
                conditions: make_conditions(
                    reported.map(|r| r.conditions.as_slice()).unwrap_or_default(),
                    LISTENER_DEFAULTS,
                    old.map(|l| l.conditions.as_slice()).unwrap_or_default(),
                    generation,
                    now,
                ),
            }
        })
        .collect();

    gateway::GatewayStatus {
        conditions: make_conditions(
            &report.conditions,
            GATEWAY_DEFAULTS,
            &current.conditions,
            generation,
            now,
        ),
        listeners,
    }
}

/// Computes a route's status. Parent statuses written by other controllers
/// are kept as they are; ours are rebuilt for every parent reference the
/// report covers.
pub fn route_status(
    report: &RouteReport,
    namespace: &str,
    parent_refs: &[gateway::ParentReference],
    controller_name: &str,
    current: &gateway::RouteStatus,
    generation: Option<i64>,
    now: &k8s::Time,
) -> gateway::RouteStatus {
    let generation = report.observed_generation.or(generation);
    let mut parents = current
        .parents
        .iter()
        .filter(|p| p.controller_name != controller_name)
        .cloned()
        .collect::<Vec<_>>();

    for reference in parent_refs {
        let Some(reported) = report.parents.get(&parent_ref(reference, namespace)) else {
            continue;
        };
        let ours = |p: &gateway::RouteParentStatus| {
            p.controller_name == controller_name && p.parent_ref == *reference
        };
        if parents.iter().any(ours) {
            continue;
        }
        let old = current.parents.iter().find(|p| ours(p));
        parents.push(gateway::RouteParentStatus {
            parent_ref: reference.clone(),
            controller_name: controller_name.to_string(),
            conditions: make_conditions(
                &reported.conditions,
                ROUTE_DEFAULTS,
                old.map(|p| p.conditions.as_slice()).unwrap_or_default(),
                generation,
                now,
            ),
        });
    }

    gateway::RouteStatus { parents }
}

/// Computes a policy's status with one entry per gateway it was evaluated
/// against.
pub fn policy_status(
    report: &PolicyReport,
    controller_name: &str,
    current: &policy::PolicyStatus,
    generation: Option<i64>,
    now: &k8s::Time,
) -> policy::PolicyStatus {
    let generation = report.observed_generation.or(generation);
    let mut ancestors = current
        .ancestors
        .iter()
        .filter(|a| a.controller_name != controller_name)
        .cloned()
        .collect::<Vec<_>>();

    for (ancestor, reported) in &report.ancestors {
        let ancestor_ref = ancestor_ref(ancestor);
        let old = current
            .ancestors
            .iter()
            .find(|a| a.controller_name == controller_name && a.ancestor_ref == ancestor_ref);
        ancestors.push(policy::PolicyAncestorStatus {
            conditions: make_conditions(
                reported,
                POLICY_DEFAULTS,
                old.map(|a| a.conditions.as_slice()).unwrap_or_default(),
                generation,
                now,
            ),
            ancestor_ref,
            controller_name: controller_name.to_string(),
        });
    }

    policy::PolicyStatus { ancestors }
}

fn make_conditions(
    reported: &[reports::Condition],
    defaults: Defaults,
    current: &[k8s::Condition],
    generation: Option<i64>,
    now: &k8s::Time,
) -> Vec<k8s::Condition> {
    let defaulted = defaults.iter().map(|(type_, status, reason)| {
        reports::find_condition(reported, type_)
            .cloned()
            .unwrap_or_else(|| reports::Condition::new(*type_, *status, *reason, ""))
    });
    let extra = reported
        .iter()
        .filter(|c| !defaults.iter().any(|(type_, _, _)| c.type_ == *type_))
        .cloned();

    defaulted
        .chain(extra)
        .map(|c| {
            let status = if c.status { "True" } else { "False" };
            let last_transition_time = current
                .iter()
                .find(|old| old.type_ == c.type_ && old.status == status)
                .map(|old| old.last_transition_time.clone())
                .unwrap_or_else(|| now.clone());
            k8s::Condition {
                type_: c.type_,
                status: status.to_string(),
                reason: c.reason,
                message: c.message,
                observed_generation: generation,
                last_transition_time,
            }
        })
        .collect()
}

fn route_group_kind(gk: &GroupKind) -> gateway::RouteGroupKind {
    gateway::RouteGroupKind {
        group: Some(gk.group.clone()),
        kind: gk.kind.clone(),
    }
}

fn ancestor_ref(source: &ObjectSource) -> policy::AncestorRef {
    policy::AncestorRef {
        group: Some(source.group.clone()),
        kind: Some(source.kind.clone()),
        namespace: Some(source.namespace.clone()),
        name: source.name.clone(),
    }
}

pub fn eq_time_insensitive_conditions(a: &[k8s::Condition], b: &[k8s::Condition]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(a, b)| {
            a.type_ == b.type_
                && a.status == b.status
                && a.reason == b.reason
                && a.message == b.message
                && a.observed_generation == b.observed_generation
        })
}

pub fn eq_time_insensitive_gateway_status(
    a: &gateway::GatewayStatus,
    b: &gateway::GatewayStatus,
) -> bool {
    eq_time_insensitive_conditions(&a.conditions, &b.conditions)
        && a.listeners.len() == b.listeners.len()
        && a.listeners.iter().zip(&b.listeners).all(|(a, b)| {
            a.name == b.name
                && a.supported_kinds == b.supported_kinds
                && a.attached_routes == b.attached_routes
                && eq_time_insensitive_conditions(&a.conditions, &b.conditions)
        })
}

pub fn eq_time_insensitive_route_status(a: &gateway::RouteStatus, b: &gateway::RouteStatus) -> bool {
    a.parents.len() == b.parents.len()
        && a.parents.iter().zip(&b.parents).all(|(a, b)| {
            a.parent_ref == b.parent_ref
                && a.controller_name == b.controller_name
                && eq_time_insensitive_conditions(&a.conditions, &b.conditions)
        })
}

pub fn eq_time_insensitive_policy_status(
    a: &policy::PolicyStatus,
    b: &policy::PolicyStatus,
) -> bool {
    a.ancestors.len() == b.ancestors.len()
        && a.ancestors.iter().zip(&b.ancestors).all(|(a, b)| {
            a.ancestor_ref == b.ancestor_ref
                && a.controller_name == b.controller_name
                && eq_time_insensitive_conditions(&a.conditions, &b.conditions)
        })
}
