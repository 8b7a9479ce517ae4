use crate::status::{
    eq_time_insensitive_gateway_status, eq_time_insensitive_policy_status,
    eq_time_insensitive_route_status, gateway_status, policy_status, route_status,
};
use anyhow::Result;
use gateway_controller_core::{
    collection::Collection,
    ir::ObjectSource,
    reports::{PolicyReport, ReportMap, RouteReport},
};
use gateway_controller_k8s_api::{self as k8s, gateway, policy, Resource};
use gateway_controller_translator::GatewayXds;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, Patch, PatchParams},
    core::object::HasStatus,
};
use kubert::lease::Claim;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    sync::watch,
    time::{self, Duration},
};
use tracing::{debug, error, info, warn};

const FIELD_MANAGER: &str = "gateway-controller";
const SYNC_PERIOD: Duration = Duration::from_secs(1);
const PATCH_ATTEMPTS: u32 = 5;
const PATCH_BACKOFF: Duration = Duration::from_millis(100);

/// Writes the statuses described by the latest translation reports.
pub struct Controller {
    client: kube::Client,
    claims: watch::Receiver<Arc<Claim>>,
    hostname: String,
    controller_name: String,
    gateways: Collection<GatewayXds>,
    pending: Arc<AtomicBool>,
    patch_timeout: Duration,
    metrics: ControllerMetrics,
}

#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    patch_succeeded: Counter,
    patch_failed: Counter,
    patch_timeout: Counter,
    patch_unchanged: Counter,
}

enum Outcome {
    Patched,
    Unchanged,
    Gone,
}

enum PatchError {
    Timeout,
    Failed(anyhow::Error),
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "patch_succeeded",
            "Counter of successful status patches",
            metrics.patch_succeeded.clone(),
        );
        prom.register(
            "patch_failed",
            "Counter of failed status patch attempts",
            metrics.patch_failed.clone(),
        );
        prom.register(
            "patch_timeout",
            "Counter of status patch attempts that timed out",
            metrics.patch_timeout.clone(),
        );
        prom.register(
            "patch_unchanged",
            "Counter of status syncs skipped because the status was current",
            metrics.patch_unchanged.clone(),
        );
        metrics
    }
}

// === impl Controller ===

impl Controller {
    pub fn new(
        claims: watch::Receiver<Arc<Claim>>,
        client: kube::Client,
        hostname: impl ToString,
        controller_name: impl ToString,
        gateways: Collection<GatewayXds>,
        patch_timeout: Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        let pending = Arc::new(AtomicBool::new(true));
        gateways.subscribe({
            let pending = pending.clone();
            move |_| pending.store(true, Ordering::Release)
        });
        Self {
            client,
            claims,
            hostname: hostname.to_string(),
            controller_name: controller_name.to_string(),
            gateways,
            pending,
            patch_timeout,
            metrics,
        }
    }

    /// Syncs statuses once per period while this replica holds the lease,
    /// until `drain` is signaled.
    pub async fn run(self, drain: drain::Watch) {
        let mut interval = time::interval(SYNC_PERIOD);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut leading = false;

        tokio::pin! {
            let shutdown = drain.signaled();
        }
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = &mut shutdown => {
                    debug!("Status controller shutting down");
                    return;
                }
            }

            let is_leader = self.claims.borrow().is_current_for(&self.hostname);
            if is_leader && !leading {
                info!(hostname = %self.hostname, "Acquired status write lease");
                // Another replica may have written in the meantime.
                self.pending.store(true, Ordering::Release);
            }
            leading = is_leader;
            if !leading || !self.pending.swap(false, Ordering::AcqRel) {
                continue;
            }

            let reports = merge_reports(&self.gateways.list());
            self.sync(&reports).await;
        }
    }

    async fn sync(&self, reports: &ReportMap) {
        debug!(
            gateways = reports.gateways.len(),
            routes = reports.routes.len(),
            policies = reports.policies.len(),
            "Syncing statuses"
        );

        for (source, report) in &reports.gateways {
            self.patch::<gateway::Gateway, _>(source, |gw| {
                let spec = gateway::view(&gw.spec)?;
                let current = current_status(gw.status.as_ref())?;
                let status = gateway_status(report, &spec, &current, gw.metadata.generation, &now());
                Self::changed(eq_time_insensitive_gateway_status(&current, &status), &status)
            })
            .await;
        }

        for (source, report) in &reports.routes {
            match source.kind.as_str() {
                "HTTPRoute" => {
                    self.patch::<gateway::HttpRoute, _>(source, |route| {
                        let spec = gateway::view::<_, gateway::HttpRouteSpec>(&route.spec)?;
                        let parents = spec.parent_refs.unwrap_or_default();
                        self.route(source, report, &parents, route.status.as_ref(), route)
                    })
                    .await
                }
                "TCPRoute" => {
                    self.patch::<gateway::TcpRoute, _>(source, |route| {
                        let spec = gateway::view::<_, gateway::TcpRouteSpec>(&route.spec)?;
                        let parents = spec.parent_refs.unwrap_or_default();
                        self.route(source, report, &parents, route.status.as_ref(), route)
                    })
                    .await
                }
                kind => debug!(%kind, name = %source.name, "Skipping status for unknown route kind"),
            }
        }

        for (source, report) in &reports.policies {
            match source.kind.as_str() {
                "RoutePolicy" => self.patch_policy::<policy::RoutePolicy>(source, report).await,
                "HttpListenerPolicy" => {
                    self.patch_policy::<policy::HttpListenerPolicy>(source, report)
                        .await
                }
                "DirectResponse" => {
                    self.patch_policy::<policy::DirectResponse>(source, report)
                        .await
                }
                kind => debug!(%kind, name = %source.name, "Skipping status for unknown policy kind"),
            }
        }
    }

    fn route<S: Serialize, K: Resource>(
        &self,
        source: &ObjectSource,
        report: &RouteReport,
        parents: &[gateway::ParentReference],
        status: Option<&S>,
        route: &K,
    ) -> Result<Option<serde_json::Value>> {
        let current = current_status(status)?;
        let status = route_status(
            report,
            &source.namespace,
            parents,
            &self.controller_name,
            &current,
            route.meta().generation,
            &now(),
        );
        Self::changed(eq_time_insensitive_route_status(&current, &status), &status)
    }

    async fn patch_policy<K>(&self, source: &ObjectSource, report: &PolicyReport)
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + HasStatus<Status = policy::PolicyStatus>
            + Clone
            + DeserializeOwned
            + fmt::Debug,
    {
        self.patch::<K, _>(source, |obj| {
            let current = obj.status().cloned().unwrap_or_default();
            let status = policy_status(
                report,
                &self.controller_name,
                &current,
                obj.meta().generation,
                &now(),
            );
            Self::changed(eq_time_insensitive_policy_status(&current, &status), &status)
        })
        .await
    }

    fn changed<S: Serialize>(unchanged: bool, status: &S) -> Result<Option<serde_json::Value>> {
        if unchanged {
            return Ok(None);
        }
        Ok(Some(serde_json::to_value(status)?))
    }

    /// Patches the object's status with up to [`PATCH_ATTEMPTS`] attempts,
    /// backing off exponentially between them.
    async fn patch<K, F>(&self, source: &ObjectSource, desired: F)
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + fmt::Debug,
        F: Fn(&K) -> Result<Option<serde_json::Value>>,
    {
        let api = Api::<K>::namespaced(self.client.clone(), &source.namespace);
        let mut delay = PATCH_BACKOFF;
        for attempt in 1..=PATCH_ATTEMPTS {
            match self.try_patch(&api, source, &desired).await {
                Ok(Outcome::Patched) => {
                    self.metrics.patch_succeeded.inc();
                    info!(kind = %source.kind, namespace = %source.namespace, name = %source.name, "Patched status");
                    return;
                }
                Ok(Outcome::Unchanged) => {
                    self.metrics.patch_unchanged.inc();
                    return;
                }
                Ok(Outcome::Gone) => {
                    debug!(kind = %source.kind, namespace = %source.namespace, name = %source.name, "Resource no longer exists");
                    return;
                }
                Err(PatchError::Timeout) => {
                    self.metrics.patch_timeout.inc();
                    warn!(kind = %source.kind, namespace = %source.namespace, name = %source.name, attempt, "Status patch timed out");
                }
                Err(PatchError::Failed(error)) => {
                    self.metrics.patch_failed.inc();
                    warn!(kind = %source.kind, namespace = %source.namespace, name = %source.name, attempt, %error, "Failed to patch status");
                }
            }
            if attempt < PATCH_ATTEMPTS {
                time::sleep(delay).await;
                delay *= 2;
            }
        }
        error!(kind = %source.kind, namespace = %source.namespace, name = %source.name, "Giving up on status patch");
    }

    async fn try_patch<K, F>(
        &self,
        api: &Api<K>,
        source: &ObjectSource,
        desired: &F,
    ) -> Result<Outcome, PatchError>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug,
        F: Fn(&K) -> Result<Option<serde_json::Value>>,
    {
        let obj = match time::timeout(self.patch_timeout, api.get_status(&source.name)).await {
            Err(_) => return Err(PatchError::Timeout),
            Ok(Err(kube::Error::Api(rsp))) if rsp.code == 404 => return Ok(Outcome::Gone),
            Ok(Err(error)) => return Err(PatchError::Failed(error.into())),
            Ok(Ok(obj)) => obj,
        };

        let status = match desired(&obj) {
            Ok(Some(status)) => status,
            Ok(None) => return Ok(Outcome::Unchanged),
            Err(error) => return Err(PatchError::Failed(error)),
        };

        let params = PatchParams::apply(FIELD_MANAGER);
        let patch = make_patch::<K>(&source.name, status);
        match time::timeout(
            self.patch_timeout,
            api.patch_status(&source.name, &params, &patch),
        )
        .await
        {
            Err(_) => Err(PatchError::Timeout),
            Ok(Err(kube::Error::Api(rsp))) if rsp.code == 404 => Ok(Outcome::Gone),
            Ok(Err(error)) => Err(PatchError::Failed(error.into())),
            Ok(Ok(_)) => Ok(Outcome::Patched),
        }
    }
}

/// Merges the reports of every translated gateway.
pub fn merge_reports(gateways: &[Arc<GatewayXds>]) -> ReportMap {
    gateways.iter().fold(ReportMap::default(), |mut acc, gw| {
        acc.merge(gw.reports.clone());
        acc
    })
}

pub(crate) fn make_patch<K: Resource<DynamicType = ()>>(
    name: &str,
    status: serde_json::Value,
) -> Patch<serde_json::Value> {
    Patch::Merge(serde_json::json!({
        "apiVersion": K::api_version(&()),
        "kind": K::kind(&()),
        "name": name,
        "status": status,
    }))
}

fn current_status<S, V>(status: Option<&S>) -> Result<V>
where
    S: Serialize,
    V: DeserializeOwned + Default,
{
    match status {
        Some(status) => Ok(gateway::view(status)?),
        None => Ok(V::default()),
    }
}

fn now() -> k8s::Time {
    k8s::Time(chrono::Utc::now())
}
