use crate::k8s::{ObjectMeta, Resource};
use anyhow::{Context, Result};
use k8s_openapi::api::{apps::v1::Deployment, coordination::v1::Lease};
use kube::api::{Api, Patch, PatchParams};
use kubert::lease::{Claim, ClaimParams, LeaseManager};
use std::sync::Arc;
use tokio::{sync::watch, time::Duration};

const LEASE_NAME: &str = "gateway-controller-status-write";
const FIELD_MANAGER: &str = "gateway-controller";

const CLAIM: ClaimParams = ClaimParams {
    lease_duration: Duration::from_secs(30),
    renew_grace_period: Duration::from_secs(1),
};

/// Competes for the Lease that elects the single replica writing statuses.
///
/// The returned receiver always holds the latest claim; a replica may write
/// statuses while the claim is current for its hostname.
pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    deployment_name: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<Claim>>> {
    let api = Api::<Lease>::namespaced(runtime.client(), ns);
    ensure(&api, runtime.client(), ns, deployment_name).await?;

    let (claims, _task) = LeaseManager::init(api, LEASE_NAME)
        .await?
        .spawn(hostname, CLAIM)
        .await?;
    tracing::info!(lease = LEASE_NAME, %hostname, "Competing for status writes");
    Ok(claims)
}

/// Creates the Lease, owned by the controller's Deployment, unless it exists.
async fn ensure(
    api: &Api<Lease>,
    client: kube::Client,
    ns: &str,
    deployment_name: &str,
) -> Result<()> {
    let deployment = Api::<Deployment>::namespaced(client, ns)
        .get(deployment_name)
        .await
        .with_context(|| format!("failed to fetch Deployment {ns}/{deployment_name}"))?;
    let owner = deployment
        .controller_owner_ref(&())
        .context("Deployment has no name or uid")?;

    let lease = Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(ns.to_string()),
            // A resource version of "0" only creates the Lease.
            resource_version: Some("0".to_string()),
            owner_references: Some(vec![owner]),
            labels: Some(
                [(
                    "app.kubernetes.io/component".to_string(),
                    FIELD_MANAGER.to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let params = PatchParams::apply(FIELD_MANAGER);
    match api.patch(LEASE_NAME, &params, &Patch::Apply(lease)).await {
        Ok(_) => tracing::info!(lease = LEASE_NAME, %ns, "Created Lease"),
        Err(kube::Error::Api(_)) => tracing::debug!(lease = LEASE_NAME, "Lease exists"),
        Err(error) => return Err(error.into()),
    }
    Ok(())
}
