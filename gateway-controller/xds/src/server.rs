use crate::{
    cache::{Snapshot, SnapshotCache, SnapshotRx},
    clients::{client_from_node, ClientRegistry, Registration},
    metrics::{GrpcServerMetricsFamily, StreamObserver},
};
use envoy_types::pb::envoy::service::discovery::v3::{
    aggregated_discovery_service_server::{
        AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
    },
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use futures::prelude::*;
use gateway_controller_core::Keyed;
use gateway_controller_translator::envoy::type_urls;
use std::{collections::BTreeSet, pin::Pin};

/// Resource types in the order a client must receive them.
const TYPES: [&str; 4] = [
    type_urls::CLUSTER,
    type_urls::CLUSTER_LOAD_ASSIGNMENT,
    type_urls::LISTENER,
    type_urls::ROUTE_CONFIGURATION,
];

/// Serves state-of-the-world ADS from the snapshot cache.
#[derive(Clone, Debug)]
pub struct AdsServer {
    cache: SnapshotCache,
    registry: ClientRegistry,
    metrics: GrpcServerMetricsFamily,
    drain: drain::Watch,
}

type BoxAdsStream = Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, tonic::Status>> + Send>>;

type BoxDeltaStream =
    Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, tonic::Status>> + Send>>;

/// What one stream has requested and been sent.
#[derive(Debug)]
struct AdsStream {
    client: String,
    subscriptions: [Option<Subscription>; 4],
    nonce: u64,
}

#[derive(Debug, Default)]
struct Subscription {
    /// Requested resource names. Empty requests every resource.
    names: BTreeSet<String>,
    /// The version and nonce of the last response.
    sent: Option<(String, String)>,
    acked: Option<String>,
}

// === impl AdsServer ===

impl AdsServer {
    pub fn new(
        cache: SnapshotCache,
        registry: ClientRegistry,
        metrics: GrpcServerMetricsFamily,
        drain: drain::Watch,
    ) -> Self {
        Self {
            cache,
            registry,
            metrics,
            drain,
        }
    }

    pub fn svc(self) -> AggregatedDiscoveryServiceServer<Self> {
        AggregatedDiscoveryServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for AdsServer {
    type StreamAggregatedResourcesStream = BoxAdsStream;

    async fn stream_aggregated_resources(
        &self,
        req: tonic::Request<tonic::Streaming<DiscoveryRequest>>,
    ) -> Result<tonic::Response<BoxAdsStream>, tonic::Status> {
        let observer = self.metrics.stream();
        let mut requests = req.into_inner();

        let first = match requests.message().await {
            Ok(Some(first)) => first,
            Ok(None) => {
                let status = tonic::Status::cancelled("stream closed before the first request");
                observer.end(status.code());
                return Err(status);
            }
            Err(status) => {
                observer.end(status.code());
                return Err(status);
            }
        };
        observer.received(&first.type_url);

        let client = match first.node.as_ref().map(client_from_node) {
            Some(Ok(client)) => client,
            Some(Err(error)) => {
                let status = tonic::Status::invalid_argument(error.to_string());
                observer.end(status.code());
                return Err(status);
            }
            None => {
                let status =
                    tonic::Status::invalid_argument("the first request must identify the node");
                observer.end(status.code());
                return Err(status);
            }
        };
        let node = first.node.as_ref().map(|n| n.id.as_str()).unwrap_or_default();
        tracing::debug!(client = %client.resource_name(), %node, "Stream started");

        let registration = self.registry.register(client);
        let snapshots = self.cache.watch(registration.key());
        Ok(tonic::Response::new(response_stream(
            self.drain.clone(),
            registration,
            observer,
            first,
            requests,
            snapshots,
        )))
    }

    type DeltaAggregatedResourcesStream = BoxDeltaStream;

    async fn delta_aggregated_resources(
        &self,
        _req: tonic::Request<tonic::Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<tonic::Response<BoxDeltaStream>, tonic::Status> {
        Err(tonic::Status::unimplemented(
            "incremental xDS is not supported",
        ))
    }
}

fn response_stream(
    drain: drain::Watch,
    registration: Registration,
    observer: StreamObserver,
    first: DiscoveryRequest,
    mut requests: tonic::Streaming<DiscoveryRequest>,
    mut snapshots: SnapshotRx,
) -> BoxAdsStream {
    Box::pin(async_stream::try_stream! {
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        let mut stream = AdsStream::new(registration.key());
        let current = snapshots.borrow_and_update().clone();
        if let Some(rsp) = stream.on_request(first, current.as_deref()) {
            observer.sent(&rsp.type_url);
            yield rsp;
        }

        let mut code = tonic::Code::Ok;
        loop {
            tokio::select! {
                res = requests.message() => match res {
                    Ok(Some(req)) => {
                        observer.received(&req.type_url);
                        if req.error_detail.is_some() {
                            observer.rejected(&req.type_url);
                        }
                        let current = snapshots.borrow().clone();
                        if let Some(rsp) = stream.on_request(req, current.as_deref()) {
                            observer.sent(&rsp.type_url);
                            yield rsp;
                        }
                    }
                    Ok(None) => break,
                    Err(status) => {
                        tracing::debug!(client = %stream.client, %status, "Stream failed");
                        code = status.code();
                        break;
                    }
                },

                res = snapshots.changed() => {
                    if res.is_err() {
                        break;
                    }
                    let current = snapshots.borrow_and_update().clone();
                    if let Some(snapshot) = current {
                        for rsp in stream.on_snapshot(&snapshot) {
                            observer.sent(&rsp.type_url);
                            yield rsp;
                        }
                    }
                }

                // If the server starts shutting down, close the stream so that it doesn't hold the
                // server open.
                _ = &mut shutdown => break,
            }
        }

        tracing::debug!(client = %stream.client, "Stream ended");
        observer.end(code);
        drop(registration);
    })
}

// === impl AdsStream ===

impl AdsStream {
    fn new(client: &str) -> Self {
        Self {
            client: client.to_string(),
            subscriptions: Default::default(),
            nonce: 0,
        }
    }

    /// Handles a request, returning a response when the request subscribes
    /// to a type for the first time or changes the names it requests.
    fn on_request(
        &mut self,
        req: DiscoveryRequest,
        snapshot: Option<&Snapshot>,
    ) -> Option<DiscoveryResponse> {
        let Some(i) = TYPES.iter().position(|t| *t == req.type_url) else {
            tracing::debug!(client = %self.client, type_url = %req.type_url, "Ignoring unsupported resource type");
            return None;
        };

        let sub = self.subscriptions[i].get_or_insert_with(Default::default);
        let last_nonce = sub.sent.as_ref().map(|(_, nonce)| nonce.as_str());
        if !req.response_nonce.is_empty() && Some(req.response_nonce.as_str()) != last_nonce {
            tracing::trace!(client = %self.client, type_url = %req.type_url, nonce = %req.response_nonce, "Ignoring stale request");
            return None;
        }

        if let Some(error) = req.error_detail.as_ref() {
            tracing::warn!(
                client = %self.client,
                type_url = %req.type_url,
                version = %req.version_info,
                error = %error.message,
                "Client rejected configuration"
            );
        } else if !req.response_nonce.is_empty() {
            tracing::trace!(client = %self.client, type_url = %req.type_url, version = %req.version_info, "Acknowledged");
            sub.acked = Some(req.version_info);
        }

        let names = req.resource_names.into_iter().collect::<BTreeSet<_>>();
        let renamed = names != sub.names;
        sub.names = names;
        if sub.sent.is_none() || renamed {
            return self.respond(i, snapshot?);
        }
        None
    }

    /// Returns responses, in dependency order, for every subscribed type
    /// whose version changed.
    fn on_snapshot(&mut self, snapshot: &Snapshot) -> Vec<DiscoveryResponse> {
        let mut responses = Vec::new();
        for (i, type_url) in TYPES.iter().enumerate() {
            let changed = match (
                self.subscriptions[i].as_ref(),
                snapshot.resources(type_url),
            ) {
                (Some(sub), Some(resources)) => {
                    sub.sent.as_ref().map(|(version, _)| version) != Some(&resources.version)
                }
                _ => false,
            };
            if changed {
                responses.extend(self.respond(i, snapshot));
            }
        }
        responses
    }

    fn respond(&mut self, i: usize, snapshot: &Snapshot) -> Option<DiscoveryResponse> {
        let type_url = TYPES[i];
        let resources = snapshot.resources(type_url)?;
        self.nonce += 1;
        let nonce = self.nonce.to_string();

        let sub = self.subscriptions[i].as_mut()?;
        // Listeners and clusters are always served in full.
        let filtered = !sub.names.is_empty()
            && matches!(
                type_url,
                type_urls::CLUSTER_LOAD_ASSIGNMENT | type_urls::ROUTE_CONFIGURATION
            );
        let items = resources
            .items
            .iter()
            .filter(|r| !filtered || sub.names.contains(&r.name))
            .map(|r| r.any.clone())
            .collect::<Vec<_>>();
        sub.sent = Some((resources.version.clone(), nonce.clone()));
        tracing::debug!(
            client = %self.client,
            %type_url,
            version = %resources.version,
            resources = items.len(),
            "Sending"
        );

        Some(DiscoveryResponse {
            version_info: resources.version.clone(),
            resources: items,
            type_url: type_url.to_string(),
            nonce,
            ..Default::default()
        })
    }
}
