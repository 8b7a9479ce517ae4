//! An HTTP server exposing the published snapshots.

use crate::cache::{Resources, Snapshot, SnapshotCache};
use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::{convert::Infallible, net::SocketAddr};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

type Body = http_body_util::Full<Bytes>;

#[derive(Debug, Default, PartialEq, Eq)]
struct Filter<'a> {
    name: Option<&'a str>,
    namespace: Option<&'a str>,
}

#[derive(Serialize)]
struct SnapshotView<'a> {
    client: &'a str,
    gateway: GatewayView<'a>,
    clusters: ResourcesView<'a>,
    endpoints: ResourcesView<'a>,
    listeners: ResourcesView<'a>,
    routes: ResourcesView<'a>,
}

#[derive(Serialize)]
struct GatewayView<'a> {
    namespace: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
struct ResourcesView<'a> {
    version: &'a str,
    names: Vec<&'a str>,
}

/// Serves `GET /snapshots` until `drain` is signaled.
pub async fn serve(
    addr: SocketAddr,
    cache: SnapshotCache,
    drain: drain::Watch,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Debug server listening");

    tokio::pin! {
        let shutdown = drain.signaled();
    }
    loop {
        tokio::select! {
            res = listener.accept() => {
                let (io, peer) = match res {
                    Ok(conn) => conn,
                    Err(error) => {
                        warn!(%error, "Failed to accept connection");
                        continue;
                    }
                };
                let cache = cache.clone();
                tokio::spawn(async move {
                    let svc = hyper::service::service_fn(move |req: Request<hyper::body::Incoming>| {
                        let rsp = handle(&cache, &req);
                        async move { Ok::<_, Infallible>(rsp) }
                    });
                    if let Err(error) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(io), svc)
                        .await
                    {
                        debug!(%error, %peer, "Connection failed");
                    }
                });
            }

            _ = &mut shutdown => {
                debug!("Debug server shutting down");
                return Ok(());
            }
        }
    }
}

fn handle<B>(cache: &SnapshotCache, req: &Request<B>) -> Response<Body> {
    if req.uri().path() != "/snapshots" {
        return status(StatusCode::NOT_FOUND);
    }
    if !matches!(*req.method(), Method::GET | Method::HEAD) {
        return status(StatusCode::METHOD_NOT_ALLOWED);
    }

    let filter = Filter::parse(req.uri().query().unwrap_or_default());
    let snapshots = cache.snapshots();
    let views = snapshots
        .iter()
        .filter(|(_, s)| filter.matches(s))
        .map(|(client, s)| SnapshotView::new(client, s))
        .collect::<Vec<_>>();

    match serde_json::to_vec_pretty(&views) {
        Ok(json) => {
            let mut rsp = Response::new(Body::from(json));
            rsp.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("application/json"),
            );
            rsp
        }
        Err(error) => {
            warn!(%error, "Failed to encode snapshots");
            status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn status(code: StatusCode) -> Response<Body> {
    let mut rsp = Response::new(Body::default());
    *rsp.status_mut() = code;
    rsp
}

// === impl Filter ===

impl<'a> Filter<'a> {
    fn parse(query: &'a str) -> Self {
        let mut filter = Self::default();
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("name", v)) if !v.is_empty() => filter.name = Some(v),
                Some(("namespace", v)) if !v.is_empty() => filter.namespace = Some(v),
                _ => {}
            }
        }
        filter
    }

    fn matches(&self, snapshot: &Snapshot) -> bool {
        self.name.map_or(true, |n| n == snapshot.gateway.name)
            && self
                .namespace
                .map_or(true, |ns| ns == snapshot.gateway.namespace)
    }
}

// === impl SnapshotView ===

impl<'a> SnapshotView<'a> {
    fn new(client: &'a str, snapshot: &'a Snapshot) -> Self {
        Self {
            client,
            gateway: GatewayView {
                namespace: &snapshot.gateway.namespace,
                name: &snapshot.gateway.name,
            },
            clusters: ResourcesView::new(&snapshot.clusters),
            endpoints: ResourcesView::new(&snapshot.endpoints),
            listeners: ResourcesView::new(&snapshot.listeners),
            routes: ResourcesView::new(&snapshot.routes),
        }
    }
}

impl<'a> ResourcesView<'a> {
    fn new(resources: &'a Resources) -> Self {
        Self {
            version: &resources.version,
            names: resources.names().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_controller_core::ir::{GroupKind, ObjectSource};
    use std::sync::Arc;

    fn cache() -> SnapshotCache {
        let cache = SnapshotCache::new(8);
        for (client, ns, name) in [("a~gw~1", "a", "gw"), ("b~gw~1", "b", "gw")] {
            let snapshot = Snapshot {
                gateway: ObjectSource::new(&GroupKind::gateway(), ns, name),
                ..Default::default()
            };
            cache.set(client, Arc::new(snapshot)).unwrap();
        }
        cache
    }

    async fn get(cache: &SnapshotCache, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::get(uri).body(()).unwrap();
        let rsp = handle(cache, &req);
        let status = rsp.status();
        if status != StatusCode::OK {
            return (status, serde_json::Value::Null);
        }
        let body = http_body_util::BodyExt::collect(rsp.into_body())
            .await
            .unwrap()
            .to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn lists_snapshots() {
        let (status, json) = get(&cache(), "/snapshots").await;
        assert_eq!(status, StatusCode::OK);
        let clients = json
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["client"].as_str().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(clients, vec!["a~gw~1", "b~gw~1"]);
        assert_eq!(json[0]["clusters"]["version"], "");
    }

    #[tokio::test]
    async fn filters_by_gateway() {
        let (_, json) = get(&cache(), "/snapshots?namespace=b&name=gw").await;
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["gateway"]["namespace"], "b");

        let (_, json) = get(&cache(), "/snapshots?name=other").await;
        assert!(json.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let (status, _) = get(&cache(), "/config").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
