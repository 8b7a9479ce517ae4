use super::{ObjectSource, Upstream};
use crate::{
    collection::{Equals, Keyed},
    hash::{self, fnv64},
};
use std::collections::BTreeMap;

/// Filter-metadata namespace consulted by Envoy's transport socket matcher.
pub const TRANSPORT_SOCKET_MATCH_KEY: &str = "envoy.transport_socket_match";

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Locality {
    pub region: String,
    pub zone: String,
    pub subzone: String,
}

/// A single endpoint address with the metadata its upstream's plugins need.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointWithMd {
    pub address: String,
    pub port: u16,
    pub weight: u32,
    pub labels: BTreeMap<String, String>,
    /// Envoy filter metadata: namespace -> key -> value.
    pub metadata: BTreeMap<String, BTreeMap<String, String>>,
}

/// The endpoints of one upstream, grouped by locality.
#[derive(Clone, Debug, PartialEq)]
pub struct EndpointsForUpstream {
    pub upstream: ObjectSource,
    pub cluster_name: String,
    pub port: u16,
    pub hostname: String,
    pub by_locality: BTreeMap<Locality, Vec<EndpointWithMd>>,
    upstream_hash: u64,
    endpoints_hash: u64,
    hash: u64,
}

// === impl EndpointWithMd ===

impl EndpointWithMd {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            weight: 1,
            labels: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Marks the endpoint for the named transport socket match.
    pub fn with_transport_socket_match(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .entry(TRANSPORT_SOCKET_MATCH_KEY.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self
    }
}

// === impl EndpointsForUpstream ===

impl EndpointsForUpstream {
    pub fn new(upstream: &Upstream) -> Self {
        let upstream_hash = fnv64(&(
            &upstream.source,
            upstream.port,
            &upstream.canonical_hostname,
        ));
        Self {
            upstream: upstream.source.clone(),
            cluster_name: upstream.cluster_name(),
            port: upstream.port,
            hostname: upstream.canonical_hostname.clone(),
            by_locality: BTreeMap::new(),
            upstream_hash,
            endpoints_hash: 0,
            hash: hash::mix(0, upstream_hash),
        }
    }

    /// Adds an endpoint. The resulting hash does not depend on the order in
    /// which endpoints are added.
    pub fn add(&mut self, locality: Locality, endpoint: EndpointWithMd) {
        self.endpoints_hash ^= fnv64(&(&locality, &endpoint));
        self.hash = hash::mix(self.endpoints_hash, self.upstream_hash);
        self.by_locality.entry(locality).or_default().push(endpoint);
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn len(&self) -> usize {
        self.by_locality.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates endpoints in locality order.
    pub fn iter(&self) -> impl Iterator<Item = (&Locality, &EndpointWithMd)> + '_ {
        self.by_locality
            .iter()
            .flat_map(|(l, eps)| eps.iter().map(move |ep| (l, ep)))
    }
}

impl Keyed for EndpointsForUpstream {
    fn resource_name(&self) -> String {
        self.cluster_name.clone()
    }
}

impl Equals for EndpointsForUpstream {
    fn equals(&self, other: &Self) -> bool {
        self.upstream == other.upstream && self.hash == other.hash
    }
}
