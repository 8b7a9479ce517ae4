use crate::extensions::PolicyPlugin;
use envoy_types::pb::envoy::config::{core::v3, endpoint::v3::ClusterLoadAssignment};
use gateway_controller_core::{
    ir::{EndpointsForUpstream, GroupKind, Locality},
    UniqueClient,
};

/// Prefers endpoints close to each client: same locality first, then the same
/// zone, then the same region.
#[derive(Clone, Debug, Default)]
pub struct LocalityPlugin;

/// Returns the priority of endpoints in `endpoint` for a client in `client`.
/// Lower is preferred.
pub fn priority(client: &Locality, endpoint: &Locality) -> u32 {
    if client == endpoint {
        0
    } else if client.region == endpoint.region && client.zone == endpoint.zone {
        1
    } else if client.region == endpoint.region {
        2
    } else {
        3
    }
}

impl PolicyPlugin for LocalityPlugin {
    fn group_kind(&self) -> GroupKind {
        GroupKind::new("localityplugin", "localityplugin")
    }

    fn name(&self) -> &'static str {
        "locality"
    }

    fn per_client_process_endpoints(
        &self,
        client: &UniqueClient,
        _endpoints: &EndpointsForUpstream,
        out: &mut ClusterLoadAssignment,
    ) {
        if client.locality == Locality::default() {
            return;
        }

        let priorities = out
            .endpoints
            .iter()
            .map(|lle| {
                let locality = lle.locality.as_ref().map(from_envoy).unwrap_or_default();
                priority(&client.locality, &locality)
            })
            .collect::<Vec<_>>();

        // Envoy requires priorities to be contiguous from zero.
        let mut ranks = priorities.clone();
        ranks.sort_unstable();
        ranks.dedup();
        for (lle, p) in out.endpoints.iter_mut().zip(priorities) {
            lle.priority = ranks.iter().position(|r| *r == p).unwrap_or_default() as u32;
        }
    }
}

fn from_envoy(l: &v3::Locality) -> Locality {
    Locality {
        region: l.region.clone(),
        zone: l.zone.clone(),
        subzone: l.sub_zone.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::config::endpoint::v3::LocalityLbEndpoints;
    use gateway_controller_core::ir::{ObjectSource, OpaqueIr, Upstream};

    fn locality(region: &str, zone: &str, subzone: &str) -> Locality {
        Locality {
            region: region.to_string(),
            zone: zone.to_string(),
            subzone: subzone.to_string(),
        }
    }

    fn lle(l: &Locality) -> LocalityLbEndpoints {
        LocalityLbEndpoints {
            locality: Some(v3::Locality {
                region: l.region.clone(),
                zone: l.zone.clone(),
                sub_zone: l.subzone.clone(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn priorities_by_proximity() {
        let client = locality("r1", "z1", "s1");
        assert_eq!(priority(&client, &locality("r1", "z1", "s1")), 0);
        assert_eq!(priority(&client, &locality("r1", "z1", "s2")), 1);
        assert_eq!(priority(&client, &locality("r1", "z2", "s1")), 2);
        assert_eq!(priority(&client, &locality("r2", "z1", "s1")), 3);
    }

    #[test]
    fn priorities_are_dense() {
        let client = UniqueClient::new("ns~gw", Default::default(), locality("r1", "z1", ""));
        let upstream = Upstream {
            source: ObjectSource::new(&GroupKind::service(), "ns", "svc"),
            port: 80,
            canonical_hostname: "svc.ns.svc.cluster.local".to_string(),
            ir: OpaqueIr::new(()),
            attached_policies: Default::default(),
            creation_timestamp: None,
        };
        let endpoints = EndpointsForUpstream::new(&upstream);
        let mut cla = ClusterLoadAssignment {
            endpoints: vec![
                lle(&locality("r1", "z2", "")),
                lle(&locality("r2", "z1", "")),
            ],
            ..Default::default()
        };
        LocalityPlugin.per_client_process_endpoints(&client, &endpoints, &mut cla);
        let priorities = cla.endpoints.iter().map(|e| e.priority).collect::<Vec<_>>();
        assert_eq!(priorities, vec![0, 1]);
    }
}
