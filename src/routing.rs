//! Shortest-path computation over the topology graph, with a
//! `topology_version`-keyed cache (§4.2).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::topology::TopologyStore;

#[derive(Debug, Clone, Default)]
pub struct PathCache {
    entries: HashMap<(u64, u64), (u64, Vec<u64>)>,
}

impl PathCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached path if present and not stale relative to
    /// `current_version` (§4.2: any entry whose version differs from the
    /// store's current version is discarded).
    pub fn get(&self, src: u64, dst: u64, current_version: u64) -> Option<Vec<u64>> {
        self.entries.get(&(src, dst)).and_then(|(v, path)| {
            if *v == current_version {
                Some(path.clone())
            } else {
                None
            }
        })
    }

    pub fn insert(&mut self, src: u64, dst: u64, version: u64, path: Vec<u64>) {
        self.entries.insert((src, dst), (version, path));
    }
}

#[derive(PartialEq, Eq)]
struct HeapEntry {
    cost: u32,
    dpid: u64,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on cost; ties broken by dpid ascending (§4.2).
        other
            .cost
            .cmp(&self.cost)
            .then_with(|| other.dpid.cmp(&self.dpid))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Dijkstra over switches, edge weight = the outgoing port's cost.
/// Returns `[src, ..., dst]` or `None` if unreachable.
pub fn find_route(topology: &TopologyStore, src: u64, dst: u64) -> Option<Vec<u64>> {
    if src == dst {
        return Some(vec![src]);
    }
    if !topology.switches.contains_key(&src) || !topology.switches.contains_key(&dst) {
        return None;
    }

    let mut dist: HashMap<u64, u32> = HashMap::new();
    let mut prev: HashMap<u64, u64> = HashMap::new();
    let mut heap = BinaryHeap::new();

    dist.insert(src, 0);
    heap.push(HeapEntry { cost: 0, dpid: src });

    while let Some(HeapEntry { cost, dpid }) = heap.pop() {
        if dpid == dst {
            break;
        }
        if cost > *dist.get(&dpid).unwrap_or(&u32::MAX) {
            continue;
        }
        let Some(sw) = topology.switches.get(&dpid) else {
            continue;
        };
        for port in sw.ports.values() {
            let Some((peer_dpid, _)) = port.peer else {
                continue;
            };
            let next_cost = cost + port.cost;
            if next_cost < *dist.get(&peer_dpid).unwrap_or(&u32::MAX) {
                dist.insert(peer_dpid, next_cost);
                prev.insert(peer_dpid, dpid);
                heap.push(HeapEntry {
                    cost: next_cost,
                    dpid: peer_dpid,
                });
            }
        }
    }

    if !dist.contains_key(&dst) {
        return None;
    }

    let mut path = vec![dst];
    let mut current = dst;
    while let Some(&p) = prev.get(&current) {
        path.push(p);
        current = p;
        if current == src {
            break;
        }
    }
    path.reverse();
    if path.first() != Some(&src) {
        return None;
    }
    Some(path)
}

/// Cache-aware wrapper around [`find_route`] (§4.2).
pub fn find_route_cached(
    topology: &TopologyStore,
    cache: &mut PathCache,
    src: u64,
    dst: u64,
) -> Option<Vec<u64>> {
    if let Some(path) = cache.get(src, dst, topology.version) {
        return Some(path);
    }
    let path = find_route(topology, src, dst)?;
    cache.insert(src, dst, topology.version, path.clone());
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingConfig;
    use crate::error::OpenFlowError;
    use crate::openflow::{FeaturesReply, FlowMod, PacketOut, PortDesc, SwitchConnection};
    use pnet::util::MacAddr;
    use std::sync::Arc;

    #[derive(Debug)]
    struct NullConnection;
    impl SwitchConnection for NullConnection {
        fn dpid(&self) -> u64 {
            0
        }
        fn send_flow_mod(&self, _: FlowMod) -> Result<(), OpenFlowError> {
            Ok(())
        }
        fn send_packet_out(&self, _: PacketOut) -> Result<(), OpenFlowError> {
            Ok(())
        }
    }

    fn linear_topology() -> TopologyStore {
        // S1(1) -- S2(2) -- S3(3), each hop cost 1 (features 0x40 -> 64/64=1)
        let mut t = TopologyStore::new(RoutingConfig::default());
        for dpid in [1u64, 2, 3] {
            t.on_switch_enter(dpid, Arc::new(NullConnection));
        }
        for (dpid, ports) in [
            (1u64, vec![10u16]),
            (2u64, vec![20u16, 21u16]),
            (3u64, vec![30u16]),
        ] {
            t.on_features(FeaturesReply {
                dpid,
                ports: ports
                    .into_iter()
                    .map(|port_no| PortDesc {
                        port_no,
                        name: format!("p{}", port_no),
                        hw_addr: MacAddr::new(0, 0, 0, 0, (dpid as u8), port_no as u8),
                        curr_features: 0x40,
                    })
                    .collect(),
            });
        }
        t.on_link_add((1, 10), (2, 20));
        t.on_link_add((2, 21), (3, 30));
        t
    }

    #[test]
    fn test_three_hop_path() {
        let t = linear_topology();
        let path = find_route(&t, 1, 3).unwrap();
        assert_eq!(path, vec![1, 2, 3]);
    }

    #[test]
    fn test_no_route_when_unreachable() {
        let mut t = linear_topology();
        t.on_switch_enter(99, Arc::new(NullConnection));
        assert!(find_route(&t, 1, 99).is_none());
    }

    #[test]
    fn test_cache_invalidated_by_version_bump() {
        let mut t = linear_topology();
        let mut cache = PathCache::new();
        let path = find_route_cached(&t, &mut cache, 1, 3).unwrap();
        assert_eq!(path, vec![1, 2, 3]);
        let stale_version = t.version;
        t.on_link_delete((2, 21), (3, 30));
        assert!(cache.get(1, 3, stale_version).is_some());
        assert!(cache.get(1, 3, t.version).is_none());
    }
}
