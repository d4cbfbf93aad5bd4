//! Per-node route-table replica.
//!
//! Every node holds a read-mostly replica of the cluster-wide map from
//! endpoint identity to owning node, fed by directory watches. Convergence is
//! independent of delivery order: entries are keyed by `(endpoint, node)` and
//! within a key the higher generation wins. Deletes are retained as
//! tombstones so a late duplicate of a superseded ADD cannot resurrect a dead
//! route.

use dashmap::DashMap;
use tracing::debug;

use crate::core::{EndpointKey, NodeId};

use super::route::{GlobalRouteInfo, RouteOperation};

#[derive(Debug, Clone)]
struct RouteEntry {
    operation: RouteOperation,
    generation: u64,
    route: GlobalRouteInfo,
}

/// Read-mostly replica of the cluster route table.
///
/// Exactly one writer per node feeds `apply` (the directory dispatch
/// sequence); any number of readers call `lookup`.
#[derive(Debug, Default)]
pub struct RouteTable {
    entries: DashMap<(EndpointKey, NodeId), RouteEntry>,
}

impl RouteTable {
    /// Create an empty replica.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one route announcement.
    ///
    /// Returns `true` if the replica changed. Entries with a generation not
    /// strictly greater than the stored one are ignored, which makes `apply`
    /// safe under at-least-once, out-of-order directory delivery.
    pub fn apply(&self, route: GlobalRouteInfo) -> bool {
        let key = route.key();
        let mut changed = false;

        self.entries
            .entry(key)
            .and_modify(|entry| {
                if route.generation > entry.generation {
                    debug!(
                        endpoint = %route.address.endpoint,
                        node = %route.address.owner,
                        generation = route.generation,
                        operation = ?route.operation,
                        "route entry superseded"
                    );
                    entry.operation = route.operation;
                    entry.generation = route.generation;
                    entry.route = route.clone();
                    changed = true;
                }
            })
            .or_insert_with(|| {
                changed = true;
                RouteEntry {
                    operation: route.operation,
                    generation: route.generation,
                    route,
                }
            });

        changed
    }

    /// Node currently owning the endpoint's live session, if any.
    ///
    /// With strictly increasing generations per key at most one live ADD
    /// exists; during ownership handover the highest generation wins.
    pub fn lookup(&self, endpoint: &EndpointKey) -> Option<NodeId> {
        self.entries
            .iter()
            .filter(|entry| {
                entry.key().0 == *endpoint && entry.value().operation == RouteOperation::Add
            })
            .max_by_key(|entry| entry.value().generation)
            .map(|entry| entry.key().1.clone())
    }

    /// All live routes, for diagnostics.
    pub fn live_routes(&self) -> Vec<GlobalRouteInfo> {
        self.entries
            .iter()
            .filter(|entry| entry.value().operation == RouteOperation::Add)
            .map(|entry| entry.value().route.clone())
            .collect()
    }

    /// Number of live (non-tombstone) routes.
    pub fn live_len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().operation == RouteOperation::Add)
            .count()
    }

    /// Final mapping from endpoint to owner, for convergence checks.
    pub fn mapping(&self) -> std::collections::BTreeMap<EndpointKey, NodeId> {
        let mut best: std::collections::BTreeMap<EndpointKey, (NodeId, u64)> =
            std::collections::BTreeMap::new();
        for entry in self.entries.iter() {
            if entry.value().operation != RouteOperation::Add {
                continue;
            }
            let (endpoint, node) = entry.key();
            let generation = entry.value().generation;
            match best.get(endpoint) {
                Some((_, held)) if *held >= generation => {}
                _ => {
                    best.insert(endpoint.clone(), (node.clone(), generation));
                }
            }
        }
        best.into_iter().map(|(key, (node, _))| (key, node)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::route::RouteTableAddress;

    fn endpoint(tag: &[u8]) -> EndpointKey {
        EndpointKey::from_public_key(tag)
    }

    fn add(endpoint_tag: &[u8], node: &str, generation: u64) -> GlobalRouteInfo {
        GlobalRouteInfo::add(
            "tenant",
            "user",
            RouteTableAddress::new(endpoint(endpoint_tag), "app", NodeId::new(node)),
            1,
            None,
            generation,
        )
    }

    fn delete(endpoint_tag: &[u8], node: &str, generation: u64) -> GlobalRouteInfo {
        GlobalRouteInfo::delete(
            "tenant",
            "user",
            RouteTableAddress::new(endpoint(endpoint_tag), "app", NodeId::new(node)),
            generation,
        )
    }

    #[test]
    fn test_add_then_lookup() {
        let table = RouteTable::new();
        assert!(table.apply(add(b"e1", "node-a", 1)));
        assert_eq!(table.lookup(&endpoint(b"e1")), Some(NodeId::new("node-a")));
        assert_eq!(table.lookup(&endpoint(b"e2")), None);
    }

    #[test]
    fn test_delete_supersedes_add() {
        let table = RouteTable::new();
        table.apply(add(b"e1", "node-a", 1));
        assert!(table.apply(delete(b"e1", "node-a", 2)));
        assert_eq!(table.lookup(&endpoint(b"e1")), None);
    }

    #[test]
    fn test_stale_delete_is_ignored() {
        let table = RouteTable::new();
        table.apply(add(b"e1", "node-a", 2));
        // Generation not strictly greater than the stored ADD.
        assert!(!table.apply(delete(b"e1", "node-a", 2)));
        assert!(!table.apply(delete(b"e1", "node-a", 1)));
        assert_eq!(table.lookup(&endpoint(b"e1")), Some(NodeId::new("node-a")));
    }

    #[test]
    fn test_late_duplicate_add_does_not_resurrect() {
        // Scenario: node A held the route at generation 1, closed the session
        // publishing a generation-2 DELETE; a late duplicate of the original
        // ADD arrives afterward.
        let table = RouteTable::new();
        table.apply(add(b"e1", "node-a", 1));
        table.apply(delete(b"e1", "node-a", 2));
        assert!(!table.apply(add(b"e1", "node-a", 1)));
        assert_eq!(table.lookup(&endpoint(b"e1")), None);
    }

    #[test]
    fn test_out_of_order_delivery_converges() {
        // DELETE delivered before the ADD it supersedes.
        let table = RouteTable::new();
        table.apply(delete(b"e1", "node-a", 2));
        table.apply(add(b"e1", "node-a", 1));
        assert_eq!(table.lookup(&endpoint(b"e1")), None);
    }

    #[test]
    fn test_handover_prefers_highest_generation() {
        let table = RouteTable::new();
        table.apply(add(b"e1", "node-a", 1));
        table.apply(add(b"e1", "node-b", 3));
        assert_eq!(table.lookup(&endpoint(b"e1")), Some(NodeId::new("node-b")));
    }

    // Route convergence property: any ordering and duplication of a
    // generation-increasing event set drives every replica to the identical
    // final mapping, with no deleted or superseded route surviving.
    #[test]
    fn test_convergence_under_any_order_and_duplication() {
        let events = vec![
            add(b"e1", "node-a", 1),
            delete(b"e1", "node-a", 2),
            add(b"e1", "node-b", 3),
            add(b"e2", "node-a", 1),
            add(b"e3", "node-c", 1),
            delete(b"e3", "node-c", 2),
        ];

        let mut state = 0x2545_F491_4F6C_DD1Du64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let reference = RouteTable::new();
        for event in &events {
            reference.apply(event.clone());
        }
        let expected = reference.mapping();

        for _ in 0..50 {
            // Shuffle and duplicate the event stream.
            let mut stream: Vec<GlobalRouteInfo> = events.clone();
            stream.extend(events.iter().filter(|_| next() % 2 == 0).cloned());
            for i in (1..stream.len()).rev() {
                let j = (next() % (i as u64 + 1)) as usize;
                stream.swap(i, j);
            }

            let replica = RouteTable::new();
            for event in stream {
                replica.apply(event);
            }

            assert_eq!(replica.mapping(), expected);
            assert_eq!(replica.lookup(&endpoint(b"e1")), Some(NodeId::new("node-b")));
            assert_eq!(replica.lookup(&endpoint(b"e3")), None);
        }
    }
}
