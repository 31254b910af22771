//! The reconstructed continuation graph and the pass pipeline that builds it.

use std::collections::{BTreeMap, HashMap};

use heapscope_snapshot::SnapshotAccessor;
use tracing::info;

use crate::{
    AsyncNode, CancelFlag, DumpAsyncError, NodeId, RuntimeConventions, blocking, harvest, link,
    normalize, resolve,
};

/// Counters collected while building a graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphStats {
    /// Operation and runner objects looked at.
    pub scanned: usize,
    pub harvested: usize,
    /// Objects dropped because they could not be read.
    pub skipped: usize,
    /// Finished state machines left behind for reuse.
    pub stale: usize,
    pub continuation_edges: usize,
    pub joinable_links: usize,
    pub blocked_nodes: usize,
    pub demoted_claims: usize,
    pub broken_cycles: usize,
}

/// Every async operation found in one snapshot, keyed by identity.
///
/// Built once per run and never shared; handles inside point into the
/// snapshot it was built from.
#[derive(Debug, Clone, Default)]
pub struct AsyncGraph {
    pub nodes: BTreeMap<NodeId, AsyncNode>,
    /// State machine address to the node it drives.
    pub(crate) by_state_machine: HashMap<u64, NodeId>,
    pub stats: GraphStats,
}

impl AsyncGraph {
    /// Harvests, resolves, links, annotates and normalizes, in that order.
    pub fn build<A: SnapshotAccessor>(
        accessor: &A,
        conventions: &RuntimeConventions,
        cancel: &CancelFlag,
    ) -> Result<Self, DumpAsyncError> {
        let mut graph = harvest::harvest(accessor, conventions, cancel)?;
        resolve::resolve_all(accessor, conventions, &mut graph, cancel)?;
        link::link_joinables(accessor, conventions, &mut graph, cancel)?;
        blocking::annotate_blocking(accessor, conventions, &mut graph, cancel)?;
        normalize::normalize(&mut graph);

        info!(
            nodes = graph.nodes.len(),
            roots = graph.nodes.values().filter(|n| n.top_level).count(),
            edges = graph.stats.continuation_edges,
            joinable_links = graph.stats.joinable_links,
            blocked = graph.stats.blocked_nodes,
            skipped = graph.stats.skipped,
            "async graph built"
        );
        Ok(graph)
    }

    pub fn node(&self, id: NodeId) -> Option<&AsyncNode> {
        self.nodes.get(&id)
    }

    pub fn node_for_state_machine(&self, address: u64) -> Option<NodeId> {
        self.by_state_machine.get(&address).copied()
    }

    /// Top-level nodes, shallowest first, then by identity.
    pub fn roots(&self) -> Vec<&AsyncNode> {
        let mut roots: Vec<&AsyncNode> = self.nodes.values().filter(|n| n.top_level).collect();
        roots.sort_by_key(|n| (n.depth.unwrap_or(0), n.id()));
        roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
