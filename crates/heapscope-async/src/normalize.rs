//! Turns the raw continuation graph into a forest that is safe to walk.
//!
//! Conflicting predecessor claims are demoted, every node gets a depth, and
//! predecessor cycles (which a live heap should never have, but a corrupt one
//! can) are broken at their smallest identity.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::{AsyncGraph, Continuation, NodeId};

pub(crate) fn normalize(graph: &mut AsyncGraph) {
    resolve_conflicts(graph);
    assign_depths(graph);
    for node in graph.nodes.values_mut() {
        node.top_level = node.previous.is_none();
    }
}

// ── Conflicting claims ──────────────────────────────────────────

/// P continues into Q but Q's canonical predecessor is someone else: P
/// becomes Q's alternate predecessor and its claim turns into a terminal.
fn resolve_conflicts(graph: &mut AsyncGraph) {
    let mut demotions = Vec::new();
    for (p, node) in &graph.nodes {
        for q in node.node_continuations() {
            let claimed = graph.nodes.get(&q).and_then(|target| target.previous);
            if claimed != Some(*p) {
                demotions.push((*p, q));
            }
        }
    }

    for (p, q) in demotions {
        let Some(target) = graph.nodes.get_mut(&q) else {
            continue;
        };
        if target.alternate_previous.is_none() {
            target.alternate_previous = Some(p);
        }
        let identity = target.identity;
        if let Some(source) = graph.nodes.get_mut(&p) {
            demote_claim(&mut source.continuations, q, Continuation::Terminal(identity));
        }
        graph.stats.demoted_claims += 1;
        debug!(predecessor = %p, node = %q, "demoted conflicting predecessor claim");
    }
}

fn demote_claim(continuations: &mut [Continuation], target: NodeId, replacement: Continuation) {
    for continuation in continuations {
        if *continuation == Continuation::Node(target) {
            *continuation = replacement;
        }
    }
}

// ── Depths ──────────────────────────────────────────────────────

fn assign_depths(graph: &mut AsyncGraph) {
    // Per-walk generation marker; a node seen twice in one walk is a cycle.
    let mut generation: HashMap<NodeId, u32> = HashMap::new();
    let mut current = 0u32;

    let roots: Vec<(NodeId, u32)> = graph
        .nodes
        .values()
        .filter(|node| node.previous.is_none())
        .map(|node| (node.id(), u32::from(node.alternate_previous.is_some())))
        .collect();
    for (root, start) in roots {
        current += 1;
        walk(graph, root, start, current, &mut generation);
    }

    // Whatever is left hangs off a predecessor cycle.
    while let Some(stranded) = graph
        .nodes
        .values()
        .find(|node| node.depth.is_none())
        .map(|node| node.id())
    {
        let breaker = cycle_breaker(graph, stranded);
        detach(graph, breaker);
        current += 1;
        walk(graph, breaker, 1, current, &mut generation);
    }
}

fn walk(
    graph: &mut AsyncGraph,
    root: NodeId,
    start: u32,
    walk_id: u32,
    generation: &mut HashMap<NodeId, u32>,
) {
    let mut stack = vec![(root, start)];
    while let Some((id, depth)) = stack.pop() {
        if generation.insert(id, walk_id) == Some(walk_id) {
            continue;
        }
        let Some(node) = graph.nodes.get_mut(&id) else {
            continue;
        };
        if node.depth.is_none() {
            node.depth = Some(depth);
        }
        let children: Vec<NodeId> = node.node_continuations().collect();
        for child in children.into_iter().rev() {
            stack.push((child, depth.saturating_add(1)));
        }
    }
}

/// Follows `previous` from `start` into the cycle it ends in and returns the
/// cycle member with the smallest identity.
fn cycle_breaker(graph: &AsyncGraph, start: NodeId) -> NodeId {
    let mut path = Vec::new();
    let mut on_path = BTreeSet::new();
    let mut current = start;
    loop {
        if !on_path.insert(current) {
            break;
        }
        path.push(current);
        match graph.nodes.get(&current).and_then(|node| node.previous) {
            Some(previous) => current = previous,
            None => return current,
        }
    }
    let cycle_start = path.iter().position(|id| *id == current).unwrap_or(0);
    path[cycle_start..].iter().copied().min().unwrap_or(start)
}

fn detach(graph: &mut AsyncGraph, id: NodeId) {
    let Some(node) = graph.nodes.get_mut(&id) else {
        return;
    };
    let Some(previous) = node.previous.take() else {
        return;
    };
    if node.alternate_previous.is_none() {
        node.alternate_previous = Some(previous);
    }
    let identity = node.identity;
    if let Some(predecessor) = graph.nodes.get_mut(&previous) {
        demote_claim(
            &mut predecessor.continuations,
            id,
            Continuation::Terminal(identity),
        );
    }
    graph.stats.broken_cycles += 1;
    debug!(node = %id, predecessor = %previous, "broke predecessor cycle");
}
