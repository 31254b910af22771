//! Joinable wrapper linking.
//!
//! A state machine that holds a joinable wrapper in one of its fields is
//! waiting on the wrapper's inner operation even though no continuation slot
//! says so. Those edges are added here, for nodes that have no predecessor yet.

use heapscope_snapshot::{ObjectRef, Place, SnapshotAccessor, is_or_derives_from};
use tracing::debug;

use crate::harvest::collect_references;
use crate::{AsyncGraph, CancelFlag, Continuation, DumpAsyncError, NodeId, RuntimeConventions};

pub(crate) fn link_joinables<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    graph: &mut AsyncGraph,
    cancel: &CancelFlag,
) -> Result<(), DumpAsyncError> {
    let candidates: Vec<(NodeId, Place)> = graph
        .nodes
        .values()
        .filter(|node| node.previous.is_none())
        .filter_map(|node| node.state_machine.map(|sm| (node.id(), sm)))
        .collect();

    for (id, state_machine) in candidates {
        cancel.check()?;
        let Some(wrapper) = find_joinable(accessor, conventions, state_machine) else {
            continue;
        };
        let Some(wrapped) = accessor
            .read_object_field(wrapper, &conventions.joinable_wrapped_field)
            .map(NodeId::from)
        else {
            continue;
        };
        if wrapped == id {
            continue;
        }
        let Some(inner) = graph.nodes.get_mut(&wrapped) else {
            continue;
        };
        if !inner.continuations.contains(&Continuation::Node(id)) {
            inner.continuations.push(Continuation::Node(id));
        }
        inner.dependents += 1;
        if let Some(node) = graph.nodes.get_mut(&id) {
            node.previous = Some(wrapped);
        }
        graph.stats.joinable_links += 1;
        debug!(node = %id, wrapped = %wrapped, "linked through joinable wrapper");
    }
    Ok(())
}

/// First joinable wrapper referenced from the state machine's fields, looking
/// one level into embedded values.
fn find_joinable<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    state_machine: Place,
) -> Option<ObjectRef> {
    let ty = accessor.type_of(state_machine)?;
    let mut refs = Vec::new();
    for field in &ty.fields {
        collect_references(accessor, state_machine, field, 1, &mut refs);
    }
    refs.into_iter()
        .find(|r| is_or_derives_from(accessor, r.type_id, &conventions.joinable_type))
}
