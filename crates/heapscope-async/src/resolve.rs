//! Continuation resolution: what runs after each node completes.
//!
//! An operation's continuation slot holds nothing, a completion sentinel, a
//! single continuation object, or a list of them. Each continuation object is
//! unwrapped to its real target (the delegate's receiver, a runner, a box)
//! and classified as another node or as a terminal frame.

use heapscope_snapshot::{ObjectRef, SnapshotAccessor};
use tracing::{debug, trace};

use crate::harvest::type_name;
use crate::{AsyncGraph, CancelFlag, Continuation, DumpAsyncError, NodeId, RuntimeConventions};

/// Nested continuation wrappers we unwrap before giving up.
const MAX_WRAPPER_DEPTH: usize = 16;

/// Which access path located a continuation's target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationPath {
    /// `m_action._target`: an await continuation carrying a delegate.
    ActionTarget,
    /// `_target`: the continuation is itself a delegate.
    DelegateTarget,
    /// `m_task.m_stateObject._target`: a standard task continuation.
    StateObjectTarget,
    /// No path matched; the continuation object is its own target.
    Candidate,
}

pub(crate) fn resolve_all<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    graph: &mut AsyncGraph,
    cancel: &CancelFlag,
) -> Result<(), DumpAsyncError> {
    let ids: Vec<NodeId> = graph.nodes.keys().copied().collect();
    for id in ids {
        cancel.check()?;
        let identity = graph.nodes[&id].identity;
        let resolved = resolve_continuations(accessor, conventions, graph, identity);
        for target in resolved.iter().filter_map(|c| c.node()) {
            if let Some(node) = graph.nodes.get_mut(&target) {
                if node.previous.is_none() {
                    node.previous = Some(id);
                }
            }
            graph.stats.continuation_edges += 1;
        }
        if let Some(node) = graph.nodes.get_mut(&id) {
            node.continuations = resolved;
        }
    }
    Ok(())
}

/// Resolved continuations of `operation`, deduplicated, in discovery order.
/// Self-continuations are dropped.
pub fn resolve_continuations<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    graph: &AsyncGraph,
    operation: ObjectRef,
) -> Vec<Continuation> {
    let Some(raw) = accessor.read_object_field(operation, &conventions.continuation_field) else {
        return Vec::new();
    };
    let own_id = NodeId::from(operation);
    let mut out = Vec::new();
    for candidate in expand_candidates(accessor, conventions, raw) {
        let (target, path) = continuation_target(accessor, conventions, candidate);
        let continuation = classify(accessor, conventions, graph, target);
        trace!(
            operation = %own_id,
            candidate = %NodeId::from(candidate),
            ?path,
            ?continuation,
            "resolved continuation"
        );
        if continuation.node() == Some(own_id) {
            debug!(operation = %own_id, "dropping self-continuation");
            continue;
        }
        if out.contains(&continuation) {
            continue;
        }
        out.push(continuation);
    }
    out
}

/// Flattens the continuation slot into individual continuation objects.
fn expand_candidates<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    raw: ObjectRef,
) -> Vec<ObjectRef> {
    let is_sentinel =
        |obj: &ObjectRef| type_name(accessor, *obj) == conventions.completion_sentinel_type;
    if is_sentinel(&raw) {
        return Vec::new();
    }
    if !type_name(accessor, raw).starts_with(&conventions.continuation_list_prefix) {
        return vec![raw];
    }

    let Some(items) = accessor.read_object_field(raw, &conventions.list_items_field) else {
        return Vec::new();
    };
    let size = accessor
        .read_primitive_field::<i32>(raw, &conventions.list_size_field)
        .and_then(|size| usize::try_from(size).ok())
        .unwrap_or(0);
    let Some(elements) = accessor.read_array_elements(items) else {
        return Vec::new();
    };
    elements
        .into_iter()
        .take(size)
        .flatten()
        .filter(|element| !is_sentinel(element))
        .collect()
}

/// Finds the object a continuation will actually run, unwrapping wrappers.
pub fn continuation_target<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    candidate: ObjectRef,
) -> (ObjectRef, ContinuationPath) {
    let target_of = |delegate: ObjectRef| {
        accessor.read_object_field(delegate, &conventions.delegate_target_field)
    };

    let found = accessor
        .read_object_field(candidate, &conventions.action_field)
        .and_then(target_of)
        .map(|t| (t, ContinuationPath::ActionTarget))
        .or_else(|| target_of(candidate).map(|t| (t, ContinuationPath::DelegateTarget)))
        .or_else(|| {
            accessor
                .read_object_field(candidate, &conventions.inner_operation_field)
                .and_then(|task| accessor.read_object_field(task, &conventions.state_object_field))
                .and_then(target_of)
                .map(|t| (t, ContinuationPath::StateObjectTarget))
        });
    let (mut target, path) = found.unwrap_or((candidate, ContinuationPath::Candidate));

    for _ in 0..MAX_WRAPPER_DEPTH {
        let Some(inner) = accessor
            .read_object_field(target, &conventions.wrapped_continuation_field)
            .and_then(target_of)
        else {
            break;
        };
        target = inner;
    }
    (target, path)
}

fn classify<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    graph: &AsyncGraph,
    target: ObjectRef,
) -> Continuation {
    let state_machine = accessor
        .read_object_field(target, &conventions.runner_state_machine_field)
        .or_else(|| accessor.read_object_field(target, &conventions.box_state_machine_field));
    if let Some(id) = state_machine.and_then(|sm| graph.node_for_state_machine(sm.address)) {
        return Continuation::Node(id);
    }
    let id = NodeId::from(target);
    if graph.nodes.contains_key(&id) {
        Continuation::Node(id)
    } else {
        Continuation::Terminal(target)
    }
}
