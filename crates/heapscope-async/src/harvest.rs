//! Node harvesting: finds every live async operation on the heap.
//!
//! Two passes. The operation pass turns every readable operation object into
//! a node, recognizing state-machine boxes by type name. The runner pass walks
//! the runtime's "move next" runners, whose state machines lead (through the
//! builder, or a structural scan when the builder is unnamed) to operations
//! the first pass may have seen only as plain objects.
//!
//! Nothing here is fatal except failing to enumerate the heap at all. A bad
//! object is logged and skipped.

use std::collections::HashSet;
use std::fmt;

use heapscope_snapshot::{
    FieldDescriptor, FieldKind, ObjectRef, Place, SnapshotAccessor, is_or_derives_from,
};
use tracing::{debug, trace, warn};

use crate::{
    AsyncGraph, AsyncNode, CancelFlag, DumpAsyncError, GraphStats, NodeId, NodeKind,
    RuntimeConventions,
};

/// How many `m_builder` hops we follow inside a builder.
const MAX_BUILDER_NESTING: usize = 4;
/// How deep into embedded values the structural scan looks.
const MAX_SCAN_NESTING: usize = 2;

/// Which path produced a state machine's operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStrategy {
    BuilderChain,
    StructuralScan,
}

/// Why a single heap object was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Skip {
    UnknownType,
    UnreadableStatus,
    MissingStateMachine,
    UnreadableState,
    UnresolvedOperation,
}

impl fmt::Display for Skip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType => write!(f, "type metadata unavailable"),
            Self::UnreadableStatus => write!(f, "status flags unreadable"),
            Self::MissingStateMachine => write!(f, "runner has no state machine"),
            Self::UnreadableState => write!(f, "state machine state unreadable"),
            Self::UnresolvedOperation => write!(f, "no operation found for state machine"),
        }
    }
}

enum Outcome {
    Harvested,
    Upgraded,
    Duplicate,
    Stale,
}

impl GraphStats {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Harvested => self.harvested += 1,
            Outcome::Stale => self.stale += 1,
            Outcome::Upgraded | Outcome::Duplicate => {}
        }
    }
}

pub(crate) fn type_name<A: SnapshotAccessor>(accessor: &A, place: impl Into<Place>) -> &str {
    accessor
        .type_of(place)
        .map_or("<unknown type>", |ty| ty.name.as_str())
}

pub(crate) fn harvest<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    cancel: &CancelFlag,
) -> Result<AsyncGraph, DumpAsyncError> {
    let mut graph = AsyncGraph::default();

    for operation in accessor.enumerate_objects_of_type(&conventions.operation_type)? {
        cancel.check()?;
        graph.stats.scanned += 1;
        match harvest_operation(accessor, conventions, &mut graph, operation) {
            Ok(outcome) => graph.stats.record(outcome),
            Err(skip) => {
                graph.stats.skipped += 1;
                warn!(
                    address = %NodeId::from(operation),
                    type_name = type_name(accessor, operation),
                    reason = %skip,
                    "skipping operation"
                );
            }
        }
    }

    let mut seen_state_machines = HashSet::new();
    for runner in accessor.enumerate_objects_of_type(&conventions.runner_type)? {
        cancel.check()?;
        graph.stats.scanned += 1;
        match harvest_runner(
            accessor,
            conventions,
            &mut graph,
            runner,
            &mut seen_state_machines,
        ) {
            Ok(outcome) => graph.stats.record(outcome),
            Err(skip) => {
                graph.stats.skipped += 1;
                warn!(
                    address = %NodeId::from(runner),
                    type_name = type_name(accessor, runner),
                    reason = %skip,
                    "skipping runner"
                );
            }
        }
    }

    debug!(
        scanned = graph.stats.scanned,
        harvested = graph.stats.harvested,
        skipped = graph.stats.skipped,
        stale = graph.stats.stale,
        "harvest complete"
    );
    Ok(graph)
}

fn harvest_operation<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    graph: &mut AsyncGraph,
    operation: ObjectRef,
) -> Result<Outcome, Skip> {
    let is_box = accessor
        .type_of(operation)
        .ok_or(Skip::UnknownType)?
        .name
        .contains(&conventions.box_type_marker);
    let flags = accessor
        .read_primitive_field::<u32>(operation, &conventions.status_flags_field)
        .ok_or(Skip::UnreadableStatus)?;

    let mut node = AsyncNode::plain(operation, flags);
    if is_box {
        // Release builds box the state machine struct inline, debug builds
        // allocate it as a class.
        let field = &conventions.box_state_machine_field;
        let state_machine = accessor
            .read_object_field(operation, field)
            .map(Place::from)
            .or_else(|| accessor.read_value_field(operation, field).map(Place::from));
        promote(accessor, conventions, &mut node, state_machine);
        if node.await_state.is_some_and(|state| state < -1) {
            return Ok(Outcome::Stale);
        }
        if let Some(state_machine) = state_machine {
            graph
                .by_state_machine
                .insert(state_machine.address(), node.id());
        }
    }
    graph.nodes.insert(node.id(), node);
    Ok(Outcome::Harvested)
}

fn harvest_runner<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    graph: &mut AsyncGraph,
    runner: ObjectRef,
    seen: &mut HashSet<u64>,
) -> Result<Outcome, Skip> {
    let state_machine = accessor
        .read_object_field(runner, &conventions.runner_state_machine_field)
        .ok_or(Skip::MissingStateMachine)?;
    if !seen.insert(state_machine.address)
        || graph.by_state_machine.contains_key(&state_machine.address)
    {
        return Ok(Outcome::Duplicate);
    }

    let state = accessor
        .read_primitive_field::<i32>(state_machine, &conventions.state_field)
        .ok_or(Skip::UnreadableState)?;
    if state < -1 {
        // Finished; the storage is waiting to be reused.
        return Ok(Outcome::Stale);
    }

    let (operation, strategy) = resolve_operation(accessor, conventions, state_machine.into())
        .ok_or(Skip::UnresolvedOperation)?;
    trace!(
        state_machine = %NodeId::from(state_machine),
        operation = %NodeId::from(operation),
        ?strategy,
        "resolved state machine operation"
    );

    let id = NodeId::from(operation);
    let outcome = match graph.nodes.get_mut(&id) {
        Some(node) => {
            if node.state_machine.is_none() {
                promote(accessor, conventions, node, Some(state_machine.into()));
            }
            Outcome::Upgraded
        }
        None => {
            let flags = accessor
                .read_primitive_field::<u32>(operation, &conventions.status_flags_field)
                .ok_or(Skip::UnreadableStatus)?;
            let mut node = AsyncNode::plain(operation, flags);
            promote(accessor, conventions, &mut node, Some(state_machine.into()));
            graph.nodes.insert(id, node);
            Outcome::Harvested
        }
    };
    graph.by_state_machine.insert(state_machine.address, id);
    Ok(outcome)
}

fn promote<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    node: &mut AsyncNode,
    state_machine: Option<Place>,
) {
    node.kind = NodeKind::StateMachineBox;
    node.state_machine = state_machine;
    if let Some(state_machine) = state_machine {
        node.await_state =
            accessor.read_primitive_field::<i32>(state_machine, &conventions.state_field);
        node.code_address = resumption_address(accessor, conventions, state_machine);
    }
}

/// Entry point of the first jitted resumption method on the state machine type.
fn resumption_address<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    state_machine: Place,
) -> Option<u64> {
    accessor
        .type_of(state_machine)?
        .methods
        .iter()
        .filter(|m| m.name == conventions.resumption_method)
        .find_map(|m| m.native_code.filter(|code| *code != 0))
}

// ── Operation resolution strategies ─────────────────────────────

/// Finds the operation a state machine completes.
///
/// The builder chain is authoritative when the builder field is known by
/// name; the structural scan only runs when it is not.
pub fn resolve_operation<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    state_machine: Place,
) -> Option<(ObjectRef, OperationStrategy)> {
    let has_builder = accessor
        .type_of(state_machine)
        .is_some_and(|ty| ty.field(&conventions.builder_field).is_some());
    if has_builder {
        return resolve_via_builder_chain(accessor, conventions, state_machine)
            .map(|op| (op, OperationStrategy::BuilderChain));
    }
    if !conventions.structural_scan {
        return None;
    }
    resolve_via_structural_scan(accessor, conventions, state_machine)
        .map(|op| (op, OperationStrategy::StructuralScan))
}

/// Walks `<>t__builder` and nested `m_builder` values to the first
/// populated `m_task`.
pub fn resolve_via_builder_chain<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    state_machine: Place,
) -> Option<ObjectRef> {
    let mut builder = accessor.read_value_field(state_machine, &conventions.builder_field)?;
    for _ in 0..MAX_BUILDER_NESTING {
        if let Some(task) = accessor.read_object_field(builder, &conventions.builder_task_field) {
            return Some(task);
        }
        builder = accessor.read_value_field(builder, &conventions.sub_builder_field)?;
    }
    None
}

/// Guesses a state machine's operation from the shape of its fields.
///
/// References reachable from fields declared before the builder are hoisted
/// locals and parameters, so they are excluded. The first remaining
/// reachable reference whose type derives from the operation type wins.
/// Unusual layouts can fool this; it is a best-effort fallback for when
/// compiler-generated field names are missing.
pub fn resolve_via_structural_scan<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    state_machine: Place,
) -> Option<ObjectRef> {
    let ty = accessor.type_of(state_machine)?;
    let builder_index = ty
        .fields
        .iter()
        .position(|field| is_builder_field(accessor, conventions, state_machine, field));

    let mut excluded = Vec::new();
    if let Some(idx) = builder_index {
        for field in &ty.fields[..idx] {
            collect_references(accessor, state_machine, field, MAX_SCAN_NESTING, &mut excluded);
        }
    }
    let excluded: HashSet<u64> = excluded.into_iter().map(|r| r.address).collect();

    let mut candidates = Vec::new();
    for field in &ty.fields {
        collect_references(accessor, state_machine, field, MAX_SCAN_NESTING, &mut candidates);
    }
    candidates.into_iter().find(|candidate| {
        !excluded.contains(&candidate.address)
            && is_or_derives_from(accessor, candidate.type_id, &conventions.operation_type)
    })
}

fn is_builder_field<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    state_machine: Place,
    field: &FieldDescriptor,
) -> bool {
    if field.name == conventions.builder_field {
        return true;
    }
    field.kind == FieldKind::Value
        && accessor
            .read_value_field(state_machine, &field.name)
            .is_some_and(|value| {
                type_name(accessor, value).contains(&conventions.builder_type_marker)
            })
}

/// Pushes every object reference reachable from `field`, descending into
/// embedded values up to `depth` levels.
pub(crate) fn collect_references<A: SnapshotAccessor>(
    accessor: &A,
    place: Place,
    field: &FieldDescriptor,
    depth: usize,
    out: &mut Vec<ObjectRef>,
) {
    match field.kind {
        FieldKind::Object => out.extend(accessor.read_object_field(place, &field.name)),
        FieldKind::Value if depth > 0 => {
            let Some(value) = accessor.read_value_field(place, &field.name) else {
                return;
            };
            let Some(ty) = accessor.type_of(value) else {
                return;
            };
            for inner in &ty.fields {
                collect_references(accessor, value.into(), inner, depth - 1, out);
            }
        }
        FieldKind::Value | FieldKind::Primitive => {}
    }
}
