//! Which awaiter slot a suspended state machine is parked on.
//!
//! The compiler reuses `<>u__N` awaiter fields across await points, so the
//! field for the current suspension cannot be told apart by name. With await
//! state `0`, or a single slot, the first slot is taken. Otherwise the first
//! slot whose backing bytes are not all zero wins, since a consumed awaiter
//! is cleared. A live awaiter that happens to be all zero is misread; this is
//! an accepted approximation.

use heapscope_snapshot::{FieldDescriptor, FieldKind, ObjectRef, Place, SnapshotAccessor};

use crate::RuntimeConventions;
use crate::harvest::type_name;

/// What a suspended state machine is waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Awaited {
    /// The awaiter field the guess landed on.
    pub field: String,
    /// Type of the awaited operation, or of the awaiter itself when it holds
    /// no operation.
    pub type_name: String,
    pub operation: Option<ObjectRef>,
}

pub fn awaiter_field<'a, A: SnapshotAccessor>(
    accessor: &'a A,
    conventions: &RuntimeConventions,
    state_machine: Place,
    await_state: Option<i32>,
) -> Option<&'a FieldDescriptor> {
    let ty = accessor.type_of(state_machine)?;
    let slots: Vec<&FieldDescriptor> = ty
        .fields
        .iter()
        .filter(|field| field.name.starts_with(&conventions.awaiter_field_prefix))
        .collect();
    if await_state == Some(0) || slots.len() == 1 {
        return slots.first().copied();
    }
    slots.into_iter().find(|field| {
        accessor
            .read_field_bytes(state_machine, &field.name)
            .is_some_and(|bytes| bytes.iter().any(|b| *b != 0))
    })
}

pub fn awaited<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    state_machine: Place,
    await_state: Option<i32>,
) -> Option<Awaited> {
    let field = awaiter_field(accessor, conventions, state_machine, await_state)?;
    let awaiter: Place = match field.kind {
        FieldKind::Object => accessor.read_object_field(state_machine, &field.name)?.into(),
        FieldKind::Value => accessor.read_value_field(state_machine, &field.name)?.into(),
        FieldKind::Primitive => return None,
    };
    let operation = accessor.read_object_field(awaiter, &conventions.awaiter_operation_field);
    let name = match operation {
        Some(operation) => type_name(accessor, operation),
        None => type_name(accessor, awaiter),
    };
    Some(Awaited {
        field: field.name.clone(),
        type_name: name.to_string(),
        operation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{Heap, TASK_AWAITER};

    fn awaited_in(heap: Heap, boxed_task: u64, await_state: i32) -> Option<Awaited> {
        let snapshot = heap.build();
        let task = snapshot.object(boxed_task)?;
        let state_machine = snapshot.read_value_field(task, "StateMachine")?;
        awaited(
            &snapshot,
            &RuntimeConventions::default(),
            state_machine.into(),
            Some(await_state),
        )
    }

    #[test]
    fn state_zero_takes_first_slot_even_when_cleared() {
        let mut heap = Heap::new();
        let boxed = heap.boxed("App.<Two>d__0", 0);
        let target = heap.task_of("App.Delay", 0);
        heap.awaiter(boxed.state_machine, "<>u__1", 0);
        heap.awaiter(boxed.state_machine, "<>u__2", target);
        let found = awaited_in(heap, boxed.task, 0).unwrap();
        assert_eq!(found.field, "<>u__1");
        assert_eq!(found.operation, None);
        assert_eq!(found.type_name, TASK_AWAITER);
    }

    #[test]
    fn later_state_takes_first_populated_slot() {
        let mut heap = Heap::new();
        let boxed = heap.boxed("App.<Two>d__0", 1);
        let target = heap.task_of("App.Delay", 0);
        heap.awaiter(boxed.state_machine, "<>u__1", 0);
        heap.awaiter(boxed.state_machine, "<>u__2", target);
        let found = awaited_in(heap, boxed.task, 1).unwrap();
        assert_eq!(found.field, "<>u__2");
        assert_eq!(found.type_name, "App.Delay");
        assert_eq!(found.operation.map(|o| o.address), Some(target));
    }

    #[test]
    fn single_slot_is_used_directly() {
        let mut heap = Heap::new();
        let boxed = heap.boxed("App.<One>d__0", 3);
        heap.awaiter(boxed.state_machine, "<>u__1", 0);
        let found = awaited_in(heap, boxed.task, 3).unwrap();
        assert_eq!(found.field, "<>u__1");
    }

    #[test]
    fn no_populated_slot_means_nothing_to_show() {
        let mut heap = Heap::new();
        let boxed = heap.boxed("App.<Two>d__0", 2);
        heap.awaiter(boxed.state_machine, "<>u__1", 0);
        heap.awaiter(boxed.state_machine, "<>u__2", 0);
        assert_eq!(awaited_in(heap, boxed.task, 2), None);
    }
}
