//! Synchronous-blocking annotation.
//!
//! A thread sitting in the joinable wrapper's synchronous join routine is
//! blocked on whatever operation that wrapper holds. We look for the routine
//! near the top of each live stack, then for a wrapper rooted on that stack
//! whose state says it is blocking.

use heapscope_snapshot::{ObjectRef, SnapshotAccessor, ThreadHandle, is_or_derives_from};
use tracing::{debug, trace};

use crate::{AsyncGraph, BlockingInfo, CancelFlag, DumpAsyncError, NodeId, RuntimeConventions};

pub(crate) fn annotate_blocking<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    graph: &mut AsyncGraph,
    cancel: &CancelFlag,
) -> Result<(), DumpAsyncError> {
    for thread in accessor.enumerate_live_threads() {
        cancel.check()?;
        if !is_joining(accessor, conventions, thread) {
            continue;
        }
        let Some(wrapper) = blocking_wrapper(accessor, conventions, thread) else {
            trace!(
                os_thread_id = thread.os_thread_id,
                "thread is joining but no blocking wrapper is rooted"
            );
            continue;
        };
        let Some(task) = accessor.read_object_field(wrapper, &conventions.joinable_wrapped_field)
        else {
            continue;
        };
        let Some(node) = graph.nodes.get_mut(&NodeId::from(task)) else {
            continue;
        };
        // First thread wins.
        if node.blocking.is_some() {
            continue;
        }
        node.blocking = Some(BlockingInfo {
            os_thread_id: thread.os_thread_id,
            wrapper,
        });
        graph.stats.blocked_nodes += 1;
        debug!(
            os_thread_id = thread.os_thread_id,
            node = %NodeId::from(task),
            "thread synchronously blocked on operation"
        );
    }
    Ok(())
}

fn is_joining<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    thread: ThreadHandle,
) -> bool {
    accessor
        .enumerate_stack_frames(thread)
        .take(conventions.max_stack_frames)
        .any(|frame| {
            frame.method_name == conventions.sync_join_method
                && frame.owning_type_name == conventions.joinable_type
        })
}

fn blocking_wrapper<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    thread: ThreadHandle,
) -> Option<ObjectRef> {
    accessor.enumerate_stack_roots(thread).find(|root| {
        is_or_derives_from(accessor, root.type_id, &conventions.joinable_type)
            && accessor
                .read_primitive_field::<u32>(*root, &conventions.joinable_state_field)
                .is_some_and(|state| state & conventions.joinable_blocking_mask != 0)
    })
}
