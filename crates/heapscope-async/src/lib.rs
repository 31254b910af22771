//! Async continuation graph reconstruction over a managed-heap snapshot.
//!
//! The heap never stores async call stacks. What it has is operation
//! objects whose continuation slots point, through delegates, runners,
//! wrappers and lists, at whatever runs next. [`AsyncGraph::build`] finds
//! every live operation, resolves those slots into edges, adds joinable
//! wrapper edges and blocking annotations, then normalizes the result into
//! a forest. [`render`] turns the forest into statistics, a coalesced tree,
//! or full stacks.
//!
//! Everything matched by name comes from [`RuntimeConventions`].

mod awaiter;
mod blocking;
mod cancel;
mod conventions;
mod error;
mod graph;
mod harvest;
mod link;
mod node;
mod normalize;
mod render;
mod resolve;

#[cfg(test)]
mod fixtures;

pub use awaiter::{Awaited, awaited, awaiter_field};
pub use cancel::CancelFlag;
pub use conventions::RuntimeConventions;
pub use error::DumpAsyncError;
pub use graph::{AsyncGraph, GraphStats};
pub use harvest::{
    OperationStrategy, resolve_operation, resolve_via_builder_chain, resolve_via_structural_scan,
};
pub use node::{
    AsyncNode, BlockingInfo, Continuation, NodeId, NodeKind, TASK_STATE_CANCELED,
    TASK_STATE_DELEGATE_INVOKED, TASK_STATE_FAULTED, TASK_STATE_RAN_TO_COMPLETION,
    TASK_STATE_STARTED, TASK_STATE_WAITING_FOR_ACTIVATION, TASK_STATE_WAITING_ON_CHILDREN,
    TaskStatus,
};
pub use render::{
    DumpAsyncOptions, GroupSummary, RenderMode, Rendered, describe, dump_async, render,
    unwrap_box_type,
};
pub use resolve::{ContinuationPath, continuation_target, resolve_continuations};
