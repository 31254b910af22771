//! Reconstructed async operations and their continuation links.

use std::fmt;

use facet::Facet;
use heapscope_snapshot::{ObjectRef, Place};

// ── Identity ────────────────────────────────────────────────────

/// Address of the operation object a node was built from.
///
/// Unique within one run; `Ord` gives the graph deterministic iteration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

impl From<ObjectRef> for NodeId {
    fn from(value: ObjectRef) -> Self {
        Self(value.address)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

// ── Classification ──────────────────────────────────────────────

#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeKind {
    /// A bare operation with no compiler-generated state machine behind it.
    PlainOperation,
    /// An operation driven by a compiler-generated async state machine.
    StateMachineBox,
}

// Status bits, from the runtime's task implementation.
pub const TASK_STATE_STARTED: u32 = 0x0001_0000;
pub const TASK_STATE_DELEGATE_INVOKED: u32 = 0x0002_0000;
pub const TASK_STATE_FAULTED: u32 = 0x0020_0000;
pub const TASK_STATE_CANCELED: u32 = 0x0040_0000;
pub const TASK_STATE_WAITING_ON_CHILDREN: u32 = 0x0080_0000;
pub const TASK_STATE_RAN_TO_COMPLETION: u32 = 0x0100_0000;
pub const TASK_STATE_WAITING_FOR_ACTIVATION: u32 = 0x0200_0000;

/// Decoded operation status.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TaskStatus {
    Created,
    WaitingForActivation,
    WaitingToRun,
    Running,
    WaitingForChildren,
    RanToCompletion,
    Canceled,
    Faulted,
    /// Non-zero flags with none of the status bits set.
    Unknown,
}

impl TaskStatus {
    /// First matching bit wins, most final state first.
    pub fn from_flags(flags: u32) -> Self {
        const PRIORITY: [(u32, TaskStatus); 7] = [
            (TASK_STATE_FAULTED, TaskStatus::Faulted),
            (TASK_STATE_CANCELED, TaskStatus::Canceled),
            (TASK_STATE_RAN_TO_COMPLETION, TaskStatus::RanToCompletion),
            (TASK_STATE_WAITING_ON_CHILDREN, TaskStatus::WaitingForChildren),
            (TASK_STATE_DELEGATE_INVOKED, TaskStatus::Running),
            (TASK_STATE_STARTED, TaskStatus::WaitingToRun),
            (
                TASK_STATE_WAITING_FOR_ACTIVATION,
                TaskStatus::WaitingForActivation,
            ),
        ];
        if flags == 0 {
            return Self::Created;
        }
        PRIORITY
            .iter()
            .find(|(bit, _)| flags & bit != 0)
            .map_or(Self::Unknown, |(_, status)| *status)
    }

    pub fn is_completed(self) -> bool {
        matches!(self, Self::RanToCompletion | Self::Canceled | Self::Faulted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::WaitingForActivation => "WaitingForActivation",
            Self::WaitingToRun => "WaitingToRun",
            Self::Running => "Running",
            Self::WaitingForChildren => "WaitingForChildren",
            Self::RanToCompletion => "RanToCompletion",
            Self::Canceled => "Canceled",
            Self::Faulted => "Faulted",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Edges and annotations ───────────────────────────────────────

/// One resolved "what runs next" target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Continuation {
    /// Continues into another harvested node.
    Node(NodeId),
    /// Continues into something that is not a tracked operation; rendered
    /// as a plain frame.
    Terminal(ObjectRef),
}

impl Continuation {
    pub fn node(self) -> Option<NodeId> {
        match self {
            Self::Node(id) => Some(id),
            Self::Terminal(_) => None,
        }
    }
}

/// A thread that is synchronously blocked on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockingInfo {
    pub os_thread_id: u32,
    pub wrapper: ObjectRef,
}

// ── The node record ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AsyncNode {
    pub identity: ObjectRef,
    pub kind: NodeKind,
    pub status_flags: u32,
    pub status: TaskStatus,
    /// The state machine driving this node, for `StateMachineBox` nodes.
    pub state_machine: Option<Place>,
    /// `-1` while running, otherwise the await point it is suspended at.
    pub await_state: Option<i32>,
    /// Resumption routine entry point; diagnostic only.
    pub code_address: Option<u64>,
    /// Resolved continuations in discovery order. `next` is the first node.
    pub continuations: Vec<Continuation>,
    pub previous: Option<NodeId>,
    /// A predecessor claim demoted during conflict or cycle resolution.
    pub alternate_previous: Option<NodeId>,
    pub top_level: bool,
    pub depth: Option<u32>,
    /// Nodes linked to this one through a joinable wrapper.
    pub dependents: u32,
    pub blocking: Option<BlockingInfo>,
}

impl AsyncNode {
    pub fn plain(identity: ObjectRef, status_flags: u32) -> Self {
        Self {
            identity,
            kind: NodeKind::PlainOperation,
            status_flags,
            status: TaskStatus::from_flags(status_flags),
            state_machine: None,
            await_state: None,
            code_address: None,
            continuations: Vec::new(),
            previous: None,
            alternate_previous: None,
            top_level: true,
            depth: None,
            dependents: 0,
            blocking: None,
        }
    }

    pub fn id(&self) -> NodeId {
        NodeId::from(self.identity)
    }

    pub fn is_state_machine(&self) -> bool {
        self.kind == NodeKind::StateMachineBox
    }

    /// The canonical successor.
    pub fn next(&self) -> Option<NodeId> {
        self.continuations.iter().find_map(|c| c.node())
    }

    pub fn node_continuations(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.continuations.iter().filter_map(|c| c.node())
    }

    /// Whether the state machine is parked at an await point.
    pub fn is_suspended(&self) -> bool {
        self.await_state.is_some_and(|state| state >= 0)
    }
}
