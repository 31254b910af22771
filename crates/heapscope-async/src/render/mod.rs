//! Text projections of a finished graph: per-type statistics, a coalesced
//! prefix tree, and full per-root stacks.

use std::collections::HashMap;
use std::fmt;

use facet::Facet;
use heapscope_snapshot::{ObjectRef, SnapshotAccessor};
use tracing::debug;

use crate::harvest::type_name;
use crate::{AsyncGraph, AsyncNode, CancelFlag, DumpAsyncError, NodeId, RuntimeConventions, awaiter};

mod coalesce;
mod fields;
mod stacks;
mod stats;

// ── Options ─────────────────────────────────────────────────────

#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[facet(rename_all = "snake_case")]
#[repr(u8)]
pub enum RenderMode {
    /// Count of matching nodes per description.
    Stats,
    /// Stacks merged on common prefixes.
    Coalesced,
    /// Every distinct stack, grouped by rendered text.
    #[default]
    FullStacks,
}

/// What to render and which nodes to consider.
#[derive(Facet, Debug, Clone, Default)]
pub struct DumpAsyncOptions {
    #[facet(default)]
    pub mode: RenderMode,
    /// Only the node at this address (or driven by a state machine there).
    #[facet(default)]
    pub address: Option<u64>,
    /// Only nodes whose type handle is this method table.
    #[facet(default)]
    pub method_table: Option<u64>,
    /// Only nodes whose description or type name contains this.
    #[facet(default)]
    pub type_substring: Option<String>,
    /// Consider operations with no state machine behind them.
    #[facet(default)]
    pub include_plain: bool,
    /// Consider operations that already finished.
    #[facet(default)]
    pub include_completed: bool,
    /// Dump the fields of each rendered frame.
    #[facet(default)]
    pub show_fields: bool,
}

// ── Output ──────────────────────────────────────────────────────

/// One output group: a stats row, a coalesced branch, or a distinct stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSummary {
    /// Tree level for coalesced output; `0` otherwise.
    pub depth: usize,
    pub key: String,
    pub count: usize,
    pub members: Vec<NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rendered {
    pub lines: Vec<String>,
    pub groups: Vec<GroupSummary>,
}

impl fmt::Display for Rendered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

// ── Shared rendering state ──────────────────────────────────────

pub(crate) struct RenderContext<'a, A> {
    accessor: &'a A,
    conventions: &'a RuntimeConventions,
    graph: &'a AsyncGraph,
    options: &'a DumpAsyncOptions,
    descriptions: HashMap<NodeId, String>,
}

impl<'a, A: SnapshotAccessor> RenderContext<'a, A> {
    fn new(
        accessor: &'a A,
        conventions: &'a RuntimeConventions,
        graph: &'a AsyncGraph,
        options: &'a DumpAsyncOptions,
    ) -> Self {
        let descriptions = graph
            .nodes
            .values()
            .map(|node| (node.id(), describe(accessor, conventions, node)))
            .collect();
        Self {
            accessor,
            conventions,
            graph,
            options,
            descriptions,
        }
    }

    fn description(&self, id: NodeId) -> &str {
        self.descriptions.get(&id).map_or("", String::as_str)
    }

    /// The per-node inclusion predicate.
    fn matches(&self, node: &AsyncNode) -> bool {
        let options = self.options;
        if !options.include_plain && !node.is_state_machine() {
            return false;
        }
        if !options.include_completed && node.status.is_completed() {
            return false;
        }
        if let Some(address) = options.address {
            let on_state_machine = node.state_machine.is_some_and(|sm| sm.address() == address);
            if node.identity.address != address && !on_state_machine {
                return false;
            }
        }
        if let Some(method_table) = options.method_table {
            let on_state_machine = node
                .state_machine
                .is_some_and(|sm| sm.type_id().0 == method_table);
            if node.identity.type_id.0 != method_table && !on_state_machine {
                return false;
            }
        }
        if let Some(needle) = &options.type_substring {
            if !self.description(node.id()).contains(needle.as_str())
                && !type_name(self.accessor, node.identity).contains(needle.as_str())
            {
                return false;
            }
        }
        true
    }

    fn frame_line(&self, node: &AsyncNode, indent: usize) -> String {
        let mut line = format!(
            "{}[{}] {}",
            pad(indent),
            node.status,
            self.description(node.id())
        );
        if let Some(state) = node.await_state.filter(|_| node.is_state_machine()) {
            line.push_str(&format!(" (state {state})"));
        }
        if let Some(blocking) = node.blocking {
            line.push_str(&format!(" [blocks thread {:#x}]", blocking.os_thread_id));
        }
        if node.dependents > 0 {
            line.push_str(&format!(" (+{} joiners)", node.dependents));
        }
        line
    }

    fn terminal_line(&self, target: ObjectRef, indent: usize) -> String {
        format!(
            "{}[continuation] {}",
            pad(indent),
            unwrap_box_type(
                type_name(self.accessor, target),
                &self.conventions.box_type_marker
            )
        )
    }

    /// Pseudo-frame naming what a suspended root is waiting on.
    fn awaiting_line(&self, node: &AsyncNode) -> Option<String> {
        if !node.is_suspended() {
            return None;
        }
        let found = awaiter::awaited(
            self.accessor,
            self.conventions,
            node.state_machine?,
            node.await_state,
        )?;
        Some(format!("awaiting {}", found.type_name))
    }

    /// Field dump lines for a node, when asked for.
    fn field_lines(&self, node: &AsyncNode, indent: usize) -> Vec<String> {
        if !self.options.show_fields {
            return Vec::new();
        }
        let place = node.state_machine.unwrap_or(node.identity.into());
        fields::field_lines(self.accessor, place, indent + 1)
    }
}

fn pad(indent: usize) -> String {
    "  ".repeat(indent)
}

// ── Descriptions ────────────────────────────────────────────────

/// One-line description of a node: the state machine type for boxes, the
/// operation type plus its delegate method for plain operations.
pub fn describe<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    node: &AsyncNode,
) -> String {
    if node.is_state_machine() {
        return match node.state_machine {
            Some(state_machine) => type_name(accessor, state_machine).to_string(),
            None => unwrap_box_type(
                type_name(accessor, node.identity),
                &conventions.box_type_marker,
            )
            .to_string(),
        };
    }
    let name = type_name(accessor, node.identity);
    match delegate_method(accessor, conventions, node.identity) {
        Some(method) => format!("{name} ({method})"),
        None => name.to_string(),
    }
}

fn delegate_method<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    operation: ObjectRef,
) -> Option<String> {
    let action = accessor.read_object_field(operation, &conventions.action_field)?;
    conventions
        .delegate_method_fields
        .iter()
        .filter_map(|field| accessor.read_primitive_field::<u64>(action, field))
        .filter(|code| *code != 0)
        .find_map(|code| accessor.method_at(code))
        .map(|(owner, method)| format!("{}.{}", owner.name, method.name))
}

/// The state machine type argument of a box type name, without its assembly
/// qualifier: `...AsyncStateMachineBox`1[[Result],[App.<Run>d__0, App]]`
/// gives `App.<Run>d__0`.
pub fn unwrap_box_type<'a>(name: &'a str, marker: &str) -> &'a str {
    let Some(args) = name
        .find(marker)
        .and_then(|at| name[at..].find('[').map(|open| &name[at + open..]))
    else {
        return name;
    };

    let mut depth = 0usize;
    let mut arg_start = None;
    let mut last = None;
    for (idx, ch) in args.char_indices() {
        match ch {
            '[' => {
                depth += 1;
                if depth == 2 {
                    arg_start = Some(idx + 1);
                }
            }
            ']' => {
                if depth == 2 {
                    last = arg_start.map(|start| &args[start..idx]);
                }
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    break;
                }
            }
            _ => {}
        }
    }
    last.map_or(name, strip_assembly)
}

fn strip_assembly(arg: &str) -> &str {
    let mut depth = 0usize;
    for (idx, ch) in arg.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => return arg[..idx].trim(),
            _ => {}
        }
    }
    arg.trim()
}

// ── Entry points ────────────────────────────────────────────────

/// Renders an already built graph.
pub fn render<A: SnapshotAccessor>(
    accessor: &A,
    conventions: &RuntimeConventions,
    graph: &AsyncGraph,
    options: &DumpAsyncOptions,
    cancel: &CancelFlag,
) -> Result<Rendered, DumpAsyncError> {
    let ctx = RenderContext::new(accessor, conventions, graph, options);
    let rendered = match options.mode {
        RenderMode::Stats => stats::render_stats(&ctx),
        RenderMode::Coalesced => coalesce::render_coalesced(&ctx, cancel)?,
        RenderMode::FullStacks => stacks::render_stacks(&ctx, cancel)?,
    };
    debug!(
        mode = ?options.mode,
        groups = rendered.groups.len(),
        lines = rendered.lines.len(),
        "rendered async graph"
    );
    Ok(rendered)
}

/// Builds the graph for `accessor` and renders it.
pub fn dump_async<A: SnapshotAccessor>(
    accessor: &A,
    options: &DumpAsyncOptions,
    conventions: &RuntimeConventions,
    cancel: &CancelFlag,
) -> Result<Rendered, DumpAsyncError> {
    let graph = AsyncGraph::build(accessor, conventions, cancel)?;
    render(accessor, conventions, &graph, options, cancel)
}

#[cfg(test)]
pub(crate) mod tests {
    use heapscope_snapshot::MemorySnapshot;

    use super::*;
    use crate::fixtures::Heap;
    use crate::node::{TASK_STATE_RAN_TO_COMPLETION, TASK_STATE_WAITING_FOR_ACTIVATION};

    pub(crate) fn dump(snapshot: &MemorySnapshot, options: DumpAsyncOptions) -> Rendered {
        dump_async(
            snapshot,
            &options,
            &RuntimeConventions::default(),
            &CancelFlag::new(),
        )
        .unwrap()
    }

    pub(crate) fn stacks_with(options: DumpAsyncOptions) -> DumpAsyncOptions {
        DumpAsyncOptions {
            mode: RenderMode::FullStacks,
            ..options
        }
    }

    #[test]
    fn box_type_arguments_unwrap() {
        let marker = "AsyncStateMachineBox";
        assert_eq!(
            unwrap_box_type(
                "System.Runtime.CompilerServices.AsyncTaskMethodBuilder`1+AsyncStateMachineBox`1\
                 [[System.Threading.Tasks.VoidTaskResult, System.Private.CoreLib],\
                 [App.Svc+<RunAsync>d__2, App]]",
                marker
            ),
            "App.Svc+<RunAsync>d__2"
        );
        assert_eq!(
            unwrap_box_type(
                "X+AsyncStateMachineBox`1[[System.Int32],[App.Gen`1+<Go>d__0[[System.String]]]]",
                marker
            ),
            "App.Gen`1+<Go>d__0[[System.String]]"
        );
        assert_eq!(unwrap_box_type("App.Plain", marker), "App.Plain");
    }

    #[test]
    fn plain_description_names_delegate_method() {
        let mut heap = Heap::new();
        let task = heap.delegate_task("App.Jobs", "Crunch", 0);
        let snapshot = heap.build();
        let graph =
            AsyncGraph::build(&snapshot, &RuntimeConventions::default(), &CancelFlag::new())
                .unwrap();
        assert_eq!(
            describe(
                &snapshot,
                &RuntimeConventions::default(),
                &graph.nodes[&NodeId(task)]
            ),
            "System.Threading.Tasks.Task (App.Jobs.Crunch)"
        );
    }

    #[test]
    fn plain_and_completed_operations_are_opt_in() {
        let mut heap = Heap::new();
        heap.plain_task(TASK_STATE_WAITING_FOR_ACTIVATION);
        heap.task_of("App.Done", TASK_STATE_RAN_TO_COMPLETION);
        heap.boxed("App.<Live>d__0", 0);
        let snapshot = heap.build();

        let default = dump(&snapshot, DumpAsyncOptions::default());
        assert_eq!(default.groups.len(), 1);
        assert!(default.lines[0].contains("App.<Live>d__0"));

        let with_plain = dump(
            &snapshot,
            DumpAsyncOptions {
                include_plain: true,
                ..DumpAsyncOptions::default()
            },
        );
        assert_eq!(with_plain.groups.len(), 2);

        let everything = dump(
            &snapshot,
            DumpAsyncOptions {
                include_plain: true,
                include_completed: true,
                ..DumpAsyncOptions::default()
            },
        );
        assert_eq!(everything.groups.len(), 3);
    }

    #[test]
    fn address_and_method_table_filters() {
        let mut heap = Heap::new();
        let a = heap.boxed("App.<A>d__0", 0);
        let b = heap.boxed("App.<B>d__0", 0);
        let snapshot = heap.build();
        let b_type = snapshot.object(b.task).unwrap().type_id.0;

        let by_address = dump(
            &snapshot,
            DumpAsyncOptions {
                address: Some(a.task),
                ..DumpAsyncOptions::default()
            },
        );
        assert_eq!(by_address.groups.len(), 1);
        assert_eq!(by_address.groups[0].members, vec![NodeId(a.task)]);

        let by_state_machine = dump(
            &snapshot,
            DumpAsyncOptions {
                address: Some(b.state_machine),
                ..DumpAsyncOptions::default()
            },
        );
        assert_eq!(by_state_machine.groups[0].members, vec![NodeId(b.task)]);

        let by_mt = dump(
            &snapshot,
            DumpAsyncOptions {
                method_table: Some(b_type),
                ..DumpAsyncOptions::default()
            },
        );
        assert_eq!(by_mt.groups.len(), 1);
        assert_eq!(by_mt.groups[0].members, vec![NodeId(b.task)]);
    }

    #[test]
    fn field_dump_lists_state_machine_fields() {
        let mut heap = Heap::new();
        let boxed = heap.boxed("App.<Fields>d__0", 5);
        heap.b.set_i32(boxed.state_machine, "count", 42);
        let snapshot = heap.build();
        let rendered = dump(
            &snapshot,
            stacks_with(DumpAsyncOptions {
                show_fields: true,
                ..DumpAsyncOptions::default()
            }),
        );
        assert!(rendered.lines.iter().any(|l| l.trim() == "<>1__state = 5"));
        assert!(rendered.lines.iter().any(|l| l.trim() == "count = 42"));
    }
}
