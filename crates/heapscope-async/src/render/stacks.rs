//! Full per-root stacks, grouped by their rendered text.

use std::collections::{BTreeMap, HashSet};

use heapscope_snapshot::{ObjectRef, SnapshotAccessor};

use super::{GroupSummary, RenderContext, Rendered};
use crate::{AsyncGraph, CancelFlag, Continuation, DumpAsyncError, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Node { id: NodeId, indent: usize },
    Terminal { target: ObjectRef, indent: usize },
}

pub(super) fn render_stacks<A: SnapshotAccessor>(
    ctx: &RenderContext<'_, A>,
    cancel: &CancelFlag,
) -> Result<Rendered, DumpAsyncError> {
    let mut groups: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();
    for root in ctx.graph.roots() {
        cancel.check()?;
        let frames = collect_frames(ctx.graph, root.id());
        if !stack_included(ctx, &frames) {
            continue;
        }

        let mut lines = Vec::new();
        lines.extend(ctx.awaiting_line(root));
        for frame in &frames {
            match *frame {
                Frame::Node { id, indent } => {
                    if let Some(node) = ctx.graph.node(id) {
                        lines.push(ctx.frame_line(node, indent));
                        lines.extend(ctx.field_lines(node, indent));
                    }
                }
                Frame::Terminal { target, indent } => {
                    lines.push(ctx.terminal_line(target, indent));
                }
            }
        }
        groups.entry(lines.join("\n")).or_default().push(root.id());
    }

    let mut ordered: Vec<(String, Vec<NodeId>)> = groups.into_iter().collect();
    ordered.sort_by_key(|(_, roots)| roots.len());

    let mut out = Rendered::default();
    for (text, roots) in ordered {
        out.lines.extend(text.lines().map(str::to_string));
        let addresses: Vec<String> = roots.iter().map(|id| format!("{:#x}", id.0)).collect();
        out.lines.push(format!("Roots: {}", addresses.join(" ")));
        out.lines.push(String::new());
        out.groups.push(GroupSummary {
            depth: 0,
            key: text,
            count: roots.len(),
            members: roots,
        });
    }
    Ok(out)
}

/// Inclusion is decided per stack: one matching frame keeps them all.
fn stack_included<A: SnapshotAccessor>(ctx: &RenderContext<'_, A>, frames: &[Frame]) -> bool {
    frames.iter().any(|frame| match frame {
        Frame::Node { id, .. } => ctx.graph.node(*id).is_some_and(|n| ctx.matches(n)),
        Frame::Terminal { .. } => false,
    })
}

/// Whether the stack hanging off `root` has any matching frame.
pub(super) fn root_included<A: SnapshotAccessor>(ctx: &RenderContext<'_, A>, root: NodeId) -> bool {
    stack_included(ctx, &collect_frames(ctx.graph, root))
}

/// Walks a root's continuations depth-first. The primary continuation stays
/// at the current indent; fan-out targets go one level deeper and come first.
fn collect_frames(graph: &AsyncGraph, root: NodeId) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut visited = HashSet::new();
    let mut pending = vec![(Continuation::Node(root), 0usize)];
    while let Some((entry, indent)) = pending.pop() {
        let id = match entry {
            Continuation::Terminal(target) => {
                frames.push(Frame::Terminal { target, indent });
                continue;
            }
            Continuation::Node(id) => id,
        };
        if !visited.insert(id) {
            continue;
        }
        let Some(node) = graph.node(id) else {
            continue;
        };
        frames.push(Frame::Node { id, indent });

        let primary = node
            .continuations
            .iter()
            .position(|c| c.node().is_some())
            .or((!node.continuations.is_empty()).then_some(0));
        if let Some(primary) = primary {
            pending.push((node.continuations[primary], indent));
        }
        for (idx, continuation) in node.continuations.iter().enumerate().rev() {
            if Some(idx) != primary {
                pending.push((*continuation, indent + 1));
            }
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::Heap;
    use crate::render::DumpAsyncOptions;
    use crate::render::tests::{dump, stacks_with};

    fn all() -> DumpAsyncOptions {
        stacks_with(DumpAsyncOptions {
            include_plain: true,
            include_completed: true,
            ..DumpAsyncOptions::default()
        })
    }

    #[test]
    fn lone_created_operation_is_one_frame() {
        let mut heap = Heap::new();
        let task = heap.plain_task(0);
        let rendered = dump(&heap.build(), all());
        assert_eq!(
            rendered.lines,
            vec![
                "[Created] System.Threading.Tasks.Task".to_string(),
                format!("Roots: {task:#x}"),
                String::new(),
            ]
        );
    }

    #[test]
    fn chain_renders_awaited_first_with_pseudo_frame() {
        let mut heap = Heap::new();
        let delay = heap.task_of("System.Threading.Tasks.Task+DelayPromise", 0);
        let inner = heap.boxed("App.Svc+<InnerAsync>d__1", 0);
        heap.awaiter(inner.state_machine, "<>u__1", delay);
        let outer = heap.boxed("App.Svc+<OuterAsync>d__0", 0);
        heap.await_continuation(inner.task, outer.task);
        let rendered = dump(&heap.build(), stacks_with(DumpAsyncOptions::default()));

        assert_eq!(
            &rendered.lines[..3],
            &[
                "awaiting System.Threading.Tasks.Task+DelayPromise",
                "[WaitingForActivation] App.Svc+<InnerAsync>d__1 (state 0)",
                "[WaitingForActivation] App.Svc+<OuterAsync>d__0 (state 0)",
            ]
        );
        assert_eq!(rendered.groups.len(), 1);
        assert_eq!(rendered.groups[0].members, vec![NodeId(inner.task)]);
    }

    #[test]
    fn fan_out_indents_before_primary_chain_continues() {
        let mut heap = Heap::new();
        let shared = heap.boxed("App.<Shared>d__0", -1);
        let first = heap.boxed("App.<First>d__0", 0);
        let second = heap.boxed("App.<Second>d__0", 0);
        let after_second = heap.boxed("App.<AfterSecond>d__0", 0);
        let after_first = heap.boxed("App.<AfterFirst>d__0", 0);
        heap.list_continuation(shared.task, &[first.task, second.task]);
        heap.await_continuation(second.task, after_second.task);
        heap.await_continuation(first.task, after_first.task);
        let rendered = dump(&heap.build(), stacks_with(DumpAsyncOptions::default()));

        assert_eq!(
            &rendered.lines[..5],
            &[
                "[WaitingForActivation] App.<Shared>d__0 (state -1)",
                "  [WaitingForActivation] App.<Second>d__0 (state 0)",
                "  [WaitingForActivation] App.<AfterSecond>d__0 (state 0)",
                "[WaitingForActivation] App.<First>d__0 (state 0)",
                "[WaitingForActivation] App.<AfterFirst>d__0 (state 0)",
            ]
        );
    }

    #[test]
    fn identical_stacks_group_and_sort_ascending() {
        let mut heap = Heap::new();
        let mut lonely = Vec::new();
        for _ in 0..2 {
            lonely.push(heap.boxed("App.<Twin>d__0", 1).task);
        }
        let solo = heap.boxed("App.<Solo>d__0", 1).task;
        let rendered = dump(&heap.build(), stacks_with(DumpAsyncOptions::default()));

        let counts: Vec<_> = rendered.groups.iter().map(|g| g.count).collect();
        assert_eq!(counts, vec![1, 2]);
        assert_eq!(rendered.groups[0].members, vec![NodeId(solo)]);
        let twin_roots = format!("Roots: {:#x} {:#x}", lonely[0], lonely[1]);
        assert!(rendered.lines.contains(&twin_roots));
        // Conservation: every included root lands in exactly one group.
        assert_eq!(counts.iter().sum::<usize>(), 3);
    }

    #[test]
    fn substring_filter_keeps_whole_matching_stacks() {
        let mut heap = Heap::new();
        let leaf = heap.boxed("App.<Leaf>d__0", 0);
        let middle = heap.boxed("App.<Middle>d__0", 0);
        let foo = heap.boxed("App.<FooAsync>d__0", 0);
        heap.await_continuation(leaf.task, middle.task);
        heap.await_continuation(middle.task, foo.task);
        let other = heap.boxed("App.<Unrelated>d__0", 0);
        let other_caller = heap.boxed("App.<UnrelatedCaller>d__0", 0);
        heap.await_continuation(other.task, other_caller.task);

        let rendered = dump(
            &heap.build(),
            stacks_with(DumpAsyncOptions {
                type_substring: Some("Foo".to_string()),
                ..DumpAsyncOptions::default()
            }),
        );
        assert_eq!(rendered.groups.len(), 1);
        assert_eq!(rendered.groups[0].members, vec![NodeId(leaf.task)]);
        let text = rendered.lines.join("\n");
        assert!(text.contains("App.<Leaf>d__0"));
        assert!(text.contains("App.<Middle>d__0"));
        assert!(!text.contains("Unrelated"));
    }

    #[test]
    fn terminal_and_annotations_render() {
        let mut heap = Heap::new();
        let inner = heap.boxed("App.<Inner>d__0", -1);
        let callback = heap.b.object("App.Callback");
        heap.action_continuation(inner.task, callback);
        let wrapper = heap.joinable(inner.task, 0x10);
        heap.joiner("App.<Joiner>d__0", -1, wrapper);
        heap.b.thread(
            0x44,
            &[(crate::fixtures::JOINABLE, "CompleteOnCurrentThread")],
            &[wrapper],
        );
        let rendered = dump(&heap.build(), stacks_with(DumpAsyncOptions::default()));
        assert_eq!(
            &rendered.lines[..3],
            &[
                "[WaitingForActivation] App.<Inner>d__0 (state -1) [blocks thread 0x44] (+1 joiners)",
                "  [continuation] App.Callback",
                "[WaitingForActivation] App.<Joiner>d__0 (state -1)",
            ]
        );
    }

    #[test]
    fn cycle_renders_finitely() {
        let mut heap = Heap::new();
        let a = heap.boxed("App.<A>d__0", -1);
        let b = heap.boxed("App.<B>d__0", -1);
        heap.await_continuation(a.task, b.task);
        heap.await_continuation(b.task, a.task);
        let rendered = dump(&heap.build(), stacks_with(DumpAsyncOptions::default()));
        assert_eq!(rendered.groups.len(), 1);
        assert_eq!(
            &rendered.lines[..3],
            &[
                "[WaitingForActivation] App.<A>d__0 (state -1)",
                "[WaitingForActivation] App.<B>d__0 (state -1)",
                "[continuation] App.<A>d__0",
            ]
        );
    }
}
