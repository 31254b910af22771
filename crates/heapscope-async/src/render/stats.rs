use std::collections::BTreeMap;

use heapscope_snapshot::SnapshotAccessor;

use super::{GroupSummary, RenderContext, Rendered};
use crate::{NodeId, TaskStatus};

struct Row {
    method_table: u64,
    members: Vec<NodeId>,
    statuses: BTreeMap<TaskStatus, usize>,
}

pub(super) fn render_stats<A: SnapshotAccessor>(ctx: &RenderContext<'_, A>) -> Rendered {
    let mut rows: BTreeMap<&str, Row> = BTreeMap::new();
    let mut statuses: BTreeMap<TaskStatus, usize> = BTreeMap::new();
    for node in ctx.graph.nodes.values().filter(|node| ctx.matches(node)) {
        let row = rows
            .entry(ctx.description(node.id()))
            .or_insert_with(|| Row {
                method_table: node.identity.type_id.0,
                members: Vec::new(),
                statuses: BTreeMap::new(),
            });
        row.members.push(node.id());
        *row.statuses.entry(node.status).or_default() += 1;
        *statuses.entry(node.status).or_default() += 1;
    }

    let mut ordered: Vec<(&str, Row)> = rows.into_iter().collect();
    // Already sorted by description; stable sort keeps that as the tie-break.
    ordered.sort_by(|a, b| b.1.members.len().cmp(&a.1.members.len()));

    let mut out = Rendered::default();
    out.lines
        .push(format!("{:<18} {:>6} {}", "MT", "Count", "Type"));
    let mut total = 0;
    for (description, row) in ordered {
        let count = row.members.len();
        total += count;
        out.lines.push(format!(
            "{:#018x} {:>6} {}",
            row.method_table, count, description
        ));
        for (status, count) in &row.statuses {
            out.lines.push(format!("    {status}: {count}"));
        }
        out.groups.push(GroupSummary {
            depth: 0,
            key: description.to_string(),
            count,
            members: row.members,
        });
    }
    out.lines.push(format!("Total: {total}"));

    out.lines.push(String::new());
    out.lines.push("Status summary:".to_string());
    for (status, count) in statuses {
        out.lines.push(format!("  {status}: {count}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use crate::fixtures::Heap;
    use crate::node::TASK_STATE_RAN_TO_COMPLETION;
    use crate::render::tests::dump;
    use crate::render::{DumpAsyncOptions, RenderMode};

    fn stats(options: DumpAsyncOptions) -> DumpAsyncOptions {
        DumpAsyncOptions {
            mode: RenderMode::Stats,
            ..options
        }
    }

    #[test]
    fn rows_sort_by_count_then_description() {
        let mut heap = Heap::new();
        heap.boxed("App.<Zed>d__0", 0);
        heap.boxed("App.<Alpha>d__0", 0);
        for _ in 0..3 {
            heap.boxed("App.<Busy>d__0", 1);
        }
        heap.plain_task(0);
        let snapshot = heap.build();
        let rendered = dump(&snapshot, stats(DumpAsyncOptions::default()));

        let keys: Vec<_> = rendered.groups.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, vec!["App.<Busy>d__0", "App.<Alpha>d__0", "App.<Zed>d__0"]);
        assert_eq!(rendered.groups[0].count, 3);
        assert!(rendered.lines[1].ends_with("     3 App.<Busy>d__0"));
        assert!(rendered.lines[1].starts_with("0x"));
        assert_eq!(rendered.lines[2], "    WaitingForActivation: 3");
        assert!(rendered.lines.iter().any(|l| l == "Total: 5"));
        assert!(
            rendered
                .lines
                .iter()
                .any(|l| l == "  WaitingForActivation: 5")
        );
    }

    #[test]
    fn counts_add_up_to_matching_nodes() {
        let mut heap = Heap::new();
        let done = heap.task_of("App.Finished", TASK_STATE_RAN_TO_COMPLETION);
        let live = heap.boxed("App.<Live>d__0", 0);
        heap.await_continuation(done, live.task);
        heap.plain_task(0);
        let snapshot = heap.build();

        let options = stats(DumpAsyncOptions {
            include_plain: true,
            include_completed: true,
            ..DumpAsyncOptions::default()
        });
        let rendered = dump(&snapshot, options);
        let total: usize = rendered.groups.iter().map(|g| g.count).sum();
        // Every node matches, chained or not.
        assert_eq!(total, 3);
        assert!(rendered.lines.iter().any(|l| l == "  RanToCompletion: 1"));
        assert!(rendered.lines.iter().any(|l| l == "  Created: 1"));
    }

    #[test]
    fn rows_break_down_by_status() {
        let mut heap = Heap::new();
        let done = heap.task_of("App.Job", TASK_STATE_RAN_TO_COMPLETION);
        let waiting = heap.task_of("App.Job", 0);
        heap.task_of("App.Job", 0);
        let snapshot = heap.build();
        let options = stats(DumpAsyncOptions {
            include_plain: true,
            include_completed: true,
            ..DumpAsyncOptions::default()
        });
        let rendered = dump(&snapshot, options);

        assert_eq!(rendered.groups.len(), 1);
        assert_eq!(rendered.groups[0].members.len(), 3);
        assert!(rendered.groups[0].members.contains(&crate::NodeId(done)));
        assert!(rendered.groups[0].members.contains(&crate::NodeId(waiting)));
        assert!(rendered.lines[1].ends_with("     3 App.Job"));
        assert_eq!(rendered.lines[2], "    Created: 2");
        assert_eq!(rendered.lines[3], "    RanToCompletion: 1");
        assert_eq!(rendered.lines[4], "Total: 3");
    }
}
