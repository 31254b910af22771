//! Coalesced prefix tree: stacks that start the same way share lines.

use std::collections::{BTreeMap, HashSet};

use heapscope_snapshot::SnapshotAccessor;

use super::{GroupSummary, RenderContext, Rendered, pad, stacks};
use crate::{CancelFlag, DumpAsyncError, NodeId};

/// Siblings with the same description (and, for state machines, the same
/// await state) merge into one branch.
type BranchKey = (String, Option<i32>);

struct Branch {
    depth: usize,
    description: String,
    members: Vec<NodeId>,
}

pub(super) fn render_coalesced<A: SnapshotAccessor>(
    ctx: &RenderContext<'_, A>,
    cancel: &CancelFlag,
) -> Result<Rendered, DumpAsyncError> {
    let starts: Vec<NodeId> = ctx
        .graph
        .roots()
        .into_iter()
        .map(|node| node.id())
        .filter(|id| stacks::root_included(ctx, *id))
        .collect();

    let mut visited = HashSet::new();
    let mut pending: Vec<Branch> = branches(ctx, &starts, 0, &mut visited);
    pending.reverse();

    let mut out = Rendered::default();
    while let Some(branch) = pending.pop() {
        cancel.check()?;
        out.lines.push(format!(
            "{}{} {}",
            pad(branch.depth),
            branch.members.len(),
            branch.description
        ));

        let mut next = Vec::new();
        for id in &branch.members {
            if let Some(node) = ctx.graph.node(*id) {
                for target in node.node_continuations() {
                    if !next.contains(&target) {
                        next.push(target);
                    }
                }
            }
        }
        let mut children = branches(ctx, &next, branch.depth + 1, &mut visited);
        children.reverse();

        out.groups.push(GroupSummary {
            depth: branch.depth,
            count: branch.members.len(),
            key: branch.description,
            members: branch.members,
        });
        pending.extend(children);
    }
    Ok(out)
}

/// Groups `members` into branches, largest first, then by description.
fn branches<A: SnapshotAccessor>(
    ctx: &RenderContext<'_, A>,
    members: &[NodeId],
    depth: usize,
    visited: &mut HashSet<NodeId>,
) -> Vec<Branch> {
    let mut groups: BTreeMap<BranchKey, Vec<NodeId>> = BTreeMap::new();
    for id in members {
        if !visited.insert(*id) {
            continue;
        }
        let Some(node) = ctx.graph.node(*id) else {
            continue;
        };
        let state = node.await_state.filter(|_| node.is_state_machine());
        groups
            .entry((ctx.description(*id).to_string(), state))
            .or_default()
            .push(*id);
    }
    let mut ordered: Vec<(BranchKey, Vec<NodeId>)> = groups.into_iter().collect();
    ordered.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
    ordered
        .into_iter()
        .map(|((description, _), members)| Branch {
            depth,
            description,
            members,
        })
        .collect()
}
