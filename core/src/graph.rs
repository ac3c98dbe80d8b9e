//! Dependency graph analysis.
//!
//! The service keeps no state of its own: every computation runs over a
//! snapshot of tasks and dependency edges fetched by the caller, so results
//! are deterministic for a fixed snapshot and safe to recompute at any
//! time. All analysis operates on the blocks-normalised view: an
//! `IsBlockedBy(a, b)` edge is treated as `Blocks(b, a)` and `RelatesTo`
//! edges are ignored.

use crate::error::{OrchestratorError, Result};
use crate::models::{Dependency, DependencyType, NewDependency, DEFAULT_COMPLEXITY};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// Minimum outgoing fan-out for a task to be reported as a bottleneck.
pub const DEFAULT_BOTTLENECK_THRESHOLD: usize = 3;

/// Upper bound on the number of tasks a single traversal will visit.
pub const DEFAULT_MAX_NODES: usize = 1000;

/// A task as seen by the graph: identity plus the complexity used for
/// deterministic tie-breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphNode {
    pub id: Uuid,
    pub complexity: u8,
}

impl GraphNode {
    pub fn new(id: Uuid, complexity: u8) -> Self {
        Self { id, complexity }
    }
}

/// Tuning knobs for a full graph traversal.
#[derive(Debug, Clone, Copy)]
pub struct GraphQueryOptions {
    pub bottleneck_threshold: usize,
    pub max_nodes: usize,
}

impl Default for GraphQueryOptions {
    fn default() -> Self {
        Self {
            bottleneck_threshold: DEFAULT_BOTTLENECK_THRESHOLD,
            max_nodes: DEFAULT_MAX_NODES,
        }
    }
}

/// A task with unusually high outgoing fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bottleneck {
    pub task_id: Uuid,
    pub fan_out: usize,
}

/// Tasks sharing a topological level; they have no edges among each other
/// and can proceed concurrently once their predecessors finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelGroup {
    pub depth: usize,
    pub task_ids: Vec<Uuid>,
}

/// Result of a full traversal from a starting task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphAnalysis {
    /// Topological ordering of every reachable task. Ties break on lower
    /// complexity, then id.
    pub chain: Vec<Uuid>,
    /// Length in edges of the longest source-to-sink path.
    pub depth: usize,
    /// One longest directed path through the reachable subgraph.
    pub critical_path: Vec<Uuid>,
    /// Tasks whose fan-out meets the threshold, highest first.
    pub bottlenecks: Vec<Bottleneck>,
    /// Same-level groups of two or more tasks.
    pub parallelizable: Vec<ParallelGroup>,
}

/// Screen a batch of new edges against the existing graph.
///
/// Rejects duplicates — within the batch and against existing edges — and
/// any batch that would close a cycle in the blocks-normalised graph. The
/// whole batch is judged together: either every edge is acceptable or the
/// batch fails with the first offence found.
pub fn screen_batch(existing: &[Dependency], batch: &[Dependency]) -> Result<()> {
    detect_duplicates(existing, batch)?;
    detect_cycles(existing, batch)
}

/// Check `(from, to, type)` uniqueness for a batch of candidate edges.
pub fn detect_duplicates(existing: &[Dependency], batch: &[Dependency]) -> Result<()> {
    let mut seen: HashSet<(Uuid, Uuid, DependencyType)> = existing
        .iter()
        .map(|d| (d.from_task_id, d.to_task_id, d.dep_type))
        .collect();

    for dep in batch {
        let key = (dep.from_task_id, dep.to_task_id, dep.dep_type);
        if !seen.insert(key) {
            return Err(OrchestratorError::DuplicateEdge {
                from: dep.from_task_id,
                to: dep.to_task_id,
                dep_type: dep.dep_type,
            });
        }
    }
    Ok(())
}

/// Self-reference check for edges arriving from the tool surface.
pub fn validate_edge_endpoints(edge: &NewDependency) -> Result<()> {
    if edge.from_task_id == edge.to_task_id {
        return Err(OrchestratorError::Validation(
            "a task cannot depend on itself".to_string(),
        ));
    }
    Ok(())
}

/// Three-colour depth-first search over existing ∪ batch edges. Returns
/// `CycleDetected` with the offending path (in blocks direction, closing
/// node repeated at the end) when the combined graph is not a DAG.
pub fn detect_cycles(existing: &[Dependency], batch: &[Dependency]) -> Result<()> {
    let adjacency = build_adjacency(existing.iter().chain(batch.iter()));

    #[derive(Clone, Copy, PartialEq)]
    enum Colour {
        White,
        Gray,
        Black,
    }

    let mut colour: HashMap<Uuid, Colour> =
        adjacency.keys().map(|&id| (id, Colour::White)).collect();

    fn visit(
        node: Uuid,
        adjacency: &BTreeMap<Uuid, Vec<Uuid>>,
        colour: &mut HashMap<Uuid, Colour>,
        stack: &mut Vec<Uuid>,
    ) -> Option<Vec<Uuid>> {
        colour.insert(node, Colour::Gray);
        stack.push(node);

        if let Some(nexts) = adjacency.get(&node) {
            for &next in nexts {
                match colour.get(&next).copied().unwrap_or(Colour::White) {
                    Colour::White => {
                        if let Some(cycle) = visit(next, adjacency, colour, stack) {
                            return Some(cycle);
                        }
                    }
                    Colour::Gray => {
                        // Back edge: the cycle is the stack suffix starting
                        // at the gray node, closed by repeating it.
                        let pos = stack.iter().position(|&id| id == next).unwrap_or(0);
                        let mut cycle = stack[pos..].to_vec();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Colour::Black => {}
                }
            }
        }

        stack.pop();
        colour.insert(node, Colour::Black);
        None
    }

    let roots: Vec<Uuid> = adjacency.keys().copied().collect();
    let mut stack = Vec::new();
    for root in roots {
        if colour.get(&root).copied() == Some(Colour::White) {
            if let Some(path) = visit(root, &adjacency, &mut colour, &mut stack) {
                return Err(OrchestratorError::CycleDetected { path });
            }
        }
    }
    Ok(())
}

/// Full traversal from `start`: walks the weakly-connected component of
/// the blocks-normalised graph and derives ordering, depth, critical path,
/// bottlenecks and parallelizable groups.
pub fn analyze(
    start: Uuid,
    nodes: &[GraphNode],
    deps: &[Dependency],
    options: &GraphQueryOptions,
) -> GraphAnalysis {
    let complexity: HashMap<Uuid, u8> = nodes.iter().map(|n| (n.id, n.complexity)).collect();
    let forward = build_adjacency(deps.iter());
    let mut undirected: BTreeMap<Uuid, BTreeSet<Uuid>> = BTreeMap::new();
    for (&from, tos) in &forward {
        for &to in tos {
            undirected.entry(from).or_default().insert(to);
            undirected.entry(to).or_default().insert(from);
        }
    }

    // Component discovery, bounded and in deterministic order.
    let mut component: BTreeSet<Uuid> = BTreeSet::new();
    let mut queue = VecDeque::new();
    component.insert(start);
    queue.push_back(start);
    while let Some(node) = queue.pop_front() {
        if component.len() >= options.max_nodes {
            break;
        }
        if let Some(neighbors) = undirected.get(&node) {
            for &next in neighbors {
                if component.len() >= options.max_nodes {
                    break;
                }
                if component.insert(next) {
                    queue.push_back(next);
                }
            }
        }
    }

    let key = |id: Uuid| -> (u8, Uuid) {
        (
            complexity.get(&id).copied().unwrap_or(DEFAULT_COMPLEXITY),
            id,
        )
    };

    // Induced subgraph with in-degrees.
    let mut out_edges: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
    let mut in_degree: BTreeMap<Uuid, usize> = component.iter().map(|&id| (id, 0)).collect();
    for (&from, tos) in &forward {
        if !component.contains(&from) {
            continue;
        }
        for &to in tos {
            if component.contains(&to) {
                out_edges.entry(from).or_default().push(to);
                *in_degree.entry(to).or_default() += 1;
            }
        }
    }

    // Kahn's algorithm with a priority queue for deterministic ties.
    let mut ready: BinaryHeap<Reverse<(u8, Uuid)>> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| Reverse(key(id)))
        .collect();
    let mut chain = Vec::with_capacity(component.len());
    let mut remaining = in_degree.clone();
    while let Some(Reverse((_, id))) = ready.pop() {
        chain.push(id);
        if let Some(tos) = out_edges.get(&id) {
            for &to in tos {
                let deg = remaining.get_mut(&to).map(|d| {
                    *d -= 1;
                    *d
                });
                if deg == Some(0) {
                    ready.push(Reverse(key(to)));
                }
            }
        }
    }

    // Longest path from any source, per node, via DP over the chain.
    let mut level: HashMap<Uuid, usize> = HashMap::new();
    let mut longest_pred: HashMap<Uuid, Uuid> = HashMap::new();
    for &id in &chain {
        level.entry(id).or_insert(0);
        let base = level[&id];
        if let Some(tos) = out_edges.get(&id) {
            for &to in tos {
                let candidate = base + 1;
                let current = level.get(&to).copied().unwrap_or(0);
                if candidate > current
                    || (candidate == current
                        && longest_pred.get(&to).map(|&p| key(id) < key(p)).unwrap_or(true))
                {
                    if candidate > current {
                        level.insert(to, candidate);
                    }
                    longest_pred.insert(to, id);
                }
            }
        }
    }

    let depth = level.values().copied().max().unwrap_or(0);

    // Critical path: walk predecessors back from the deepest node.
    let critical_path = {
        let end = chain
            .iter()
            .copied()
            .filter(|id| level.get(id).copied().unwrap_or(0) == depth)
            .min_by_key(|&id| key(id));
        match end {
            Some(end) => {
                let mut path = vec![end];
                let mut cursor = end;
                while let Some(&pred) = longest_pred.get(&cursor) {
                    path.push(pred);
                    cursor = pred;
                }
                path.reverse();
                path
            }
            None => Vec::new(),
        }
    };

    let mut bottlenecks: Vec<Bottleneck> = out_edges
        .iter()
        .map(|(&id, tos)| Bottleneck {
            task_id: id,
            fan_out: tos.len(),
        })
        .filter(|b| b.fan_out >= options.bottleneck_threshold)
        .collect();
    bottlenecks.sort_by(|a, b| b.fan_out.cmp(&a.fan_out).then(a.task_id.cmp(&b.task_id)));

    // Tasks at the same level share no edge (an edge always increases the
    // level of its target), so level buckets are parallelizable as-is.
    let mut by_level: BTreeMap<usize, Vec<Uuid>> = BTreeMap::new();
    for &id in &chain {
        by_level
            .entry(level.get(&id).copied().unwrap_or(0))
            .or_default()
            .push(id);
    }
    let parallelizable = by_level
        .into_iter()
        .filter(|(_, members)| members.len() >= 2)
        .map(|(depth, mut members)| {
            members.sort_by_key(|&id| key(id));
            ParallelGroup {
                depth,
                task_ids: members,
            }
        })
        .collect();

    GraphAnalysis {
        chain,
        depth,
        critical_path,
        bottlenecks,
        parallelizable,
    }
}

/// Blocks-normalised adjacency with sorted, de-duplicated neighbor lists.
fn build_adjacency<'a>(deps: impl Iterator<Item = &'a Dependency>) -> BTreeMap<Uuid, Vec<Uuid>> {
    let mut adjacency: BTreeMap<Uuid, BTreeSet<Uuid>> = BTreeMap::new();
    for dep in deps {
        if let Some((from, to, _)) = dep.normalized() {
            adjacency.entry(from).or_default().insert(to);
            adjacency.entry(to).or_default();
        }
    }
    adjacency
        .into_iter()
        .map(|(id, set)| (id, set.into_iter().collect()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use chrono::Utc;

    fn edge(from: Uuid, to: Uuid) -> Dependency {
        Dependency {
            id: Uuid::new_v4(),
            from_task_id: from,
            to_task_id: to,
            dep_type: DependencyType::Blocks,
            unblock_at: None,
            created_at: Utc::now(),
        }
    }

    fn reversed_edge(from: Uuid, to: Uuid) -> Dependency {
        Dependency {
            dep_type: DependencyType::IsBlockedBy,
            ..edge(from, to)
        }
    }

    fn relates(from: Uuid, to: Uuid) -> Dependency {
        Dependency {
            dep_type: DependencyType::RelatesTo,
            ..edge(from, to)
        }
    }

    fn ids(n: usize) -> Vec<Uuid> {
        let mut out: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
        out.sort();
        out
    }

    fn nodes(ids: &[Uuid]) -> Vec<GraphNode> {
        ids.iter().map(|&id| GraphNode::new(id, 5)).collect()
    }

    #[test]
    fn acyclic_batch_is_accepted() {
        let v = ids(3);
        let existing = vec![edge(v[0], v[1])];
        let batch = vec![edge(v[1], v[2])];
        assert!(screen_batch(&existing, &batch).is_ok());
    }

    #[test]
    fn batch_closing_a_cycle_is_rejected_whole() {
        let v = ids(3);
        let existing = vec![edge(v[0], v[1])];
        // B -> C is fine on its own; C -> A closes the loop.
        let batch = vec![edge(v[1], v[2]), edge(v[2], v[0])];
        let err = screen_batch(&existing, &batch).unwrap_err();
        match err {
            OrchestratorError::CycleDetected { path } => {
                for id in &v {
                    assert!(path.contains(id), "cycle path must include {id}");
                }
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }

    #[test]
    fn reversed_edges_participate_in_cycles() {
        let v = ids(2);
        let existing = vec![edge(v[0], v[1])];
        // IsBlockedBy(a, b) normalises to Blocks(b, a): a two-node loop.
        let batch = vec![reversed_edge(v[0], v[1])];
        assert!(matches!(
            screen_batch(&existing, &batch),
            Err(OrchestratorError::CycleDetected { .. })
        ));
    }

    #[test]
    fn relates_to_never_cycles() {
        let v = ids(2);
        let existing = vec![edge(v[0], v[1])];
        let batch = vec![relates(v[1], v[0])];
        assert!(screen_batch(&existing, &batch).is_ok());
    }

    #[test]
    fn duplicate_against_existing_is_rejected() {
        let v = ids(2);
        let existing = vec![edge(v[0], v[1])];
        let batch = vec![edge(v[0], v[1])];
        assert!(matches!(
            screen_batch(&existing, &batch),
            Err(OrchestratorError::DuplicateEdge { .. })
        ));
    }

    #[test]
    fn duplicate_within_batch_is_rejected() {
        let v = ids(2);
        let batch = vec![edge(v[0], v[1]), edge(v[0], v[1])];
        assert!(matches!(
            screen_batch(&[], &batch),
            Err(OrchestratorError::DuplicateEdge { .. })
        ));
    }

    #[test]
    fn same_pair_different_type_is_allowed() {
        let v = ids(2);
        let batch = vec![edge(v[0], v[1]), relates(v[0], v[1])];
        assert!(detect_duplicates(&[], &batch).is_ok());
    }

    #[test]
    fn linear_chain_analysis() {
        let v = ids(4);
        let deps = vec![edge(v[0], v[1]), edge(v[1], v[2]), edge(v[2], v[3])];
        let analysis = analyze(v[0], &nodes(&v), &deps, &GraphQueryOptions::default());

        assert_eq!(analysis.chain, v);
        assert_eq!(analysis.depth, 3);
        assert_eq!(analysis.critical_path, v);
        assert!(analysis.bottlenecks.is_empty());
        assert!(analysis.parallelizable.is_empty());
    }

    #[test]
    fn diamond_has_parallel_middle() {
        let v = ids(4);
        let deps = vec![
            edge(v[0], v[1]),
            edge(v[0], v[2]),
            edge(v[1], v[3]),
            edge(v[2], v[3]),
        ];
        let analysis = analyze(v[3], &nodes(&v), &deps, &GraphQueryOptions::default());

        assert_eq!(analysis.depth, 2);
        assert_eq!(analysis.chain.len(), 4);
        assert_eq!(analysis.chain[0], v[0]);
        assert_eq!(analysis.chain[3], v[3]);
        assert_eq!(analysis.parallelizable.len(), 1);
        let group = &analysis.parallelizable[0];
        assert_eq!(group.depth, 1);
        assert_eq!(group.task_ids, vec![v[1], v[2]]);
        assert_eq!(analysis.critical_path.len(), 3);
    }

    #[test]
    fn fan_out_is_a_bottleneck() {
        let v = ids(5);
        let deps = vec![
            edge(v[0], v[1]),
            edge(v[0], v[2]),
            edge(v[0], v[3]),
            edge(v[0], v[4]),
        ];
        let analysis = analyze(v[0], &nodes(&v), &deps, &GraphQueryOptions::default());
        assert_eq!(analysis.bottlenecks.len(), 1);
        assert_eq!(analysis.bottlenecks[0].task_id, v[0]);
        assert_eq!(analysis.bottlenecks[0].fan_out, 4);

        // Fan-out below the threshold disappears.
        let small = vec![edge(v[0], v[1]), edge(v[0], v[2])];
        let analysis = analyze(v[0], &nodes(&v[..3]), &small, &GraphQueryOptions::default());
        assert!(analysis.bottlenecks.is_empty());
    }

    #[test]
    fn chain_ties_break_on_complexity_then_id() {
        let v = ids(3);
        // No edges: all three are sources at level 0.
        let graph_nodes = vec![
            GraphNode::new(v[0], 9),
            GraphNode::new(v[1], 2),
            GraphNode::new(v[2], 2),
        ];
        // Connect them weakly so they share a component.
        let deps = vec![relates(v[0], v[1])];
        let analysis = analyze(v[0], &graph_nodes, &deps, &GraphQueryOptions::default());
        // Only the start task is in the component (relates-to edges do not
        // link the normalised graph).
        assert_eq!(analysis.chain, vec![v[0]]);

        let deps = vec![edge(v[0], v[2]), edge(v[1], v[2])];
        let analysis = analyze(v[2], &graph_nodes, &deps, &GraphQueryOptions::default());
        // v1 (complexity 2) precedes v0 (complexity 9) despite id order.
        assert_eq!(analysis.chain, vec![v[1], v[0], v[2]]);
    }

    #[test]
    fn analysis_is_deterministic() {
        let v = ids(6);
        let deps = vec![
            edge(v[0], v[2]),
            edge(v[1], v[2]),
            edge(v[2], v[3]),
            edge(v[2], v[4]),
            edge(v[3], v[5]),
            edge(v[4], v[5]),
        ];
        let first = analyze(v[0], &nodes(&v), &deps, &GraphQueryOptions::default());
        for _ in 0..10 {
            let again = analyze(v[0], &nodes(&v), &deps, &GraphQueryOptions::default());
            assert_eq!(first, again);
        }
    }

    #[test]
    fn traversal_only_covers_reachable_component() {
        let v = ids(4);
        let deps = vec![edge(v[0], v[1]), edge(v[2], v[3])];
        let analysis = analyze(v[0], &nodes(&v), &deps, &GraphQueryOptions::default());
        assert_eq!(analysis.chain, vec![v[0], v[1]]);
        assert_eq!(analysis.depth, 1);
    }

    #[test]
    fn unblock_threshold_survives_normalization() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let dep = Dependency {
            id: Uuid::new_v4(),
            from_task_id: a,
            to_task_id: b,
            dep_type: DependencyType::IsBlockedBy,
            unblock_at: Some(Role::Review),
            created_at: Utc::now(),
        };
        let (from, to, threshold) = dep.normalized().unwrap();
        assert_eq!((from, to), (b, a));
        assert_eq!(threshold, Role::Review);
    }
}
