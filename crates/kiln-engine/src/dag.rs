//! The frozen action graph.

use std::collections::{BTreeMap, HashMap};

use kiln_util::RepoPath;

use crate::action::{Action, ActionId, Artifact};
use crate::error::EngineError;
use crate::state::StateCell;

/// Position of a node in the DAG.
pub type NodeIndex = usize;

/// A node: an action, its edges, and its execution state.
#[derive(Debug)]
pub struct DagNode {
    pub action: Action,
    inputs: Vec<NodeIndex>,
    dependents: Vec<NodeIndex>,
    /// Number of nodes that transitively depend on this one.
    weight: usize,
    state: StateCell,
}

impl DagNode {
    pub fn state(&self) -> &StateCell {
        &self.state
    }
}

/// Actions connected by producer/consumer edges. Read-only after
/// construction apart from the per-node state cells.
#[derive(Debug)]
pub struct ActionDag {
    nodes: Vec<DagNode>,
    index: HashMap<ActionId, NodeIndex>,
}

impl ActionDag {
    /// Build the graph in a single pass over `actions`.
    ///
    /// Nodes are indexed in action-id order, so the layout is independent of
    /// the order actions are supplied in. An action consuming the output of a
    /// non-cacheable action is itself made non-cacheable.
    ///
    /// # Errors
    /// Returns [`EngineError::DuplicateOutput`] if two actions declare the
    /// same path, [`EngineError::DanglingDependency`] if a generated input has
    /// no producer, and [`EngineError::GraphCycle`] if the edges form a cycle.
    pub fn new(mut actions: Vec<Action>) -> Result<Self, EngineError> {
        actions.sort_by(|a, b| a.id.cmp(&b.id));

        let mut index: HashMap<ActionId, NodeIndex> = HashMap::with_capacity(actions.len());
        let mut owners: BTreeMap<RepoPath, NodeIndex> = BTreeMap::new();
        for (i, action) in actions.iter().enumerate() {
            if index.insert(action.id.clone(), i).is_some() {
                return Err(EngineError::DuplicateTarget {
                    target: action.id.to_string(),
                });
            }
            for path in action.output_paths()? {
                if let Some(&first) = owners.get(&path) {
                    return Err(EngineError::DuplicateOutput {
                        path: path.to_string(),
                        first: id_at(&actions, first),
                        second: action.id.to_string(),
                    });
                }
                owners.insert(path, i);
            }
        }

        let mut inputs: Vec<Vec<NodeIndex>> = vec![Vec::new(); actions.len()];
        let mut dependents: Vec<Vec<NodeIndex>> = vec![Vec::new(); actions.len()];
        for (i, action) in actions.iter().enumerate() {
            let mut edges: Vec<NodeIndex> = Vec::new();
            for input in &action.inputs {
                let Artifact::Generated { producer, path } = input else {
                    continue;
                };
                let producer_index = index.get(producer).copied().filter(|&p| {
                    actions
                        .get(p)
                        .is_some_and(|candidate| candidate.outputs.contains(path))
                });
                let Some(p) = producer_index else {
                    return Err(EngineError::DanglingDependency {
                        from: action.id.to_string(),
                        missing: format!("{producer} output `{path}`"),
                    });
                };
                if !edges.contains(&p) {
                    edges.push(p);
                }
            }
            for &p in &edges {
                if let Some(list) = dependents.get_mut(p) {
                    list.push(i);
                }
            }
            if let Some(slot) = inputs.get_mut(i) {
                *slot = edges;
            }
        }

        let order = topological(&inputs, &dependents).map_err(|node| EngineError::GraphCycle {
            cycle: cycle_witness(&actions, &inputs, node),
        })?;
        let weights = transitive_dependents(&dependents, &order);
        propagate_uncacheable(&mut actions, &inputs, &order);

        let nodes = actions
            .into_iter()
            .zip(inputs)
            .zip(dependents)
            .zip(weights)
            .map(|(((action, inputs), dependents), weight)| DagNode {
                action,
                inputs,
                dependents,
                weight,
                state: StateCell::new(),
            })
            .collect();
        Ok(Self { nodes, index })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up an action by id.
    pub fn get(&self, id: &ActionId) -> Option<&Action> {
        self.index_of(id).and_then(|i| self.node(i)).map(|n| &n.action)
    }

    pub fn index_of(&self, id: &ActionId) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    pub fn node(&self, index: NodeIndex) -> Option<&DagNode> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &DagNode)> {
        self.nodes.iter().enumerate()
    }

    /// Nodes with no generated inputs.
    pub fn roots(&self) -> Vec<NodeIndex> {
        self.nodes()
            .filter(|(_, node)| node.inputs.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Producers whose outputs `index` consumes.
    pub fn inputs(&self, index: NodeIndex) -> &[NodeIndex] {
        self.nodes.get(index).map_or(&[][..], |n| n.inputs.as_slice())
    }

    /// Nodes that consume outputs of `index`.
    pub fn dependents(&self, index: NodeIndex) -> &[NodeIndex] {
        self.nodes.get(index).map_or(&[][..], |n| n.dependents.as_slice())
    }

    /// Number of nodes that transitively depend on `index`.
    pub fn weight(&self, index: NodeIndex) -> usize {
        self.nodes.get(index).map_or(0, |n| n.weight)
    }

    /// Every node, producers before consumers. Ties break by index.
    pub fn topological_order(&self) -> Vec<NodeIndex> {
        let inputs: Vec<Vec<NodeIndex>> = self.nodes.iter().map(|n| n.inputs.clone()).collect();
        let dependents: Vec<Vec<NodeIndex>> =
            self.nodes.iter().map(|n| n.dependents.clone()).collect();
        // Acyclic by construction.
        topological(&inputs, &dependents).unwrap_or_default()
    }
}

fn id_at(actions: &[Action], index: NodeIndex) -> String {
    actions
        .get(index)
        .map(|a| a.id.to_string())
        .unwrap_or_default()
}

/// Kahn's algorithm with a min-index frontier. On a cycle, returns a node
/// that lies on or behind one.
fn topological(
    inputs: &[Vec<NodeIndex>],
    dependents: &[Vec<NodeIndex>],
) -> Result<Vec<NodeIndex>, NodeIndex> {
    let mut remaining: Vec<usize> = inputs.iter().map(Vec::len).collect();
    let mut frontier: std::collections::BTreeSet<NodeIndex> = remaining
        .iter()
        .enumerate()
        .filter(|(_, n)| **n == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order = Vec::with_capacity(inputs.len());
    while let Some(next) = frontier.pop_first() {
        order.push(next);
        for &d in dependents.get(next).map_or(&[][..], Vec::as_slice) {
            if let Some(count) = remaining.get_mut(d) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    frontier.insert(d);
                }
            }
        }
    }
    if order.len() == inputs.len() {
        return Ok(order);
    }
    let stuck = remaining
        .iter()
        .position(|&n| n > 0)
        .unwrap_or_default();
    Err(stuck)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Three-color DFS along input edges from `start`, rendering the first cycle
/// found as `a -> b -> a`.
fn cycle_witness(actions: &[Action], inputs: &[Vec<NodeIndex>], start: NodeIndex) -> String {
    let mut color = vec![Color::White; inputs.len()];
    for root in std::iter::once(start).chain(0..inputs.len()) {
        if color.get(root) != Some(&Color::White) {
            continue;
        }
        let mut stack: Vec<(NodeIndex, usize)> = vec![(root, 0)];
        if let Some(c) = color.get_mut(root) {
            *c = Color::Gray;
        }
        while let Some((node, next_edge)) = stack.last_mut() {
            let node = *node;
            let edge = inputs.get(node).and_then(|e| e.get(*next_edge)).copied();
            *next_edge += 1;
            match edge {
                Some(to) => match color.get(to) {
                    Some(Color::White) => {
                        if let Some(c) = color.get_mut(to) {
                            *c = Color::Gray;
                        }
                        stack.push((to, 0));
                    }
                    Some(Color::Gray) => {
                        let from = stack.iter().position(|&(n, _)| n == to).unwrap_or(0);
                        let mut path: Vec<String> = stack
                            .get(from..)
                            .unwrap_or_default()
                            .iter()
                            .map(|&(n, _)| id_at(actions, n))
                            .collect();
                        path.push(id_at(actions, to));
                        // Edges point at producers; print in build order.
                        path.reverse();
                        return path.join(" -> ");
                    }
                    _ => {}
                },
                None => {
                    if let Some(c) = color.get_mut(node) {
                        *c = Color::Black;
                    }
                    stack.pop();
                }
            }
        }
    }
    id_at(actions, start)
}

/// Clear `cacheable` on every action downstream of a non-cacheable one.
/// Its outputs are not covered by its rule key, so neither are theirs.
fn propagate_uncacheable(actions: &mut [Action], inputs: &[Vec<NodeIndex>], order: &[NodeIndex]) {
    for &node in order {
        let tainted = inputs
            .get(node)
            .map_or(&[][..], Vec::as_slice)
            .iter()
            .any(|&p| actions.get(p).is_some_and(|producer| !producer.cacheable));
        if let Some(action) = actions.get_mut(node).filter(|a| tainted && a.cacheable) {
            tracing::debug!(action = %action.id, "depends on a non-cacheable action; not caching");
            action.cacheable = false;
        }
    }
}

/// Count of transitive dependents per node, walking in reverse topological
/// order. Reachability is kept as one bit per node.
fn transitive_dependents(dependents: &[Vec<NodeIndex>], order: &[NodeIndex]) -> Vec<usize> {
    let words = dependents.len().div_ceil(64);
    let mut reach: Vec<Vec<u64>> = vec![Vec::new(); dependents.len()];
    for &node in order.iter().rev() {
        let mut bits = vec![0_u64; words];
        for &d in dependents.get(node).map_or(&[][..], Vec::as_slice) {
            if let Some(word) = bits.get_mut(d / 64) {
                *word |= 1 << (d % 64);
            }
            if let Some(below) = reach.get(d) {
                for (word, b) in bits.iter_mut().zip(below) {
                    *word |= b;
                }
            }
        }
        if let Some(slot) = reach.get_mut(node) {
            *slot = bits;
        }
    }
    reach
        .iter()
        .map(|bits| {
            let count: u32 = bits.iter().map(|w| w.count_ones()).sum();
            usize::try_from(count).unwrap_or(usize::MAX)
        })
        .collect()
}
