//! Dependency graph over the classes still waiting to run.

use ctgen_core::DependencyIndex;
use std::collections::HashMap;

const UNVISITED: usize = usize::MAX;

/// Reverse dependency edges restricted to a set of pending classes, with the
/// transitive dependent count of every member computed up front.
pub struct PendingGraph<'a> {
    positions: HashMap<&'a str, usize>,
    closure: Vec<usize>,
}

impl<'a> PendingGraph<'a> {
    /// Build the graph for `pending` from what `index` knows.
    ///
    /// Edges to classes outside `pending` and self-edges are dropped.
    pub fn build(pending: &[&'a str], index: &DependencyIndex) -> Self {
        let mut positions: HashMap<&'a str, usize> = HashMap::with_capacity(pending.len());
        for &class in pending {
            let next = positions.len();
            positions.entry(class).or_insert(next);
        }

        // dependents[i]: members that depend on member i
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); positions.len()];
        for (&class, &pos) in &positions {
            let Some(deps) = index.get(class) else {
                continue;
            };
            for dep in deps.all() {
                match positions.get(dep.as_str()) {
                    Some(&target) if target != pos => dependents[target].push(pos),
                    _ => {}
                }
            }
        }

        let closure = closure_sizes(&dependents);
        Self { positions, closure }
    }

    /// Number of pending classes that depend on `class`, directly or
    /// transitively. A class on a cycle does not count itself.
    pub fn dependents_closure(&self, class: &str) -> usize {
        self.positions.get(class).map_or(0, |&pos| self.closure[pos])
    }
}

/// Count of nodes reachable from each node, itself excluded.
///
/// Cycles are collapsed into components first; components are then folded
/// in reverse topological order, so each reachability set is built once.
fn closure_sizes(edges: &[Vec<usize>]) -> Vec<usize> {
    let components = components(edges);
    let mut component_of = vec![0; edges.len()];
    for (c, members) in components.iter().enumerate() {
        for &node in members {
            component_of[node] = c;
        }
    }

    let words = edges.len().div_ceil(64);
    // reachable[c]: nodes reachable from component c, its own members included
    let mut reachable: Vec<Vec<u64>> = Vec::with_capacity(components.len());
    let mut sizes = vec![0; edges.len()];

    for (c, members) in components.iter().enumerate() {
        let mut bits = vec![0u64; words];
        for &node in members {
            for &next in &edges[node] {
                let d = component_of[next];
                if d != c {
                    for (word, other) in bits.iter_mut().zip(&reachable[d]) {
                        *word |= other;
                    }
                }
            }
        }

        let outside: usize = bits.iter().map(|w| w.count_ones() as usize).sum();
        let size = outside + members.len() - 1;
        for &node in members {
            sizes[node] = size;
            bits[node / 64] |= 1u64 << (node % 64);
        }
        reachable.push(bits);
    }

    sizes
}

/// Strongly connected components, each emitted after every component it
/// can reach.
fn components(edges: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let n = edges.len();
    let mut order = vec![UNVISITED; n];
    let mut low = vec![0; n];
    let mut on_stack = vec![false; n];
    let mut stack = Vec::new();
    let mut frames: Vec<(usize, usize)> = Vec::new();
    let mut next_order = 0;
    let mut out = Vec::new();

    for root in 0..n {
        if order[root] != UNVISITED {
            continue;
        }
        order[root] = next_order;
        low[root] = next_order;
        next_order += 1;
        stack.push(root);
        on_stack[root] = true;
        frames.push((root, 0));

        while let Some(frame) = frames.last_mut() {
            let node = frame.0;
            if let Some(&next) = edges[node].get(frame.1) {
                frame.1 += 1;
                if order[next] == UNVISITED {
                    order[next] = next_order;
                    low[next] = next_order;
                    next_order += 1;
                    stack.push(next);
                    on_stack[next] = true;
                    frames.push((next, 0));
                } else if on_stack[next] {
                    low[node] = low[node].min(order[next]);
                }
                continue;
            }

            frames.pop();
            if let Some(&(parent, _)) = frames.last() {
                low[parent] = low[parent].min(low[node]);
            }
            if low[node] == order[node] {
                let mut members = Vec::new();
                while let Some(member) = stack.pop() {
                    on_stack[member] = false;
                    members.push(member);
                    if member == node {
                        break;
                    }
                }
                out.push(members);
            }
        }
    }

    out
}
