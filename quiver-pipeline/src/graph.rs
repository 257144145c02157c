//! Dependency resolution shared by pipelines and stream compositions.

use std::collections::BTreeSet;

/// Execution plan over nodes identified by their declaration index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Resolution {
    /// Topological order; ties resolved by declaration order.
    pub order: Vec<usize>,
    /// Nodes grouped so every prerequisite lives in an earlier wave. Each
    /// wave is listed in `order` order.
    pub waves: Vec<Vec<usize>>,
}

/// Orders nodes with Kahn's algorithm. `prerequisites[i]` lists the nodes that
/// must run before node `i`; entries are assumed to be in range.
///
/// Returns the nodes left on a cycle, in declaration order, when no complete
/// order exists.
pub(crate) fn resolve(prerequisites: &[Vec<usize>]) -> Result<Resolution, Vec<usize>> {
    let count = prerequisites.len();
    let mut in_degree = vec![0usize; count];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (node, prereqs) in prerequisites.iter().enumerate() {
        let unique: BTreeSet<usize> = prereqs.iter().copied().collect();
        in_degree[node] = unique.len();
        for prereq in unique {
            successors[prereq].push(node);
        }
    }

    // Smallest declaration index among ready nodes runs first.
    let mut ready: BTreeSet<usize> = (0..count).filter(|&node| in_degree[node] == 0).collect();
    let mut order = Vec::with_capacity(count);
    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &next in &successors[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() < count {
        return Err((0..count).filter(|&node| in_degree[node] > 0).collect());
    }

    let mut level = vec![0usize; count];
    let mut waves: Vec<Vec<usize>> = Vec::new();
    for &node in &order {
        let depth = prerequisites[node]
            .iter()
            .map(|&prereq| level[prereq] + 1)
            .max()
            .unwrap_or(0);
        level[node] = depth;
        if waves.len() <= depth {
            waves.resize_with(depth + 1, Vec::new);
        }
        waves[depth].push(node);
    }

    Ok(Resolution { order, waves })
}
