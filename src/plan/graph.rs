//! Dependency graph algorithms over task ids.
//!
//! Edges point from a task to the tasks it depends on, so `a -> b` means
//! `a` must run after `b`. Every traversal uses an explicit stack.

use std::collections::{HashMap, HashSet};

use crate::error::PlanError;

/// Adjacency list: task id -> ids it depends on
pub type DependencyMap = HashMap<String, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Unvisited,
    InProgress,
    Done,
}

/// Whether `to` can already reach `from`. If so, adding `from -> to`
/// would close a cycle. A self edge always does.
pub fn would_create_cycle(deps: &DependencyMap, from: &str, to: &str) -> bool {
    if from == to {
        return true;
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack = vec![to];

    while let Some(current) = stack.pop() {
        if current == from {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        if let Some(next) = deps.get(current) {
            stack.extend(next.iter().map(String::as_str));
        }
    }

    false
}

/// Topological order (dependencies first) using three-coloring.
///
/// `nodes` fixes the visiting order so the result is deterministic.
/// Edges to ids outside `nodes` are ignored.
pub fn topological_order(
    nodes: &[String],
    deps: &DependencyMap,
) -> Result<Vec<String>, PlanError> {
    let empty: Vec<String> = Vec::new();
    let known: HashSet<&str> = nodes.iter().map(String::as_str).collect();
    let mut color: HashMap<&str, Color> = nodes
        .iter()
        .map(|n| (n.as_str(), Color::Unvisited))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    for root in nodes {
        if color[root.as_str()] != Color::Unvisited {
            continue;
        }

        // (node, index of the next dependency to look at)
        let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
        color.insert(root.as_str(), Color::InProgress);

        while let Some((node, idx)) = stack.pop() {
            let edges = deps.get(node).unwrap_or(&empty);
            let next = edges[idx..]
                .iter()
                .position(|d| known.contains(d.as_str()))
                .map(|offset| idx + offset);

            match next {
                Some(i) => {
                    stack.push((node, i + 1));
                    let dep = edges[i].as_str();
                    match color[dep] {
                        Color::Unvisited => {
                            color.insert(dep, Color::InProgress);
                            stack.push((dep, 0));
                        }
                        Color::InProgress => {
                            return Err(PlanError::Cycle(format!("{} -> {}", node, dep)));
                        }
                        Color::Done => {}
                    }
                }
                None => {
                    color.insert(node, Color::Done);
                    order.push(node.to_string());
                }
            }
        }
    }

    Ok(order)
}

/// Group tasks into batches. Every task lands in a batch strictly after
/// the batches of all of its dependencies.
pub fn execution_batches(
    nodes: &[String],
    deps: &DependencyMap,
) -> Result<Vec<Vec<String>>, PlanError> {
    let order = topological_order(nodes, deps)?;
    let known: HashSet<&str> = nodes.iter().map(String::as_str).collect();

    let mut placed: HashSet<String> = HashSet::with_capacity(order.len());
    let mut remaining = order;
    let mut batches = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<String>, Vec<String>) = remaining.into_iter().partition(|id| {
            deps.get(id)
                .map(|d| {
                    d.iter()
                        .filter(|dep| known.contains(dep.as_str()))
                        .all(|dep| placed.contains(dep))
                })
                .unwrap_or(true)
        });

        if ready.is_empty() {
            return Err(PlanError::Cycle(format!(
                "{} task(s) could not be scheduled",
                blocked.len()
            )));
        }

        placed.extend(ready.iter().cloned());
        batches.push(ready);
        remaining = blocked;
    }

    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn deps(edges: &[(&str, &str)]) -> DependencyMap {
        let mut map = DependencyMap::new();
        for (from, to) in edges {
            map.entry(from.to_string()).or_default().push(to.to_string());
        }
        map
    }

    #[test]
    fn test_self_edge_is_a_cycle() {
        assert!(would_create_cycle(&DependencyMap::new(), "a", "a"));
    }

    #[test]
    fn test_reachability_detects_indirect_cycle() {
        // c depends on b, b depends on a
        let map = deps(&[("c", "b"), ("b", "a")]);
        assert!(would_create_cycle(&map, "a", "c"));
        assert!(!would_create_cycle(&map, "c", "a"));
    }

    #[test]
    fn test_topological_order_places_dependencies_first() {
        let nodes = ids(&["c", "b", "a"]);
        let map = deps(&[("c", "b"), ("b", "a")]);
        let order = topological_order(&nodes, &map).unwrap();
        assert_eq!(order, ids(&["a", "b", "c"]));
    }

    #[test]
    fn test_topological_order_reports_back_edge() {
        let nodes = ids(&["a", "b"]);
        let map = deps(&[("a", "b"), ("b", "a")]);
        assert!(matches!(topological_order(&nodes, &map), Err(PlanError::Cycle(_))));
    }

    #[test]
    fn test_batches_fan_out() {
        let nodes = ids(&["a", "b", "c"]);
        let map = deps(&[("b", "a"), ("c", "a")]);
        let batches = execution_batches(&nodes, &map).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], ids(&["a"]));
        let mut second = batches[1].clone();
        second.sort();
        assert_eq!(second, ids(&["b", "c"]));
    }

    #[test]
    fn test_batches_ignore_unknown_nodes() {
        let nodes = ids(&["a"]);
        let map = deps(&[("a", "ghost")]);
        let batches = execution_batches(&nodes, &map).unwrap();
        assert_eq!(batches, vec![ids(&["a"])]);
    }

    #[test]
    fn test_deep_chain_does_not_recurse() {
        let nodes: Vec<String> = (0..5_000).map(|i| format!("t{}", i)).collect();
        let mut map = DependencyMap::new();
        for i in 1..nodes.len() {
            map.insert(nodes[i].clone(), vec![nodes[i - 1].clone()]);
        }
        let order = topological_order(&nodes, &map).unwrap();
        assert_eq!(order.first().unwrap(), "t0");
        assert_eq!(order.last().unwrap(), "t4999");
    }
}
