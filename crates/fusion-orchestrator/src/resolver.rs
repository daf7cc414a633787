//! Dependency ordering over an explicit node/edge list.
//!
//! Both functions are pure: they borrow their input, keep no state between
//! calls and return the same answer for the same input. An edge `(a, b)`
//! means `a` must complete before `b` starts. Edges naming unknown nodes are
//! ignored; callers that care validate endpoints first.

use fusion_core::FusionError;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::fmt::Display;
use std::hash::Hash;

/// The graph could not be ordered. `members` holds every node that lies on
/// at least one cycle, sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError<K: Ord> {
    pub members: BTreeSet<K>,
}

impl<K: Ord + Display> From<CycleError<K>> for FusionError {
    fn from(err: CycleError<K>) -> Self {
        FusionError::Cycle {
            members: err.members.iter().map(ToString::to_string).collect(),
        }
    }
}

struct Graph<'a, K> {
    keys: Vec<&'a K>,
    priorities: Vec<i32>,
    successors: Vec<Vec<usize>>,
    in_degree: Vec<usize>,
}

impl<'a, K: Hash + Eq> Graph<'a, K> {
    fn build(nodes: &'a [(K, i32)], edges: &'a [(K, K)]) -> Self {
        let mut index = HashMap::with_capacity(nodes.len());
        let mut keys = Vec::with_capacity(nodes.len());
        let mut priorities = Vec::with_capacity(nodes.len());
        for (key, priority) in nodes {
            if index.contains_key(key) {
                continue;
            }
            index.insert(key, keys.len());
            keys.push(key);
            priorities.push(*priority);
        }

        let mut successors = vec![Vec::new(); keys.len()];
        let mut in_degree = vec![0; keys.len()];
        let mut seen = BTreeSet::new();
        for (from, to) in edges {
            let (Some(&f), Some(&t)) = (index.get(from), index.get(to)) else {
                continue;
            };
            // Parallel edges count once.
            if seen.insert((f, t)) {
                successors[f].push(t);
                in_degree[t] += 1;
            }
        }

        Self {
            keys,
            priorities,
            successors,
            in_degree,
        }
    }
}

/// Order `nodes` so every node follows all of its predecessors.
///
/// Kahn's algorithm with a deterministic tie-break among simultaneously
/// ready nodes: higher priority first, then smaller key. When the graph has
/// cycles the error lists exactly the nodes on them, not the nodes merely
/// downstream of one.
pub fn resolve<K>(nodes: &[(K, i32)], edges: &[(K, K)]) -> Result<Vec<K>, CycleError<K>>
where
    K: Ord + Hash + Clone,
{
    let graph = Graph::build(nodes, edges);
    let mut in_degree = graph.in_degree.clone();
    let mut heap: BinaryHeap<(i32, Reverse<&K>, usize)> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(i, _)| (graph.priorities[i], Reverse(graph.keys[i]), i))
        .collect();

    let mut order = Vec::with_capacity(graph.keys.len());
    while let Some((_, _, i)) = heap.pop() {
        order.push(graph.keys[i].clone());
        for &next in &graph.successors[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                heap.push((graph.priorities[next], Reverse(graph.keys[next]), next));
            }
        }
    }

    if order.len() == graph.keys.len() {
        return Ok(order);
    }

    let remaining: Vec<usize> = (0..graph.keys.len())
        .filter(|&i| in_degree[i] > 0)
        .collect();
    Err(CycleError {
        members: cycle_members(&graph, &remaining),
    })
}

/// Nodes whose every predecessor is in `completed` and which are not
/// themselves completed, in the same priority-then-key order as [`resolve`].
pub fn ready_nodes<K>(nodes: &[(K, i32)], edges: &[(K, K)], completed: &BTreeSet<K>) -> Vec<K>
where
    K: Ord + Hash + Clone,
{
    let graph = Graph::build(nodes, edges);
    let mut blocked = vec![false; graph.keys.len()];
    for (from, succs) in graph.successors.iter().enumerate() {
        if completed.contains(graph.keys[from]) {
            continue;
        }
        for &to in succs {
            blocked[to] = true;
        }
    }

    let mut ready: Vec<(i32, &K)> = (0..graph.keys.len())
        .filter(|&i| !blocked[i] && !completed.contains(graph.keys[i]))
        .map(|i| (graph.priorities[i], graph.keys[i]))
        .collect();
    ready.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    ready.into_iter().map(|(_, k)| k.clone()).collect()
}

/// Tarjan's strongly connected components restricted to `subset`. A node is
/// on a cycle when its component has more than one member or it has a self
/// edge.
fn cycle_members<K: Ord + Hash + Clone>(graph: &Graph<'_, K>, subset: &[usize]) -> BTreeSet<K> {
    let in_subset: BTreeSet<usize> = subset.iter().copied().collect();
    let n = graph.keys.len();
    let mut index_of = vec![usize::MAX; n];
    let mut low = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut stack = Vec::new();
    let mut next_index = 0;
    let mut members = BTreeSet::new();

    // Explicit call stack of (node, next successor position).
    for &root in subset {
        if index_of[root] != usize::MAX {
            continue;
        }
        let mut call: Vec<(usize, usize)> = vec![(root, 0)];
        index_of[root] = next_index;
        low[root] = next_index;
        next_index += 1;
        stack.push(root);
        on_stack[root] = true;

        while let Some(&(v, pos)) = call.last() {
            if let Some(&w) = graph.successors[v].get(pos) {
                if let Some(top) = call.last_mut() {
                    top.1 += 1;
                }
                if !in_subset.contains(&w) {
                    continue;
                }
                if index_of[w] == usize::MAX {
                    index_of[w] = next_index;
                    low[w] = next_index;
                    next_index += 1;
                    stack.push(w);
                    on_stack[w] = true;
                    call.push((w, 0));
                } else if on_stack[w] {
                    low[v] = low[v].min(index_of[w]);
                }
                continue;
            }

            call.pop();
            if let Some(&(parent, _)) = call.last() {
                low[parent] = low[parent].min(low[v]);
            }
            if low[v] == index_of[v] {
                let mut component = Vec::new();
                while let Some(w) = stack.pop() {
                    on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                let self_loop = graph.successors[v].contains(&v);
                if component.len() > 1 || self_loop {
                    members.extend(component.into_iter().map(|i| graph.keys[i].clone()));
                }
            }
        }
    }
    members
}

/// Position of every key in an order, for "a precedes b" checks.
pub fn positions<K: Ord + Clone>(order: &[K]) -> BTreeMap<K, usize> {
    order
        .iter()
        .enumerate()
        .map(|(i, k)| (k.clone(), i))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn nodes(keys: &[&'static str]) -> Vec<(&'static str, i32)> {
        keys.iter().map(|k| (*k, 0)).collect()
    }

    #[test]
    fn test_linear_chain() {
        let order = resolve(&nodes(&["c", "b", "a"]), &[("a", "b"), ("b", "c")]).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_diamond_respects_dependencies() {
        let edges = [("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")];
        let order = resolve(&nodes(&["d", "c", "b", "a"]), &edges).unwrap();
        let pos = positions(&order);
        for (from, to) in edges {
            assert!(pos[from] < pos[to], "{from} must precede {to}");
        }
    }

    #[test]
    fn test_priority_then_key_tie_break() {
        let input = [("b", 1), ("a", 1), ("z", 5), ("c", 0)];
        assert_eq!(resolve(&input, &[]).unwrap(), vec!["z", "a", "b", "c"]);
    }

    #[test]
    fn test_priority_is_soft_preference() {
        // "low" has the lowest priority but gates "urgent".
        let input = [("low", -1), ("urgent", 10), ("mid", 3)];
        let order = resolve(&input, &[("low", "urgent")]).unwrap();
        assert_eq!(order, vec!["mid", "low", "urgent"]);
    }

    #[test]
    fn test_deterministic_output() {
        let input = nodes(&["e", "d", "c", "b", "a"]);
        let edges = [("a", "e"), ("b", "e")];
        let first = resolve(&input, &edges).unwrap();
        for _ in 0..10 {
            assert_eq!(resolve(&input, &edges).unwrap(), first);
        }
    }

    #[test]
    fn test_cycle_reports_all_members() {
        let err = resolve(
            &nodes(&["a", "b", "c"]),
            &[("a", "b"), ("b", "c"), ("c", "a")],
        )
        .unwrap_err();
        assert_eq!(err.members, BTreeSet::from(["a", "b", "c"]));
    }

    #[test]
    fn test_cycle_excludes_downstream_and_upstream_nodes() {
        // root -> x <-> y -> tail; p <-> q is a second tangle.
        let edges = [
            ("root", "x"),
            ("x", "y"),
            ("y", "x"),
            ("y", "tail"),
            ("p", "q"),
            ("q", "p"),
        ];
        let err = resolve(&nodes(&["root", "x", "y", "tail", "p", "q"]), &edges).unwrap_err();
        assert_eq!(err.members, BTreeSet::from(["p", "q", "x", "y"]));
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let err = resolve(&nodes(&["a", "b"]), &[("a", "a")]).unwrap_err();
        assert_eq!(err.members, BTreeSet::from(["a"]));
    }

    #[test]
    fn test_cycle_converts_to_fusion_error() {
        let err: FusionError = resolve(&nodes(&["a", "b"]), &[("a", "b"), ("b", "a")])
            .unwrap_err()
            .into();
        match err {
            FusionError::Cycle { members } => assert_eq!(members, vec!["a", "b"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_edge_endpoints_ignored() {
        let order = resolve(&nodes(&["a"]), &[("ghost", "a")]).unwrap();
        assert_eq!(order, vec!["a"]);
    }

    #[test]
    fn test_ready_nodes_incremental() {
        let input = [("a", 0), ("b", 0), ("c", 2)];
        let edges = [("a", "b"), ("a", "c")];
        let mut done = BTreeSet::new();
        assert_eq!(ready_nodes(&input, &edges, &done), vec!["a"]);

        done.insert("a");
        assert_eq!(ready_nodes(&input, &edges, &done), vec!["c", "b"]);

        done.extend(["b", "c"]);
        assert!(ready_nodes(&input, &edges, &done).is_empty());
    }

    #[test]
    fn test_random_dags_always_order() {
        // Edges only go from lower to higher index, so every graph is acyclic.
        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        for _ in 0..50 {
            let count = 12;
            let input: Vec<(u32, i32)> = (0..count).map(|i| (i, (i % 3) as i32)).collect();
            let mut edges = Vec::new();
            for from in 0..count {
                for to in (from + 1)..count {
                    seed ^= seed << 13;
                    seed ^= seed >> 7;
                    seed ^= seed << 17;
                    if seed % 4 == 0 {
                        edges.push((from, to));
                    }
                }
            }
            let order = resolve(&input, &edges).unwrap();
            assert_eq!(order.len(), count as usize);
            let pos = positions(&order);
            for (from, to) in &edges {
                assert!(pos[from] < pos[to]);
            }
        }
    }
}
