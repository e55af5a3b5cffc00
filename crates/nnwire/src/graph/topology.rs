use std::collections::HashMap;
use std::fmt;

/// Index of an operator inside its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Read-only view of operator dependencies used by [`topological_sort`].
pub trait DependencyGraph {
    fn dependency_count(&self, node: NodeId) -> usize;

    /// The producer of the `index`-th input of `node`.
    fn dependency(&self, node: NodeId, index: usize) -> NodeId;

    fn is_error(&self, node: NodeId) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// A reachable node is in the error state.
    ErrorNode(NodeId),
    /// A node was reached again while still on the current DFS path.
    Cycle(NodeId),
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyError::ErrorNode(node) => write!(f, "node {} is an error object", node.0),
            TopologyError::Cycle(node) => write!(f, "cycle detected through node {}", node.0),
        }
    }
}

impl std::error::Error for TopologyError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Orders every node reachable from `roots` so that each node follows all of
/// its dependencies.
///
/// The walk is an explicit-stack DFS: the stack always holds the current path,
/// a node is emitted once all of its dependencies are done, and meeting a node
/// that is still on the path reports a cycle. Roots are walked in the order
/// given and each node is emitted once.
pub fn topological_sort<G>(graph: &G, roots: &[NodeId]) -> Result<Vec<NodeId>, TopologyError>
where
    G: DependencyGraph + ?Sized,
{
    let mut marks: HashMap<NodeId, Mark> = HashMap::new();
    let mut order = Vec::new();
    // Each frame is (node, next dependency to inspect).
    let mut stack: Vec<(NodeId, usize)> = Vec::new();

    for &root in roots {
        match marks.get(&root) {
            Some(Mark::Done) => continue,
            Some(Mark::InProgress) => return Err(TopologyError::Cycle(root)),
            None => {}
        }
        if graph.is_error(root) {
            return Err(TopologyError::ErrorNode(root));
        }
        marks.insert(root, Mark::InProgress);
        stack.push((root, 0));

        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            if frame.1 < graph.dependency_count(node) {
                let dependency = graph.dependency(node, frame.1);
                frame.1 += 1;
                match marks.get(&dependency) {
                    Some(Mark::Done) => {}
                    Some(Mark::InProgress) => return Err(TopologyError::Cycle(dependency)),
                    None => {
                        if graph.is_error(dependency) {
                            return Err(TopologyError::ErrorNode(dependency));
                        }
                        marks.insert(dependency, Mark::InProgress);
                        stack.push((dependency, 0));
                    }
                }
            } else {
                marks.insert(node, Mark::Done);
                order.push(node);
                stack.pop();
            }
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct Adjacency {
        deps: Vec<Vec<u32>>,
        errors: Vec<u32>,
    }

    impl DependencyGraph for Adjacency {
        fn dependency_count(&self, node: NodeId) -> usize {
            self.deps[node.0 as usize].len()
        }

        fn dependency(&self, node: NodeId, index: usize) -> NodeId {
            NodeId(self.deps[node.0 as usize][index])
        }

        fn is_error(&self, node: NodeId) -> bool {
            self.errors.contains(&node.0)
        }
    }

    fn ids(order: &[NodeId]) -> Vec<u32> {
        order.iter().map(|n| n.0).collect()
    }

    #[test]
    fn diamond_is_emitted_once_per_node() {
        // 3 depends on 1 and 2, both depend on 0.
        let graph = Adjacency {
            deps: vec![vec![], vec![0], vec![0], vec![1, 2]],
            errors: vec![],
        };
        let order = topological_sort(&graph, &[NodeId(3)]).unwrap();
        assert_eq!(ids(&order), vec![0, 1, 2, 3]);
    }

    #[test]
    fn shared_roots_do_not_duplicate() {
        let graph = Adjacency {
            deps: vec![vec![], vec![0], vec![0]],
            errors: vec![],
        };
        let order = topological_sort(&graph, &[NodeId(1), NodeId(2), NodeId(1)]).unwrap();
        assert_eq!(ids(&order), vec![0, 1, 2]);
    }

    #[test]
    fn cycle_is_reported() {
        let graph = Adjacency {
            deps: vec![vec![2], vec![0], vec![1]],
            errors: vec![],
        };
        assert!(matches!(
            topological_sort(&graph, &[NodeId(2)]),
            Err(TopologyError::Cycle(_))
        ));
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let graph = Adjacency {
            deps: vec![vec![0]],
            errors: vec![],
        };
        assert_eq!(
            topological_sort(&graph, &[NodeId(0)]),
            Err(TopologyError::Cycle(NodeId(0)))
        );
    }

    #[test]
    fn error_dependency_short_circuits() {
        let graph = Adjacency {
            deps: vec![vec![], vec![0], vec![1]],
            errors: vec![0],
        };
        assert_eq!(
            topological_sort(&graph, &[NodeId(2)]),
            Err(TopologyError::ErrorNode(NodeId(0)))
        );
        assert_eq!(
            topological_sort(&graph, &[NodeId(0)]),
            Err(TopologyError::ErrorNode(NodeId(0)))
        );
    }

    fn arb_dag() -> impl Strategy<Value = (Vec<Vec<u32>>, Vec<u32>)> {
        (1usize..40).prop_flat_map(|len| {
            let deps = (0..len)
                .map(|node| {
                    if node == 0 {
                        Just(Vec::<u32>::new()).boxed()
                    } else {
                        proptest::collection::vec(0..node as u32, 0..4).boxed()
                    }
                })
                .collect::<Vec<_>>();
            let roots = proptest::collection::vec(0..len as u32, 1..4);
            (deps, roots)
        })
    }

    proptest! {
        #[test]
        fn every_node_follows_its_dependencies((deps, roots) in arb_dag()) {
            let graph = Adjacency { deps: deps.clone(), errors: vec![] };
            let roots: Vec<NodeId> = roots.into_iter().map(NodeId).collect();
            let order = topological_sort(&graph, &roots).unwrap();

            let mut position = HashMap::new();
            for (i, node) in order.iter().enumerate() {
                prop_assert!(position.insert(*node, i).is_none(), "node emitted twice");
            }
            for node in &order {
                for dep in &deps[node.0 as usize] {
                    let dep_pos = position.get(&NodeId(*dep));
                    prop_assert!(dep_pos.is_some(), "dependency missing from order");
                    prop_assert!(dep_pos.unwrap() < &position[node]);
                }
            }
            for root in &roots {
                prop_assert!(position.contains_key(root));
            }
        }
    }
}
