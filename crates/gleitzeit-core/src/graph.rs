//! Dependency graph utilities: cycle detection, topological levels, and the
//! reverse-edge readiness tracker used by the engine to unblock dependents.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

/// Errors raised while building a dependency graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("duplicate task id: {0:?}")]
    DuplicateNode(String),

    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },
}

/// An immutable view of one workflow's dependency structure.
///
/// Edges run in the dependency direction: `a -> b` means `a` depends on `b`.
/// The reverse index (`dependents`) is maintained alongside so completion of
/// one task can surface the tasks it unblocks.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build a graph from `(task_id, dependencies)` pairs, preserving
    /// insertion order for deterministic traversal.
    pub fn from_edges<I, D>(edges: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = (String, D)>,
        D: IntoIterator<Item = String>,
    {
        let collected: Vec<(String, Vec<String>)> = edges
            .into_iter()
            .map(|(id, deps)| (id, deps.into_iter().collect()))
            .collect();

        let mut index = HashMap::with_capacity(collected.len());
        let mut nodes = Vec::with_capacity(collected.len());
        for (id, _) in &collected {
            if index.insert(id.clone(), nodes.len()).is_some() {
                return Err(GraphError::DuplicateNode(id.clone()));
            }
            nodes.push(id.clone());
        }

        let n = nodes.len();
        let mut deps: Vec<Vec<usize>> = vec![vec![]; n];
        let mut dependents: Vec<Vec<usize>> = vec![vec![]; n];
        for (id, dep_ids) in &collected {
            let from = index[id];
            for dep in dep_ids {
                let to = *index.get(dep).ok_or_else(|| GraphError::UnknownDependency {
                    task: id.clone(),
                    dependency: dep.clone(),
                })?;
                deps[from].push(to);
                dependents[to].push(from);
            }
        }

        Ok(Self {
            nodes,
            index,
            deps,
            dependents,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Direct dependencies of `id`, in declaration order.
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        match self.index.get(id) {
            Some(&i) => self.deps[i].iter().map(|&j| self.nodes[j].as_str()).collect(),
            None => vec![],
        }
    }

    /// Tasks that directly depend on `id`.
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        match self.index.get(id) {
            Some(&i) => self.dependents[i]
                .iter()
                .map(|&j| self.nodes[j].as_str())
                .collect(),
            None => vec![],
        }
    }

    /// The transitive dependency closure of `id` (not including `id`).
    pub fn transitive_dependencies(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let Some(&start) = self.index.get(id) else {
            return seen;
        };
        let mut stack: Vec<usize> = self.deps[start].clone();
        while let Some(i) = stack.pop() {
            if seen.insert(self.nodes[i].clone()) {
                stack.extend(self.deps[i].iter().copied());
            }
        }
        seen
    }

    /// Transitive dependents of `id` (not including `id`). These are the
    /// tasks that can never run once `id` fails.
    pub fn transitive_dependents(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let Some(&start) = self.index.get(id) else {
            return seen;
        };
        let mut stack: Vec<usize> = self.dependents[start].clone();
        while let Some(i) = stack.pop() {
            if seen.insert(self.nodes[i].clone()) {
                stack.extend(self.dependents[i].iter().copied());
            }
        }
        seen
    }

    /// Find a dependency cycle, if any, using a three-colour depth-first
    /// traversal. Returns the offending path with the entry node repeated at
    /// the end, e.g. `[t1, t2, t1]`.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            Unvisited,
            Open,
            Closed,
        }

        let n = self.nodes.len();
        let mut colour = vec![Colour::Unvisited; n];
        let mut path: Vec<usize> = Vec::new();

        // Iterative DFS: (node, next edge index to explore).
        for root in 0..n {
            if colour[root] != Colour::Unvisited {
                continue;
            }
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            colour[root] = Colour::Open;
            path.push(root);

            while let Some(&mut (node, ref mut edge)) = stack.last_mut() {
                if *edge < self.deps[node].len() {
                    let next = self.deps[node][*edge];
                    *edge += 1;
                    match colour[next] {
                        Colour::Open => {
                            // Cycle: slice the open path from the first
                            // occurrence of `next` and close the loop.
                            let start = path.iter().position(|&p| p == next).unwrap_or(0);
                            let mut cycle: Vec<String> = path[start..]
                                .iter()
                                .map(|&i| self.nodes[i].clone())
                                .collect();
                            cycle.push(self.nodes[next].clone());
                            return Some(cycle);
                        }
                        Colour::Unvisited => {
                            colour[next] = Colour::Open;
                            path.push(next);
                            stack.push((next, 0));
                        }
                        Colour::Closed => {}
                    }
                } else {
                    colour[node] = Colour::Closed;
                    path.pop();
                    stack.pop();
                }
            }
        }
        None
    }

    /// Topological levels via Kahn's algorithm: every task at level `k`
    /// depends only on tasks at levels `< k`. An execution hint, not a
    /// barrier. Returns `None` when the graph has a cycle.
    pub fn levels(&self) -> Option<Vec<Vec<String>>> {
        let n = self.nodes.len();
        let mut in_degree: Vec<usize> = (0..n).map(|i| self.deps[i].len()).collect();
        let mut frontier: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();

        let mut levels = Vec::new();
        let mut seen = 0usize;
        while !frontier.is_empty() {
            let mut level = Vec::with_capacity(frontier.len());
            let mut next = VecDeque::new();
            while let Some(i) = frontier.pop_front() {
                seen += 1;
                level.push(self.nodes[i].clone());
                for &dep in &self.dependents[i] {
                    in_degree[dep] -= 1;
                    if in_degree[dep] == 0 {
                        next.push_back(dep);
                    }
                }
            }
            levels.push(level);
            frontier = next;
        }

        (seen == n).then_some(levels)
    }
}

// ---------------------------------------------------------------------------
// Readiness tracking
// ---------------------------------------------------------------------------

/// Incremental readiness state for one workflow.
///
/// Tracks how many dependencies each task still waits on. Completion of a
/// task decrements its dependents' counters; any counter hitting zero means
/// that task is ready. The tracker never looks at task status -- the engine
/// filters out tasks that are already terminal or cancelled.
#[derive(Debug)]
pub struct ReadinessTracker {
    graph: DependencyGraph,
    remaining: HashMap<String, usize>,
    completed: HashSet<String>,
}

impl ReadinessTracker {
    pub fn new(graph: DependencyGraph) -> Self {
        let remaining = graph
            .nodes
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), graph.deps[i].len()))
            .collect();
        Self {
            graph,
            remaining,
            completed: HashSet::new(),
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Tasks with no outstanding dependencies that have not completed yet.
    pub fn ready_now(&self) -> Vec<String> {
        self.graph
            .nodes
            .iter()
            .filter(|id| self.remaining[*id] == 0 && !self.completed.contains(*id))
            .cloned()
            .collect()
    }

    pub fn is_ready(&self, id: &str) -> bool {
        self.remaining.get(id).is_some_and(|&r| r == 0) && !self.completed.contains(id)
    }

    pub fn is_completed(&self, id: &str) -> bool {
        self.completed.contains(id)
    }

    /// Record `id` as completed and return the dependents that became ready.
    ///
    /// Idempotent: marking an already-completed task returns nothing.
    pub fn mark_completed(&mut self, id: &str) -> Vec<String> {
        if !self.graph.contains(id) || !self.completed.insert(id.to_owned()) {
            return vec![];
        }
        let mut newly_ready = Vec::new();
        for dependent in self.graph.dependents_of(id) {
            let counter = self
                .remaining
                .get_mut(dependent)
                .expect("dependent tracked");
            *counter -= 1;
            if *counter == 0 {
                newly_ready.push(dependent.to_owned());
            }
        }
        newly_ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> DependencyGraph {
        DependencyGraph::from_edges(edges.iter().map(|(id, deps)| {
            (
                id.to_string(),
                deps.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
            )
        }))
        .expect("graph should build")
    }

    #[test]
    fn rejects_unknown_dependency() {
        let err = DependencyGraph::from_edges([("a".to_string(), vec!["ghost".to_string()])])
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { .. }));
    }

    #[test]
    fn rejects_duplicate_node() {
        let err = DependencyGraph::from_edges([
            ("a".to_string(), Vec::<String>::new()),
            ("a".to_string(), Vec::<String>::new()),
        ])
        .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateNode(_)));
    }

    #[test]
    fn direct_cycle_reports_path() {
        let g = graph(&[("t1", &["t2"]), ("t2", &["t1"])]);
        let cycle = g.find_cycle().expect("should find cycle");
        assert_eq!(cycle, vec!["t1", "t2", "t1"]);
    }

    #[test]
    fn transitive_cycle_detected() {
        let g = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]);
        let cycle = g.find_cycle().expect("should find cycle");
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn self_loop_detected() {
        let g = graph(&[("a", &["a"])]);
        assert_eq!(g.find_cycle().unwrap(), vec!["a", "a"]);
    }

    #[test]
    fn dag_has_no_cycle() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        assert!(g.find_cycle().is_none());
    }

    #[test]
    fn diamond_levels() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        let levels = g.levels().expect("acyclic");
        assert_eq!(levels[0], vec!["a"]);
        assert_eq!(levels[1], vec!["b", "c"]);
        assert_eq!(levels[2], vec!["d"]);
    }

    #[test]
    fn levels_none_on_cycle() {
        let g = graph(&[("t1", &["t2"]), ("t2", &["t1"])]);
        assert!(g.levels().is_none());
    }

    #[test]
    fn transitive_closures() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"]), ("d", &["a"])]);
        let deps = g.transitive_dependencies("c");
        assert_eq!(deps, HashSet::from(["a".to_string(), "b".to_string()]));

        let dependents = g.transitive_dependents("a");
        assert_eq!(
            dependents,
            HashSet::from(["b".to_string(), "c".to_string(), "d".to_string()])
        );
    }

    #[test]
    fn readiness_unblocks_incrementally() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        let mut tracker = ReadinessTracker::new(g);

        assert_eq!(tracker.ready_now(), vec!["a"]);
        assert!(!tracker.is_ready("d"));

        let unblocked = tracker.mark_completed("a");
        assert_eq!(unblocked, vec!["b", "c"]);

        // d needs both b and c.
        assert!(tracker.mark_completed("b").is_empty());
        assert_eq!(tracker.mark_completed("c"), vec!["d"]);
    }

    #[test]
    fn mark_completed_is_idempotent() {
        let g = graph(&[("a", &[]), ("b", &["a"])]);
        let mut tracker = ReadinessTracker::new(g);
        assert_eq!(tracker.mark_completed("a"), vec!["b"]);
        assert!(tracker.mark_completed("a").is_empty());
    }
}
