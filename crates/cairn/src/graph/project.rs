//! In-memory dependency graph of a single project.
//!
//! # Edge Direction
//!
//! Edges point from **dependent -> dependency**: `a -> b` means `a` depends on
//! `b` and cannot be worked on until `b` is completed. Outgoing edges are an
//! issue's dependencies, incoming edges its dependents.

use crate::domain::{IssueId, IssueStatus};
use crate::error::{Error, Result};
use petgraph::algo;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

/// Acyclic dependency graph of one project.
#[derive(Debug, Clone, Default)]
pub struct ProjectGraph {
    graph: DiGraphMap<IssueId, ()>,
}

impl ProjectGraph {
    /// An empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from stored edges.
    ///
    /// # Errors
    ///
    /// Returns `Error::CycleDetected` or `Error::SelfDependency` if the edges
    /// are not a DAG.
    pub fn from_edges(edges: impl IntoIterator<Item = (IssueId, IssueId)>) -> Result<Self> {
        let mut graph = Self::new();
        for (issue, depends_on) in edges {
            graph.insert(issue, depends_on)?;
        }
        Ok(graph)
    }

    /// Number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns `true` if `issue` directly depends on `depends_on`.
    #[must_use]
    pub fn contains_edge(&self, issue: IssueId, depends_on: IssueId) -> bool {
        self.graph.contains_edge(issue, depends_on)
    }

    /// Returns `true` if adding `issue -> depends_on` would close a cycle.
    ///
    /// That is the case exactly when `issue` is already reachable from
    /// `depends_on`.
    #[must_use]
    pub fn would_create_cycle(&self, issue: IssueId, depends_on: IssueId) -> bool {
        if issue == depends_on {
            return true;
        }
        if !self.graph.contains_node(issue) || !self.graph.contains_node(depends_on) {
            return false;
        }
        algo::has_path_connecting(&self.graph, depends_on, issue, None)
    }

    /// Add `issue -> depends_on`. Returns `false` if the edge already existed.
    ///
    /// # Errors
    ///
    /// - `Error::SelfDependency` if both ends are the same issue
    /// - `Error::CycleDetected` if the edge would close a cycle
    pub fn insert(&mut self, issue: IssueId, depends_on: IssueId) -> Result<bool> {
        if issue == depends_on {
            return Err(Error::SelfDependency(issue));
        }
        if self.contains_edge(issue, depends_on) {
            return Ok(false);
        }
        if self.would_create_cycle(issue, depends_on) {
            return Err(Error::CycleDetected { issue, depends_on });
        }
        self.graph.add_edge(issue, depends_on, ());
        Ok(true)
    }

    /// Remove `issue -> depends_on`. Returns `false` if it was absent.
    pub fn remove(&mut self, issue: IssueId, depends_on: IssueId) -> bool {
        self.graph.remove_edge(issue, depends_on).is_some()
    }

    /// Drop an issue and every edge touching it.
    pub fn remove_issue(&mut self, issue: IssueId) {
        self.graph.remove_node(issue);
    }

    /// Direct dependencies of `issue`, ordered by id.
    #[must_use]
    pub fn dependencies(&self, issue: IssueId) -> Vec<IssueId> {
        self.sorted_neighbors(issue, Direction::Outgoing)
    }

    /// Issues that directly depend on `issue`, ordered by id.
    #[must_use]
    pub fn dependents(&self, issue: IssueId) -> Vec<IssueId> {
        self.sorted_neighbors(issue, Direction::Incoming)
    }

    fn sorted_neighbors(&self, issue: IssueId, direction: Direction) -> Vec<IssueId> {
        if !self.graph.contains_node(issue) {
            return Vec::new();
        }
        let mut ids: Vec<IssueId> = self.graph.neighbors_directed(issue, direction).collect();
        ids.sort_unstable();
        ids
    }

    /// Every issue that depends on `issue`, directly or transitively, in
    /// breadth-first order with ids sorted inside each level.
    #[must_use]
    pub fn transitive_dependents(&self, issue: IssueId) -> Vec<IssueId> {
        let mut result = Vec::new();
        let mut visited = HashSet::from([issue]);
        let mut queue = VecDeque::from([issue]);

        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(current) {
                if visited.insert(dependent) {
                    result.push(dependent);
                    queue.push_back(dependent);
                }
            }
        }

        result
    }

    /// Direct dependencies of `issue` that are not completed.
    ///
    /// A dependency missing from `statuses` counts as unfinished.
    #[must_use]
    pub fn blockers(&self, issue: IssueId, statuses: &HashMap<IssueId, IssueStatus>) -> Vec<IssueId> {
        self.dependencies(issue)
            .into_iter()
            .filter(|dep| statuses.get(dep) != Some(&IssueStatus::Completed))
            .collect()
    }

    /// Returns `true` if every direct dependency of `issue` is completed.
    /// An issue without dependencies is always ready.
    #[must_use]
    pub fn is_ready(&self, issue: IssueId, statuses: &HashMap<IssueId, IssueStatus>) -> bool {
        self.blockers(issue, statuses).is_empty()
    }

    /// Returns `true` if the graph has no directed cycle.
    #[must_use]
    pub fn is_acyclic(&self) -> bool {
        !algo::is_cyclic_directed(&self.graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn id(n: i64) -> IssueId {
        IssueId(n)
    }

    #[test]
    fn test_insert_rejects_cycle_and_leaves_graph_unchanged() {
        let mut graph = ProjectGraph::new();
        assert!(graph.insert(id(5), id(7)).unwrap());

        let err = graph.insert(id(7), id(5)).unwrap_err();
        assert!(matches!(
            err,
            Error::CycleDetected {
                issue: IssueId(7),
                depends_on: IssueId(5)
            }
        ));
        assert_eq!(graph.edge_count(), 1);
        assert!(graph.contains_edge(id(5), id(7)));
    }

    #[test]
    fn test_insert_rejects_longer_cycle() {
        let mut graph = ProjectGraph::from_edges([(id(1), id(2)), (id(2), id(3))]).unwrap();
        assert!(graph.would_create_cycle(id(3), id(1)));
        assert!(graph.insert(id(3), id(1)).is_err());
        assert!(!graph.would_create_cycle(id(1), id(3)));
    }

    #[test]
    fn test_self_dependency() {
        let mut graph = ProjectGraph::new();
        assert!(matches!(
            graph.insert(id(1), id(1)),
            Err(Error::SelfDependency(IssueId(1)))
        ));
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let mut graph = ProjectGraph::new();
        assert!(graph.insert(id(1), id(2)).unwrap());
        assert!(!graph.insert(id(1), id(2)).unwrap());
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_transitive_dependents_breadth_first() {
        // 2 and 3 depend on 1; 4 depends on 3; 5 depends on 4 and 2
        let graph = ProjectGraph::from_edges([
            (id(2), id(1)),
            (id(3), id(1)),
            (id(4), id(3)),
            (id(5), id(4)),
            (id(5), id(2)),
        ])
        .unwrap();
        assert_eq!(
            graph.transitive_dependents(id(1)),
            vec![id(2), id(3), id(5), id(4)]
        );
        assert!(graph.transitive_dependents(id(5)).is_empty());
        assert!(graph.transitive_dependents(id(99)).is_empty());
    }

    #[rstest]
    #[case::no_dependencies(None, true)]
    #[case::dependency_completed(Some(IssueStatus::Completed), true)]
    #[case::dependency_open(Some(IssueStatus::Open), false)]
    #[case::dependency_in_progress(Some(IssueStatus::InProgress), false)]
    #[case::dependency_blocked(Some(IssueStatus::Blocked), false)]
    fn test_is_ready(#[case] dep_status: Option<IssueStatus>, #[case] expected: bool) {
        let mut graph = ProjectGraph::new();
        let mut statuses = HashMap::from([(id(10), IssueStatus::Open)]);
        if let Some(dep_status) = dep_status {
            graph.insert(id(10), id(11)).unwrap();
            statuses.insert(id(11), dep_status);
        }
        assert_eq!(graph.is_ready(id(10), &statuses), expected);
    }

    #[test]
    fn test_unknown_dependency_counts_as_blocker() {
        let graph = ProjectGraph::from_edges([(id(1), id(2))]).unwrap();
        let statuses = HashMap::from([(id(1), IssueStatus::Open)]);
        assert_eq!(graph.blockers(id(1), &statuses), vec![id(2)]);
    }

    #[test]
    fn test_remove_issue_drops_incident_edges() {
        let mut graph = ProjectGraph::from_edges([(id(1), id(2)), (id(3), id(2))]).unwrap();
        graph.remove_issue(id(2));
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.dependents(id(2)).is_empty());
    }

    proptest! {
        #[test]
        fn prop_random_inserts_keep_graph_acyclic(
            edges in prop::collection::vec((1i64..12, 1i64..12), 0..60)
        ) {
            let mut graph = ProjectGraph::new();
            for (a, b) in edges {
                let before = graph.edge_count();
                match graph.insert(id(a), id(b)) {
                    Ok(_) => prop_assert!(graph.contains_edge(id(a), id(b))),
                    Err(_) => prop_assert_eq!(graph.edge_count(), before),
                }
                prop_assert!(graph.is_acyclic());
            }
        }

        #[test]
        fn prop_ready_issues_have_only_completed_dependencies(
            edges in prop::collection::vec((1i64..10, 1i64..10), 0..40),
            completed in prop::collection::hash_set(1i64..10, 0..10),
        ) {
            let mut graph = ProjectGraph::new();
            for (a, b) in edges {
                let _ = graph.insert(id(a), id(b));
            }
            let statuses: HashMap<IssueId, IssueStatus> = (1..10)
                .map(|n| {
                    let status = if completed.contains(&n) { IssueStatus::Completed } else { IssueStatus::Open };
                    (id(n), status)
                })
                .collect();

            for n in 1..10 {
                if graph.is_ready(id(n), &statuses) {
                    for dep in graph.dependencies(id(n)) {
                        prop_assert_eq!(statuses[&dep], IssueStatus::Completed);
                    }
                }
            }
        }
    }
}
