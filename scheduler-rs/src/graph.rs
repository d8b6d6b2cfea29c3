//! Task graph: units, dependency validation and topological ordering.
//!
//! Units are nodes of a `petgraph` digraph; an edge `a -> b` means `b`
//! depends on `a`. Edges are added as soon as both ends exist, so units may
//! be added in any order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tracing::debug;

use error_handling_rs::{Error, Result};

use crate::unit::WorkUnit;

/// A set of work units with declared dependencies and a shared context
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    /// Node indices follow insertion order, which decides ordering ties
    graph: DiGraph<WorkUnit, ()>,
    id_to_index: HashMap<String, NodeIndex>,
    context: BTreeMap<String, String>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `unit`; returns false and leaves the graph unchanged when a unit
    /// with the same id already exists
    pub fn add_unit(&mut self, unit: WorkUnit) -> bool {
        if self.id_to_index.contains_key(&unit.id) {
            debug!(unit_id = %unit.id, "Unit already present, ignoring");
            return false;
        }

        let id = unit.id.clone();
        let dependencies = unit.dependencies.clone();
        let index = self.graph.add_node(unit);
        self.id_to_index.insert(id.clone(), index);

        for dep in &dependencies {
            if let Some(&from) = self.id_to_index.get(dep) {
                self.graph.update_edge(from, index, ());
            }
        }

        let waiting: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&other| other != index && self.graph[other].dependencies.contains(&id))
            .collect();
        for dependent in waiting {
            self.graph.update_edge(index, dependent, ());
        }
        true
    }

    pub fn unit(&self, unit_id: &str) -> Option<&WorkUnit> {
        self.id_to_index
            .get(unit_id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Units in insertion order
    pub fn units(&self) -> impl Iterator<Item = &WorkUnit> + '_ {
        self.graph
            .node_indices()
            .filter_map(move |index| self.graph.node_weight(index))
    }

    /// Ids of the units `unit_id` depends on that are in the graph
    pub fn dependencies_of(&self, unit_id: &str) -> Vec<String> {
        self.neighbors(unit_id, Direction::Incoming)
    }

    /// Ids of the units that depend directly on `unit_id`
    pub fn dependents_of(&self, unit_id: &str) -> Vec<String> {
        self.neighbors(unit_id, Direction::Outgoing)
    }

    fn neighbors(&self, unit_id: &str, direction: Direction) -> Vec<String> {
        let Some(&index) = self.id_to_index.get(unit_id) else {
            return Vec::new();
        };
        self.sorted_neighbors(index, direction)
            .into_iter()
            .map(|n| self.graph[n].id.clone())
            .collect()
    }

    /// Neighbors in insertion order; petgraph yields newest edges first
    fn sorted_neighbors(&self, index: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> = self.graph.neighbors_directed(index, direction).collect();
        neighbors.sort();
        neighbors.dedup();
        neighbors
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    pub fn set_context(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.context.insert(key.into(), value.into());
    }

    pub(crate) fn merge_context(&mut self, context: BTreeMap<String, String>) {
        self.context.extend(context);
    }

    pub(crate) fn replace_context(&mut self, context: BTreeMap<String, String>) {
        self.context = context;
    }

    /// Copies of every unit, in insertion order, for a run to work on
    pub(crate) fn checkout_units(&self) -> Vec<WorkUnit> {
        self.units().cloned().collect()
    }

    /// Writes units returned by a run back over their nodes
    pub(crate) fn restore_units(&mut self, units: impl IntoIterator<Item = WorkUnit>) {
        for unit in units {
            if let Some(&index) = self.id_to_index.get(&unit.id) {
                self.graph[index] = unit;
            }
        }
    }

    /// Every problem that would prevent a run: dependencies on unknown units,
    /// then dependency cycles
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        for unit in self.units() {
            for dep in &unit.dependencies {
                if !self.id_to_index.contains_key(dep) {
                    issues.push(format!(
                        "unit '{}' depends on unknown unit '{}'",
                        unit.id, dep
                    ));
                }
            }
        }

        let mut cycles: Vec<Vec<NodeIndex>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1 || self.graph.find_edge(component[0], component[0]).is_some()
            })
            .collect();
        for component in &mut cycles {
            component.sort();
        }
        cycles.sort();

        for component in cycles {
            let path = self.cycle_path(&component);
            issues.push(format!("dependency cycle: {}", path.join(" -> ")));
        }

        issues
    }

    /// Walks dependencies inside one strongly connected component from its
    /// earliest unit until the walk returns to a unit already on the path
    fn cycle_path(&self, component: &[NodeIndex]) -> Vec<&str> {
        let mut path = vec![component[0]];
        loop {
            let current = path[path.len() - 1];
            let Some(next) = self
                .sorted_neighbors(current, Direction::Incoming)
                .into_iter()
                .find(|n| component.contains(n))
            else {
                break;
            };
            let closed = path.contains(&next);
            path.push(next);
            if closed {
                break;
            }
        }

        let start = path
            .iter()
            .position(|n| Some(n) == path.last())
            .unwrap_or(0);
        path[start..].iter().map(|&n| self.graph[n].id.as_str()).collect()
    }

    /// Topological order of unit ids. Among units that are ready at the
    /// same time, the one added first comes first.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|index| (index, self.sorted_neighbors(index, Direction::Incoming).len()))
            .collect();

        let mut ready: BTreeSet<NodeIndex> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(&index, _)| index)
            .collect();
        let mut order = Vec::with_capacity(self.graph.node_count());

        while let Some(next) = ready.pop_first() {
            order.push(self.graph[next].id.clone());
            for dependent in self.sorted_neighbors(next, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() < self.graph.node_count() {
            let stuck: Vec<&str> = self
                .graph
                .node_indices()
                .filter(|index| in_degree.get(index).is_some_and(|&d| d > 0))
                .map(|index| self.graph[index].id.as_str())
                .collect();
            return Err(Error::Graph {
                issues: vec![format!("units in a dependency cycle: {}", stuck.join(", "))],
            });
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: &str, deps: &[&str]) -> WorkUnit {
        deps.iter()
            .fold(WorkUnit::new(id, "echo", id), |u, d| u.depends_on(*d))
    }

    fn graph(units: Vec<WorkUnit>) -> TaskGraph {
        let mut graph = TaskGraph::new();
        for u in units {
            graph.add_unit(u);
        }
        graph
    }

    #[test]
    fn test_add_unit_is_idempotent_on_id() {
        let mut graph = TaskGraph::new();
        assert!(graph.add_unit(WorkUnit::new("a", "echo", "first")));
        assert!(!graph.add_unit(WorkUnit::new("a", "echo", "second")));
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.unit("a").unwrap().content, "first");
    }

    #[test]
    fn test_validate_reports_missing_dependency() {
        let graph = graph(vec![unit("a", &["ghost"])]);
        assert_eq!(graph.validate(), vec!["unit 'a' depends on unknown unit 'ghost'".to_string()]);
    }

    #[test]
    fn test_validate_reports_cycles() {
        let graph = graph(vec![unit("a", &["c"]), unit("b", &["a"]), unit("c", &["b"])]);
        let issues = graph.validate();
        assert_eq!(issues, vec!["dependency cycle: a -> c -> b -> a".to_string()]);
        assert!(matches!(graph.execution_order(), Err(Error::Graph { .. })));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let graph = graph(vec![unit("loop", &["loop"])]);
        assert_eq!(graph.validate().len(), 1);
    }

    #[test]
    fn test_valid_graph_has_no_issues() {
        let graph = graph(vec![unit("a", &[]), unit("b", &["a"]), unit("c", &["a", "b"])]);
        assert!(graph.validate().is_empty());
    }

    #[test]
    fn test_execution_order_respects_dependencies() {
        let graph = graph(vec![
            unit("report", &["summary", "stats"]),
            unit("fetch", &[]),
            unit("summary", &["fetch"]),
            unit("stats", &["fetch"]),
        ]);

        let order = graph.execution_order().unwrap();
        let position = |id: &str| order.iter().position(|o| o == id).unwrap();
        for u in graph.units() {
            for dep in &u.dependencies {
                assert!(position(dep) < position(&u.id), "{} before {}", dep, u.id);
            }
        }
        assert_eq!(order, vec!["fetch", "summary", "stats", "report"]);
    }

    #[test]
    fn test_execution_order_ties_follow_insertion_order() {
        let graph = graph(vec![unit("z", &[]), unit("m", &[]), unit("a", &[])]);
        assert_eq!(graph.execution_order().unwrap(), vec!["z", "m", "a"]);
        assert_eq!(graph.execution_order().unwrap(), graph.execution_order().unwrap());
    }

    #[test]
    fn test_restore_units_keeps_insertion_order() {
        let mut graph = graph(vec![unit("a", &[]), unit("b", &[]), unit("c", &[])]);
        let mut units = graph.checkout_units();
        units.reverse();
        units[0].content = "changed".to_string();
        graph.restore_units(units);
        let ids: Vec<&str> = graph.units().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(graph.unit("c").unwrap().content, "changed");
    }

    #[test]
    fn test_edges_added_in_any_order() {
        let graph = graph(vec![unit("report", &["fetch"]), unit("fetch", &[]), unit("audit", &["fetch"])]);
        assert_eq!(graph.dependencies_of("report"), vec!["fetch"]);
        assert_eq!(graph.dependents_of("fetch"), vec!["report", "audit"]);
        assert!(graph.dependencies_of("ghost").is_empty());
    }

    #[test]
    fn test_validate_reports_each_cycle_once() {
        let graph = graph(vec![
            unit("a", &["b"]),
            unit("b", &["a"]),
            unit("ok", &[]),
            unit("x", &["y"]),
            unit("y", &["x", "ok"]),
        ]);
        assert_eq!(
            graph.validate(),
            vec![
                "dependency cycle: a -> b -> a".to_string(),
                "dependency cycle: x -> y -> x".to_string(),
            ]
        );
    }
}
