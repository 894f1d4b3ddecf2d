//! Dependency graph validation for task groups
//!
//! Built once when a session is opened. Rejects duplicate ids, cycles, and
//! groups that depend on a group scheduled in a later wave (which could never
//! become ready). Dependencies on ids outside the session are kept as
//! external inputs; groups waiting on them lead to an awaiting-clarification
//! pause rather than an error.

use std::collections::{BTreeSet, HashMap};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use thiserror::Error;

use crate::state::{GroupId, TaskGroup};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate group id: {0}")]
    DuplicateGroup(GroupId),

    #[error("dependency cycle through group {0}")]
    Cycle(GroupId),

    #[error("group {group} (wave {wave}) depends on {dependency} in later wave {dependency_wave}")]
    WaveInversion {
        group: GroupId,
        wave: u32,
        dependency: GroupId,
        dependency_wave: u32,
    },
}

/// Validated dependency graph. Edges point from a dependency to its dependents.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<GroupId, ()>,
    index: HashMap<GroupId, NodeIndex>,
    external: BTreeSet<GroupId>,
}

impl DependencyGraph {
    pub fn build(groups: &[TaskGroup]) -> Result<Self, GraphError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut waves = HashMap::new();

        for group in groups {
            if index.contains_key(&group.id) {
                return Err(GraphError::DuplicateGroup(group.id.clone()));
            }
            index.insert(group.id.clone(), graph.add_node(group.id.clone()));
            waves.insert(group.id.clone(), group.wave);
        }

        let mut external = BTreeSet::new();
        for group in groups {
            let to = index[&group.id];
            for dep in &group.dependencies {
                match index.get(dep) {
                    Some(&from) => {
                        let dependency_wave = waves[dep];
                        if dependency_wave > group.wave {
                            return Err(GraphError::WaveInversion {
                                group: group.id.clone(),
                                wave: group.wave,
                                dependency: dep.clone(),
                                dependency_wave,
                            });
                        }
                        graph.add_edge(from, to, ());
                    }
                    None => {
                        external.insert(dep.clone());
                    }
                }
            }
        }

        toposort(&graph, None).map_err(|cycle| GraphError::Cycle(graph[cycle.node_id()].clone()))?;

        Ok(Self {
            graph,
            index,
            external,
        })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Ids referenced as dependencies but not part of the session
    pub fn external_dependencies(&self) -> &BTreeSet<GroupId> {
        &self.external
    }

    /// Groups that directly depend on `group_id`
    pub fn dependents(&self, group_id: &str) -> Vec<GroupId> {
        let Some(&node) = self.index.get(group_id) else {
            return Vec::new();
        };
        let mut out: Vec<GroupId> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .map(|n| self.graph[n].clone())
            .collect();
        out.sort();
        out
    }

    /// Every group in an order where dependencies come first
    pub fn topological_order(&self) -> Vec<GroupId> {
        toposort(&self.graph, None)
            .map(|nodes| nodes.into_iter().map(|n| self.graph[n].clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_graph_orders_dependencies_first() {
        let groups = vec![
            TaskGroup::new("api", "API").depends_on("model").with_wave(1),
            TaskGroup::new("model", "Model"),
            TaskGroup::new("docs", "Docs").depends_on("api").with_wave(1),
        ];
        let graph = DependencyGraph::build(&groups).unwrap();
        let order = graph.topological_order();
        let pos = |id: &str| order.iter().position(|g| g == id).unwrap();
        assert!(pos("model") < pos("api"));
        assert!(pos("api") < pos("docs"));
        assert_eq!(graph.dependents("model"), vec!["api".to_string()]);
    }

    #[test]
    fn test_cycle_rejected() {
        let groups = vec![
            TaskGroup::new("a", "A").depends_on("b"),
            TaskGroup::new("b", "B").depends_on("a"),
        ];
        assert!(matches!(
            DependencyGraph::build(&groups),
            Err(GraphError::Cycle(_))
        ));
    }

    #[test]
    fn test_duplicate_rejected() {
        let groups = vec![TaskGroup::new("a", "A"), TaskGroup::new("a", "again")];
        assert_eq!(
            DependencyGraph::build(&groups).unwrap_err(),
            GraphError::DuplicateGroup("a".into())
        );
    }

    #[test]
    fn test_wave_inversion_rejected() {
        let groups = vec![
            TaskGroup::new("early", "Early").depends_on("late"),
            TaskGroup::new("late", "Late").with_wave(2),
        ];
        assert!(matches!(
            DependencyGraph::build(&groups),
            Err(GraphError::WaveInversion { .. })
        ));
    }

    #[test]
    fn test_external_dependencies_recorded() {
        let groups = vec![TaskGroup::new("a", "A").depends_on("vendor-sdk")];
        let graph = DependencyGraph::build(&groups).unwrap();
        assert!(graph.external_dependencies().contains("vendor-sdk"));
    }
}
