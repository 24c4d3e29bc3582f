//! Task dependency graph.
//!
//! `TaskGraph` validates a declared task list (unique ids, known
//! dependencies, no cycles) and reports its size for the decomposition
//! events. Edges point from a dependency to its dependent.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use petgraph::algo::kosaraju_scc;
use petgraph::graph::DiGraph;
use std::collections::HashMap;

/// Validated dependency graph over task ids.
pub struct TaskGraph {
    graph: DiGraph<TaskId, ()>,
    /// Declaration order, used to keep every traversal stable.
    order: HashMap<TaskId, usize>,
}

impl TaskGraph {
    /// Build and validate the graph for `tasks`.
    ///
    /// # Errors
    /// - `DuplicateTask` if two tasks share an id
    /// - `UnknownDependency` if a dependency names no declared task
    /// - `DependencyCycle` if the dependencies form a cycle
    pub fn build(tasks: &[Task]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut order = HashMap::new();

        for (position, task) in tasks.iter().enumerate() {
            if index.contains_key(&task.id) {
                return Err(Error::DuplicateTask(task.id.to_string()));
            }
            let node = graph.add_node(task.id.clone());
            index.insert(task.id.clone(), node);
            order.insert(task.id.clone(), position);
        }

        for task in tasks {
            let to = index[&task.id];
            for dep in &task.dependencies {
                let from = index.get(dep).ok_or_else(|| Error::UnknownDependency {
                    task: task.id.to_string(),
                    dependency: dep.to_string(),
                })?;
                graph.update_edge(*from, to, ());
            }
        }

        let built = Self { graph, order };
        if let Some(cycle) = built.find_cycle() {
            return Err(Error::DependencyCycle(cycle));
        }
        Ok(built)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Return one cycle as a closed path (`a -> b -> a`), if any.
    fn find_cycle(&self) -> Option<Vec<String>> {
        for component in kosaraju_scc(&self.graph) {
            let looped = component.len() > 1
                || self
                    .graph
                    .find_edge(component[0], component[0])
                    .is_some();
            if !looped {
                continue;
            }
            let mut ids: Vec<&TaskId> = component.iter().map(|n| &self.graph[*n]).collect();
            ids.sort_by_key(|t| self.order[*t]);
            let mut path: Vec<String> = ids.iter().map(|t| t.to_string()).collect();
            path.push(ids[0].to_string());
            return Some(path);
        }
        None
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
