//! Task graph for dependency management.
//!
//! [`TaskGraph`] stores tasks as petgraph nodes in declaration order, with an
//! edge `dependency -> dependent` for every entry in a task's `depends_on`.
//! The structure is fixed once [`TaskGraph::build`] succeeds; only task state
//! changes afterwards.

use crate::core::task::{Task, TaskId, TaskSpec, TaskState};
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// The task dependency graph.
pub struct TaskGraph {
    graph: DiGraph<Task, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
}

/// DFS marks for cycle detection.
#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

impl TaskGraph {
    /// Build a graph from task declarations.
    ///
    /// # Errors
    /// - `DuplicateTask` if two declarations share an id
    /// - `UnknownDependency` if a dependency id is not declared
    /// - `CyclicDependency` if the dependencies form a cycle; the error
    ///   carries the cycle path, first node repeated at the end
    pub fn build(specs: Vec<TaskSpec>) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(specs.len(), specs.len());
        let mut task_index = HashMap::with_capacity(specs.len());

        for spec in specs {
            if task_index.contains_key(&spec.id) {
                return Err(Error::DuplicateTask(spec.id));
            }
            let id = spec.id.clone();
            let index = graph.add_node(Task::from_spec(spec));
            task_index.insert(id, index);
        }

        let mut edges = Vec::new();
        for index in graph.node_indices() {
            let task = &graph[index];
            for dep in &task.context_tasks {
                let dep_index =
                    task_index
                        .get(dep)
                        .ok_or_else(|| Error::UnknownDependency {
                            task: task.id.clone(),
                            dependency: dep.clone(),
                        })?;
                edges.push((*dep_index, index));
            }
        }
        for (from, to) in edges {
            graph.update_edge(from, to, ());
        }

        let built = Self { graph, task_index };
        if let Some(path) = built.find_cycle() {
            return Err(Error::CyclicDependency { path });
        }
        Ok(built)
    }

    /// Depth-first search with an explicit recursion stack.
    ///
    /// Returns the first cycle found, in dependency order.
    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        let mut stack: Vec<NodeIndex> = Vec::new();

        for start in self.graph.node_indices() {
            if marks[start.index()] == Mark::Unvisited {
                if let Some(cycle) = self.visit(start, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit(
        &self,
        node: NodeIndex,
        marks: &mut [Mark],
        stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<TaskId>> {
        marks[node.index()] = Mark::OnStack;
        stack.push(node);

        let mut next: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        next.sort();

        for succ in next {
            match marks[succ.index()] {
                Mark::OnStack => {
                    let start = stack.iter().position(|n| *n == succ).unwrap_or(0);
                    let mut path: Vec<TaskId> = stack[start..]
                        .iter()
                        .map(|n| self.graph[*n].id.clone())
                        .collect();
                    path.push(self.graph[succ].id.clone());
                    return Some(path);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(succ, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks[node.index()] = Mark::Done;
        None
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index.get(id).map(|&index| &self.graph[index])
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        let index = *self
            .task_index
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        Ok(&mut self.graph[index])
    }

    /// All tasks in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_indices().map(move |index| &self.graph[index])
    }

    /// Task ids in declaration order.
    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks().map(|t| t.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Declared dependencies of a task, in declaration order of the graph.
    pub fn dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that directly depend on the given task.
    pub fn dependents(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(index, direction).collect();
        found.sort();
        found.into_iter().map(|n| &self.graph[n]).collect()
    }

    /// Every task reachable downstream of `id`, in declaration order.
    pub fn descendants(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut frontier = vec![start];
        while let Some(node) = frontier.pop() {
            for succ in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if seen.insert(succ) {
                    frontier.push(succ);
                }
            }
        }
        let mut found: Vec<NodeIndex> = seen.into_iter().collect();
        found.sort();
        found
            .into_iter()
            .map(|n| self.graph[n].id.clone())
            .collect()
    }

    // ========== Scheduling Operations ==========

    /// Every pending task whose dependencies are all completed, in
    /// declaration order.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let task = &self.graph[index];
                if task.state != TaskState::Pending {
                    return None;
                }
                let deps_done = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| self.graph[dep].state == TaskState::Completed);
                deps_done.then_some(task)
            })
            .collect()
    }

    /// Ids of [`ready_tasks`](Self::ready_tasks).
    pub fn ready_ids(&self) -> Vec<TaskId> {
        self.ready_tasks().iter().map(|t| t.id.clone()).collect()
    }

    pub fn mark_ready(&mut self, id: &TaskId) -> Result<()> {
        self.task_mut(id)?.mark_ready()
    }

    pub fn mark_running(&mut self, id: &TaskId) -> Result<()> {
        self.task_mut(id)?.start()
    }

    pub fn mark_completed(&mut self, id: &TaskId, output: String) -> Result<()> {
        self.task_mut(id)?.complete(output)
    }

    pub fn mark_failed(&mut self, id: &TaskId, error: &str) -> Result<()> {
        self.task_mut(id)?.fail(error)
    }

    /// Output of a completed task.
    pub fn output(&self, id: &TaskId) -> Option<&str> {
        self.task(id).and_then(|t| t.output.as_deref())
    }

    /// Number of tasks not yet in a terminal state.
    pub fn pending_count(&self) -> usize {
        self.tasks().filter(|t| !t.is_finished()).count()
    }

    /// Whether every task is completed or failed.
    pub fn is_finished(&self) -> bool {
        self.tasks().all(|t| t.is_finished())
    }

    /// Tasks in an order where each comes after all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| Error::CyclicDependency {
            path: vec![self.graph[cycle.node_id()].id.clone()],
        })?;
        Ok(sorted.into_iter().map(|index| &self.graph[index]).collect())
    }

    /// Groups of tasks that become ready together if every task succeeds.
    ///
    /// Wave `n` holds tasks whose longest dependency chain has length `n`.
    pub fn waves(&self) -> Vec<Vec<TaskId>> {
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        // Build guarantees acyclicity, so toposort cannot fail here.
        let order = toposort(&self.graph, None).unwrap_or_default();
        for index in order {
            let d = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .filter_map(|dep| depth.get(&dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(index, d);
        }

        let mut waves: Vec<Vec<TaskId>> = Vec::new();
        for index in self.graph.node_indices() {
            let d = depth.get(&index).copied().unwrap_or(0);
            if waves.len() <= d {
                waves.resize_with(d + 1, Vec::new);
            }
            waves[d].push(self.graph[index].id.clone());
        }
        waves
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.len())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
