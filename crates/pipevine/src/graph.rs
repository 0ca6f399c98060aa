/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Low-level representation of task dependencies.
//!
//! [`DependencyGraph`] tracks tasks as nodes of a directed graph and their
//! `depends_on` relationships as edges, providing cycle detection, dependent
//! and descendant queries, and parallel execution planning. The validator
//! builds one from every parsed pipeline; the executor builds one per run to
//! drive ready-set computation and failure propagation.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::is_cyclic_directed;
use petgraph::{Directed, Graph};

/// Directed graph of task ids, with edges pointing from a task to each of
/// its dependencies.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashSet<String>,
    edges: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Create a new empty dependency graph
    pub fn new() -> Self {
        Self {
            nodes: HashSet::new(),
            edges: HashMap::new(),
        }
    }

    /// Add a node (task) to the graph
    pub fn add_node(&mut self, node_id: String) {
        self.nodes.insert(node_id.clone());
        self.edges.entry(node_id).or_default();
    }

    /// Add an edge recording that `from` depends on `to`
    pub fn add_edge(&mut self, from: String, to: String) {
        self.nodes.insert(from.clone());
        self.nodes.insert(to.clone());
        self.edges.entry(from).or_default().push(to);
    }

    /// Whether the graph contains the given node
    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains(node_id)
    }

    /// Get dependencies for a task
    pub fn dependencies(&self, node_id: &str) -> &[String] {
        self.edges.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Get tasks that depend directly on the given task
    pub fn dependents(&self, node_id: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter_map(|(k, deps)| {
                if deps.iter().any(|d| d == node_id) {
                    Some(k.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Get every task that transitively depends on the given task.
    ///
    /// Used by the executor to mark the descendants of a failed task as
    /// skipped.
    pub fn descendants(&self, node_id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<String> = self.dependents(node_id).into();

        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.dependents(&next));
            }
        }

        seen.into_iter().collect()
    }

    /// Tasks with neither dependencies nor dependents.
    ///
    /// A valid pipeline has at most one of these; two or more mean the
    /// declaration contains disconnected entry points.
    pub fn isolated(&self) -> Vec<String> {
        let depended_on: HashSet<&String> = self.edges.values().flatten().collect();

        let mut isolated: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| self.dependencies(n).is_empty() && !depended_on.contains(*n))
            .cloned()
            .collect();
        isolated.sort();
        isolated
    }

    /// Check if the graph contains cycles
    pub fn has_cycles(&self) -> bool {
        let mut graph = Graph::<String, (), Directed>::new();
        let mut node_indices = HashMap::new();

        for node in &self.nodes {
            let index = graph.add_node(node.clone());
            node_indices.insert(node.clone(), index);
        }

        for (from, deps) in &self.edges {
            if let Some(&from_index) = node_indices.get(from) {
                for dep in deps {
                    if let Some(&dep_index) = node_indices.get(dep) {
                        graph.add_edge(dep_index, from_index, ());
                    }
                }
            }
        }

        is_cyclic_directed(&graph)
    }

    /// Collect every cycle reachable in the graph.
    ///
    /// The search continues past the first back edge so that a declaration
    /// with several independent cycles reports all of them, one path per
    /// cycle. Paths start and end on the revisited node.
    pub fn find_cycles(&self) -> Vec<Vec<String>> {
        let mut visited = HashSet::new();
        let mut cycles = Vec::new();

        let mut nodes: Vec<&String> = self.nodes.iter().collect();
        nodes.sort();

        for node in nodes {
            if !visited.contains(node) {
                let mut rec_stack = HashSet::new();
                let mut path = Vec::new();
                self.dfs_cycles(node, &mut visited, &mut rec_stack, &mut path, &mut cycles);
            }
        }

        cycles
    }

    fn dfs_cycles(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        visited.insert(node.to_string());
        rec_stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(deps) = self.edges.get(node) {
            for dep in deps {
                if !visited.contains(dep) {
                    self.dfs_cycles(dep, visited, rec_stack, path, cycles);
                } else if rec_stack.contains(dep) {
                    let cycle_start = path.iter().position(|x| x == dep).unwrap_or(0);
                    let mut cycle = path[cycle_start..].to_vec();
                    cycle.push(dep.clone());
                    cycles.push(cycle);
                }
            }
        }

        rec_stack.remove(node);
        path.pop();
    }

    /// Get execution levels (tasks that can run in parallel)
    ///
    /// Returns tasks grouped by execution level, where all tasks in a level
    /// can run in parallel with each other. Fails only on cyclic graphs,
    /// where no level assignment exists.
    pub fn execution_levels(&self) -> Option<Vec<Vec<String>>> {
        if self.has_cycles() {
            return None;
        }

        let mut levels = Vec::new();
        let mut remaining: HashSet<String> = self.nodes.clone();
        let mut completed: HashSet<String> = HashSet::new();

        while !remaining.is_empty() {
            let mut current_level: Vec<String> = remaining
                .iter()
                .filter(|id| {
                    self.dependencies(id)
                        .iter()
                        .all(|dep| completed.contains(dep))
                })
                .cloned()
                .collect();
            current_level.sort();

            for task_id in &current_level {
                remaining.remove(task_id);
                completed.insert(task_id.clone());
            }

            levels.push(current_level);
        }

        Some(levels)
    }
}
