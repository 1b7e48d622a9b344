// Unit Dependency Graph
// Orders the units of a scenario execution and detects cycles

use crate::orchestrator::models::ScenarioExecution;

use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Errors raised while building or ordering a dependency graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("circular dependency detected: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    #[error("unit '{unit}' depends on unknown unit '{dependency}'")]
    UnknownDependency { unit: String, dependency: String },

    #[error("dependencies declared for unknown unit '{0}'")]
    UnknownUnit(String),

    #[error("duplicate unit name '{0}'")]
    DuplicateUnit(String),
}

/// Dependency graph over the units of one scenario execution
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Unit names in declaration order
    nodes: Vec<String>,
    indices: HashMap<String, usize>,
    /// Dependencies of each node, parallel to `nodes`
    dependencies: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph from unit-level `depends_on` and the execution-level
    /// `dependencies` map. Unknown references and duplicate names are rejected;
    /// cycles are only reported by [`DependencyGraph::topological_order`].
    pub fn build(execution: &ScenarioExecution) -> Result<Self, GraphError> {
        let mut nodes = Vec::with_capacity(execution.units.len());
        let mut indices = HashMap::new();

        for (i, unit) in execution.units.iter().enumerate() {
            if indices.insert(unit.name.clone(), i).is_some() {
                return Err(GraphError::DuplicateUnit(unit.name.clone()));
            }
            nodes.push(unit.name.clone());
        }

        let mut dependencies = Vec::with_capacity(nodes.len());
        for unit in &execution.units {
            let mut deps: Vec<String> = Vec::new();
            let declared = execution
                .dependencies
                .get(&unit.name)
                .into_iter()
                .flatten()
                .chain(unit.depends_on.iter());

            for dep in declared {
                if !indices.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        unit: unit.name.clone(),
                        dependency: dep.clone(),
                    });
                }
                if !deps.contains(dep) {
                    deps.push(dep.clone());
                }
            }
            dependencies.push(deps);
        }

        for unit in execution.dependencies.keys() {
            if !indices.contains_key(unit) {
                return Err(GraphError::UnknownUnit(unit.clone()));
            }
        }

        Ok(Self {
            nodes,
            indices,
            dependencies,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Unit names in declaration order
    pub fn names(&self) -> &[String] {
        &self.nodes
    }

    pub fn dependencies(&self, unit: &str) -> &[String] {
        self.indices
            .get(unit)
            .map(|&i| self.dependencies[i].as_slice())
            .unwrap_or(&[])
    }

    /// Units that declare a dependency on `unit`
    pub fn dependents(&self, unit: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .zip(&self.dependencies)
            .filter(|(_, deps)| deps.iter().any(|d| d == unit))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Depth-first topological order. Units without dependencies keep their
    /// declaration order; every unit comes after all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let mut visited = HashSet::new();
        let mut rec_stack = Vec::new();
        let mut order = Vec::with_capacity(self.nodes.len());

        for i in 0..self.nodes.len() {
            if !visited.contains(&i) {
                self.visit(i, &mut visited, &mut rec_stack, &mut order)?;
            }
        }

        Ok(order)
    }

    fn visit(
        &self,
        index: usize,
        visited: &mut HashSet<usize>,
        rec_stack: &mut Vec<usize>,
        order: &mut Vec<String>,
    ) -> Result<(), GraphError> {
        visited.insert(index);
        rec_stack.push(index);

        for dep in &self.dependencies[index] {
            let Some(&dep_index) = self.indices.get(dep) else {
                continue;
            };
            if let Some(pos) = rec_stack.iter().position(|&i| i == dep_index) {
                let mut cycle: Vec<String> = rec_stack[pos..]
                    .iter()
                    .map(|&i| self.nodes[i].clone())
                    .collect();
                cycle.push(dep.clone());
                return Err(GraphError::CircularDependency(cycle));
            }
            if !visited.contains(&dep_index) {
                self.visit(dep_index, visited, rec_stack, order)?;
            }
        }

        rec_stack.pop();
        order.push(self.nodes[index].clone());
        Ok(())
    }

    /// Units not yet settled whose dependencies have all completed
    pub fn ready_set(&self, completed: &HashSet<String>, settled: &HashSet<String>) -> Vec<String> {
        self.nodes
            .iter()
            .zip(&self.dependencies)
            .filter(|(name, deps)| {
                !settled.contains(*name) && deps.iter().all(|d| completed.contains(d))
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Execution levels: each level only depends on earlier levels
    pub fn levels(&self) -> Result<Vec<Vec<String>>, GraphError> {
        let order = self.topological_order()?;
        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut levels: Vec<Vec<String>> = Vec::new();

        for name in &order {
            let level = self
                .dependencies(name)
                .iter()
                .filter_map(|d| depth.get(d.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(name.as_str(), level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(name.clone());
        }

        Ok(levels)
    }
}
