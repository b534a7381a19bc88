//! Plan validation
//!
//! Everything here is pure: a plan request is checked against the owner's
//! existing dependency graph before anything is written.

use sdk::errors::PlanValidationError;
use std::collections::{BTreeSet, HashMap, HashSet};

use super::types::ActionSpec;

/// A validated request, ready to persist
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ValidatedPlan {
    /// Spec indices in topological order
    pub order: Vec<usize>,
    /// Resolved dependency ids, per spec index
    pub depends_on: Vec<Vec<String>>,
}

/// Validate `specs` whose new action ids are `new_ids` (same order).
///
/// `existing` maps the owner's current action ids to their dependencies.
pub(crate) fn validate(
    specs: &[ActionSpec],
    new_ids: &[String],
    existing: &HashMap<String, Vec<String>>,
) -> Result<ValidatedPlan, PlanValidationError> {
    if specs.is_empty() {
        return Err(PlanValidationError::EmptyPlan);
    }

    let mut index_by_key: HashMap<&str, usize> = HashMap::with_capacity(specs.len());
    for (index, spec) in specs.iter().enumerate() {
        if index_by_key.insert(spec.key.as_str(), index).is_some() {
            return Err(PlanValidationError::DuplicateKey(spec.key.clone()));
        }
        if spec.max_attempts == Some(0) {
            return Err(PlanValidationError::InvalidMaxAttempts(spec.key.clone()));
        }
    }

    let mut depends_on = Vec::with_capacity(specs.len());
    for spec in specs {
        let mut resolved = Vec::with_capacity(spec.depends_on.len());
        let mut seen = HashSet::new();
        for dep in &spec.depends_on {
            if dep == &spec.key {
                return Err(PlanValidationError::SelfDependency(spec.key.clone()));
            }
            let id = if let Some(&index) = index_by_key.get(dep.as_str()) {
                new_ids[index].clone()
            } else if existing.contains_key(dep) {
                dep.clone()
            } else {
                return Err(PlanValidationError::UnknownDependency {
                    action: spec.key.clone(),
                    dependency: dep.clone(),
                });
            };
            if seen.insert(id.clone()) {
                resolved.push(id);
            }
        }
        depends_on.push(resolved);
    }

    // Combined graph: existing actions plus the new ones
    let mut graph: HashMap<&str, Vec<&str>> = existing
        .iter()
        .map(|(id, deps)| (id.as_str(), deps.iter().map(String::as_str).collect()))
        .collect();
    for (id, deps) in new_ids.iter().zip(&depends_on) {
        graph.insert(id.as_str(), deps.iter().map(String::as_str).collect());
    }

    if let Some(node) = detect_cycle(&graph) {
        let label = new_ids
            .iter()
            .position(|id| id == node)
            .map(|index| specs[index].key.clone())
            .unwrap_or_else(|| node.to_string());
        return Err(PlanValidationError::CycleDetected(label));
    }

    let order = topological_order(specs.len(), new_ids, &depends_on)
        .ok_or_else(|| PlanValidationError::CycleDetected(specs[0].key.clone()))?;

    Ok(ValidatedPlan { order, depends_on })
}

/// Returns a node on a cycle, if any
pub(crate) fn detect_cycle<'a>(graph: &HashMap<&'a str, Vec<&'a str>>) -> Option<&'a str> {
    fn dfs<'a>(
        node: &'a str,
        graph: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        on_stack: &mut HashSet<&'a str>,
    ) -> Option<&'a str> {
        visited.insert(node);
        on_stack.insert(node);

        if let Some(deps) = graph.get(node) {
            for &dep in deps {
                if !visited.contains(dep) {
                    if let Some(cycle_node) = dfs(dep, graph, visited, on_stack) {
                        return Some(cycle_node);
                    }
                } else if on_stack.contains(dep) {
                    return Some(dep);
                }
            }
        }

        on_stack.remove(node);
        None
    }

    let mut nodes: Vec<&str> = graph.keys().copied().collect();
    nodes.sort_unstable();

    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    for node in nodes {
        if !visited.contains(node) {
            if let Some(cycle_node) = dfs(node, graph, &mut visited, &mut on_stack) {
                return Some(cycle_node);
            }
        }
    }
    None
}

/// Kahn's algorithm over the new actions, lowest spec index first
fn topological_order(
    count: usize,
    new_ids: &[String],
    depends_on: &[Vec<String>],
) -> Option<Vec<usize>> {
    let index_by_id: HashMap<&str, usize> = new_ids
        .iter()
        .enumerate()
        .map(|(index, id)| (id.as_str(), index))
        .collect();

    let mut in_degree = vec![0usize; count];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (index, deps) in depends_on.iter().enumerate() {
        for dep in deps {
            // dependencies on existing actions do not constrain this order
            if let Some(&dep_index) = index_by_id.get(dep.as_str()) {
                in_degree[index] += 1;
                dependents[dep_index].push(index);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(count);
    while let Some(index) = ready.pop_first() {
        order.push(index);
        for &dependent in &dependents[index] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    (order.len() == count).then_some(order)
}
