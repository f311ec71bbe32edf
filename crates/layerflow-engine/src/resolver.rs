//! Dependency resolution: turns `depends_on` edges into ordered phases.
//!
//! Phases are Kahn levels: phase 0 holds every step without dependencies,
//! and a step lands in phase k when its deepest dependency is in phase k-1.
//! Within a phase, steps keep their declaration order.

use std::collections::{HashMap, HashSet};

use layerflow_core::error::{LayerflowError, Result};
use layerflow_core::graph::TaskGraph;
use layerflow_core::types::ExecutionMode;

/// Resolved execution order for a graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    /// Step ids grouped by phase.
    pub phases: Vec<Vec<String>>,
    /// Transitive dependencies of each step.
    ancestors: HashMap<String, HashSet<String>>,
}

impl ExecutionPlan {
    pub fn phase_of(&self, step_id: &str) -> Option<usize> {
        self.phases
            .iter()
            .position(|phase| phase.iter().any(|id| id == step_id))
    }

    pub fn step_count(&self) -> usize {
        self.phases.iter().map(Vec::len).sum()
    }

    /// Widest phase.
    pub fn max_width(&self) -> usize {
        self.phases.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Whether `ancestor` must finish before `step_id` may start.
    pub fn depends_transitively(&self, step_id: &str, ancestor: &str) -> bool {
        self.ancestors
            .get(step_id)
            .map_or(false, |set| set.contains(ancestor))
    }

    /// Adaptive mode picks parallel as soon as any phase has room for it;
    /// a strictly linear graph runs sequentially.
    pub fn effective_mode(&self, requested: ExecutionMode) -> ExecutionMode {
        match requested {
            ExecutionMode::Adaptive => {
                let first_wide = self.phases.first().map_or(false, |p| p.len() > 1);
                if first_wide || self.max_width() > 1 {
                    ExecutionMode::Parallel
                } else {
                    ExecutionMode::Sequential
                }
            }
            other => other,
        }
    }
}

/// Validate a graph and compute its plan. Nothing may run if this fails.
pub fn plan(graph: &TaskGraph) -> Result<ExecutionPlan> {
    graph.validate()?;
    let plan = resolve_phases(graph)?;
    check_references(graph, &plan)?;
    Ok(plan)
}

/// Group steps into phases, failing on unknown dependencies or cycles.
pub fn resolve_phases(graph: &TaskGraph) -> Result<ExecutionPlan> {
    let index: HashMap<&str, usize> = graph
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    // Deduplicated forward edges and reverse edges, by declaration index.
    let mut deps: Vec<HashSet<usize>> = vec![HashSet::new(); graph.steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); graph.steps.len()];
    for (i, step) in graph.steps.iter().enumerate() {
        for dep in &step.depends_on {
            let &d = index
                .get(dep.as_str())
                .ok_or_else(|| LayerflowError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                })?;
            if deps[i].insert(d) {
                dependents[d].push(i);
            }
        }
    }

    let mut remaining: Vec<usize> = deps.iter().map(HashSet::len).collect();
    let mut current: Vec<usize> = (0..graph.steps.len())
        .filter(|&i| remaining[i] == 0)
        .collect();
    let mut phases: Vec<Vec<usize>> = Vec::new();
    let mut placed = 0;

    while !current.is_empty() {
        let mut next = Vec::new();
        for &i in &current {
            for &dependent in &dependents[i] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        placed += current.len();
        next.sort_unstable();
        phases.push(std::mem::replace(&mut current, next));
    }

    if placed < graph.steps.len() {
        let stuck: HashSet<usize> = (0..graph.steps.len()).filter(|&i| remaining[i] > 0).collect();
        let cycle = find_cycle(&deps, &stuck)
            .into_iter()
            .map(|i| graph.steps[i].id.clone())
            .collect();
        return Err(LayerflowError::DependencyCycle { cycle });
    }

    // Phases are topological, so each dependency's set is complete before use.
    let mut ancestors: HashMap<String, HashSet<String>> = HashMap::new();
    for phase in &phases {
        for &i in phase {
            let mut set = HashSet::new();
            for &d in &deps[i] {
                let dep_id = &graph.steps[d].id;
                set.insert(dep_id.clone());
                if let Some(inherited) = ancestors.get(dep_id) {
                    set.extend(inherited.iter().cloned());
                }
            }
            ancestors.insert(graph.steps[i].id.clone(), set);
        }
    }

    Ok(ExecutionPlan {
        phases: phases
            .into_iter()
            .map(|phase| phase.into_iter().map(|i| graph.steps[i].id.clone()).collect())
            .collect(),
        ancestors,
    })
}

/// Walk dependency edges among the stuck steps until one repeats; returns
/// the closed path, e.g. `[a, b, a]`.
fn find_cycle(deps: &[HashSet<usize>], stuck: &HashSet<usize>) -> Vec<usize> {
    let Some(&start) = stuck.iter().min() else {
        return vec![];
    };

    // Every stuck step has at least one stuck dependency, so this walk never
    // dead-ends and must revisit a node within `stuck.len()` hops.
    let mut path = vec![start];
    let mut seen: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut node = start;
    loop {
        let mut candidates: Vec<usize> = deps[node]
            .iter()
            .copied()
            .filter(|d| stuck.contains(d))
            .collect();
        candidates.sort_unstable();
        let Some(&next) = candidates.first() else {
            return path;
        };
        if let Some(&pos) = seen.get(&next) {
            let mut cycle = path.split_off(pos);
            cycle.push(next);
            return cycle;
        }
        seen.insert(next, path.len());
        path.push(next);
        node = next;
    }
}

/// Every input reference must point at a transitive dependency; a fallback
/// may reference anything the step it replaces could.
fn check_references(graph: &TaskGraph, plan: &ExecutionPlan) -> Result<()> {
    for step in &graph.steps {
        for reference in step.references() {
            if !plan.depends_transitively(&step.id, &reference.step_id) {
                return Err(LayerflowError::UnresolvedReference {
                    step: step.id.clone(),
                    reference: reference.to_string(),
                });
            }
        }
    }

    for (original_id, fallback) in &graph.fallback_strategies {
        for reference in fallback.references() {
            if !plan.depends_transitively(original_id, &reference.step_id) {
                return Err(LayerflowError::UnresolvedReference {
                    step: fallback.id.clone(),
                    reference: reference.to_string(),
                });
            }
        }
    }

    Ok(())
}
