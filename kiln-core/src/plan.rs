//! Step graph builder
//!
//! Turns the declared steps into the order the execution engine follows.
//! Steps may declare `after` dependencies; the builder performs a stable
//! topological sort so that steps without a relative constraint keep their
//! declaration order. Without any `after` the plan is the declaration order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::domain::pipeline::StepSpec;
use crate::error::PlanError;

/// Ordered steps for one run
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    steps: Vec<StepSpec>,
}

impl ExecutionPlan {
    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Builds an execution plan from declared steps
pub fn build_plan(steps: &[StepSpec]) -> Result<ExecutionPlan, PlanError> {
    if steps.is_empty() {
        return Err(PlanError::Empty);
    }

    let mut index_by_name = HashMap::with_capacity(steps.len());
    for (idx, step) in steps.iter().enumerate() {
        if index_by_name.insert(step.name.as_str(), idx).is_some() {
            return Err(PlanError::DuplicateStep(step.name.clone()));
        }
    }

    let mut indegree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];

    for (idx, step) in steps.iter().enumerate() {
        for dependency in &step.after {
            let parent = *index_by_name.get(dependency.as_str()).ok_or_else(|| {
                PlanError::UnknownDependency {
                    step: step.name.clone(),
                    dependency: dependency.clone(),
                }
            })?;
            indegree[idx] += 1;
            dependents[parent].push(idx);
        }
    }

    // Min-heap on declaration index keeps the sort stable
    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(idx, _)| Reverse(idx))
        .collect();

    let mut ordered = Vec::with_capacity(steps.len());
    while let Some(Reverse(idx)) = ready.pop() {
        ordered.push(steps[idx].clone());
        for &child in &dependents[idx] {
            indegree[child] -= 1;
            if indegree[child] == 0 {
                ready.push(Reverse(child));
            }
        }
    }

    if ordered.len() != steps.len() {
        let blocked = steps
            .iter()
            .enumerate()
            .filter(|(idx, _)| indegree[*idx] > 0)
            .map(|(_, step)| step.name.clone())
            .collect();
        return Err(PlanError::Cycle { steps: blocked });
    }

    Ok(ExecutionPlan { steps: ordered })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str) -> StepSpec {
        StepSpec::new(name, "run-command")
    }

    #[test]
    fn test_plan_without_dependencies_keeps_declaration_order() {
        let steps = vec![
            step("checkout"),
            step("toolchain"),
            step("cache"),
            step("build"),
            step("upload"),
        ];
        let plan = build_plan(&steps).unwrap();
        assert_eq!(
            plan.step_names(),
            vec!["checkout", "toolchain", "cache", "build", "upload"]
        );
    }

    #[test]
    fn test_plan_orders_by_dependencies() {
        let steps = vec![
            step("upload").after("build"),
            step("build").after("checkout"),
            step("checkout"),
        ];
        let plan = build_plan(&steps).unwrap();
        assert_eq!(plan.step_names(), vec!["checkout", "build", "upload"]);
    }

    #[test]
    fn test_plan_is_stable_for_unconstrained_steps() {
        // "lint" and "docs" have no constraint relative to "build"
        let steps = vec![
            step("test").after("build"),
            step("lint"),
            step("build").after("checkout"),
            step("docs"),
            step("checkout"),
        ];
        let plan = build_plan(&steps).unwrap();
        assert_eq!(
            plan.step_names(),
            vec!["lint", "docs", "checkout", "build", "test"]
        );
    }

    #[test]
    fn test_plan_rejects_cycle() {
        let steps = vec![
            step("checkout"),
            step("build").after("upload"),
            step("upload").after("build"),
        ];
        let err = build_plan(&steps).unwrap_err();
        assert_eq!(
            err,
            PlanError::Cycle {
                steps: vec!["build".to_string(), "upload".to_string()]
            }
        );
    }

    #[test]
    fn test_plan_rejects_self_dependency() {
        let steps = vec![step("build").after("build")];
        assert!(matches!(build_plan(&steps), Err(PlanError::Cycle { .. })));
    }

    #[test]
    fn test_plan_rejects_unknown_dependency() {
        let steps = vec![step("build").after("configure")];
        assert_eq!(
            build_plan(&steps).unwrap_err(),
            PlanError::UnknownDependency {
                step: "build".to_string(),
                dependency: "configure".to_string(),
            }
        );
    }

    #[test]
    fn test_plan_rejects_empty_and_duplicates() {
        assert_eq!(build_plan(&[]).unwrap_err(), PlanError::Empty);
        assert_eq!(
            build_plan(&[step("build"), step("build")]).unwrap_err(),
            PlanError::DuplicateStep("build".to_string())
        );
    }
}
