//! Dependency graph checks

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::{Task, TaskId};
use crate::{Error, Result};

/// Kahn's algorithm over the dependency edges
///
/// Returns the ids in an order where every task follows its dependencies.
/// Fails on a dangling dependency or a cycle.
pub fn topological_order(tasks: &BTreeMap<TaskId, Task>) -> Result<Vec<TaskId>> {
    let mut in_degree: BTreeMap<TaskId, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<TaskId, Vec<TaskId>> = BTreeMap::new();

    for (id, task) in tasks {
        in_degree.entry(*id).or_insert(0);
        for dep in &task.dependencies {
            if !tasks.contains_key(dep) {
                return Err(Error::Planning(format!(
                    "task {} depends on unknown task {}",
                    id, dep
                )));
            }
            *in_degree.entry(*id).or_insert(0) += 1;
            dependents.entry(*dep).or_default().push(*id);
        }
    }

    let mut ready: VecDeque<TaskId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(tasks.len());

    while let Some(id) = ready.pop_front() {
        order.push(id);
        if let Some(children) = dependents.get(&id) {
            for child in children {
                if let Some(d) = in_degree.get_mut(child) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(*child);
                    }
                }
            }
        }
    }

    if order.len() != tasks.len() {
        let placed: BTreeSet<TaskId> = order.iter().copied().collect();
        let stuck: Vec<String> = tasks
            .keys()
            .filter(|id| !placed.contains(id))
            .map(|id| id.to_string())
            .collect();
        return Err(Error::Planning(format!(
            "dependency cycle among tasks [{}]",
            stuck.join(", ")
        )));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn task(id: TaskId, deps: &[TaskId]) -> Task {
        Task {
            id,
            title: format!("t{}", id),
            description: String::new(),
            kind: Default::default(),
            priority: Default::default(),
            status: Default::default(),
            dependencies: deps.iter().copied().collect(),
            estimated_cost: 1,
            attempts: 0,
            result_path: None,
            failure_reason: None,
            retired: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn graph(edges: &[(TaskId, &[TaskId])]) -> BTreeMap<TaskId, Task> {
        edges.iter().map(|(id, deps)| (*id, task(*id, deps))).collect()
    }

    #[test]
    fn test_order_respects_dependencies() {
        let tasks = graph(&[(1, &[]), (2, &[1]), (3, &[1]), (4, &[2, 3])]);
        let order = topological_order(&tasks).unwrap();
        let pos = |id| order.iter().position(|x| *x == id).unwrap();
        assert!(pos(1) < pos(2));
        assert!(pos(2) < pos(4));
        assert!(pos(3) < pos(4));
    }

    #[test]
    fn test_cycle_is_reported() {
        let tasks = graph(&[(1, &[3]), (2, &[1]), (3, &[2]), (4, &[])]);
        let err = topological_order(&tasks).unwrap_err();
        match err {
            Error::Planning(msg) => assert!(msg.contains("1, 2, 3")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_self_loop_and_dangling_edge() {
        assert!(topological_order(&graph(&[(1, &[1])])).is_err());
        assert!(topological_order(&graph(&[(1, &[7])])).is_err());
    }
}
