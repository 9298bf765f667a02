use std::collections::{HashMap, VecDeque};

use crate::models::{CoreError, CoreErrorKind, TaskId, TaskRecord};
use crate::orchestration::OrchestrationResult;

/// Task dependency DAG over a workflow's tasks, in insertion order.
///
/// Edges point from a task to the tasks it depends on.
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    ids: Vec<TaskId>,
    index: HashMap<TaskId, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mark {
    Unvisited,
    OnPath,
    Done,
}

impl DependencyGraph {
    /// Builds the graph requiring every dependency to name a task in `tasks`,
    /// then rejects cycles.
    pub fn validated(tasks: &[TaskRecord]) -> OrchestrationResult<Self> {
        let graph = Self::build(tasks, true)?;
        graph.ensure_acyclic()?;
        Ok(graph)
    }

    /// Builds the graph over the tasks known so far; references to tasks not yet
    /// added are ignored.
    pub fn known(tasks: &[TaskRecord]) -> Self {
        // Lenient builds cannot fail.
        Self::build(tasks, false).unwrap_or_default()
    }

    fn build(tasks: &[TaskRecord], strict: bool) -> OrchestrationResult<Self> {
        let ids: Vec<TaskId> = tasks.iter().map(|task| task.id.clone()).collect();
        let index: HashMap<TaskId, usize> = ids
            .iter()
            .enumerate()
            .map(|(position, id)| (id.clone(), position))
            .collect();

        let mut dependencies = vec![Vec::new(); ids.len()];
        let mut dependents = vec![Vec::new(); ids.len()];
        for (position, task) in tasks.iter().enumerate() {
            for dependency in &task.depends_on {
                match index.get(dependency) {
                    Some(&target) => {
                        dependencies[position].push(target);
                        dependents[target].push(position);
                    }
                    None if strict => {
                        return Err(CoreError::new(
                            CoreErrorKind::InvalidInput,
                            format!("task '{}' depends on unknown task '{dependency}'", task.id),
                        )
                        .with_task(task.id.clone()));
                    }
                    None => {}
                }
            }
        }
        for list in &mut dependents {
            list.sort_unstable();
        }

        Ok(Self {
            ids,
            index,
            dependencies,
            dependents,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[TaskId] {
        &self.ids
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn dependencies(&self, id: &TaskId) -> Vec<&TaskId> {
        self.neighbours(id, &self.dependencies)
    }

    pub fn dependents(&self, id: &TaskId) -> Vec<&TaskId> {
        self.neighbours(id, &self.dependents)
    }

    fn neighbours<'a>(&'a self, id: &TaskId, edges: &'a [Vec<usize>]) -> Vec<&'a TaskId> {
        self.index
            .get(id)
            .map(|&position| edges[position].iter().map(|&i| &self.ids[i]).collect())
            .unwrap_or_default()
    }

    /// Every task that transitively depends on `id`, in insertion order.
    pub fn descendants(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };

        let mut seen = vec![false; self.ids.len()];
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for &dependent in &self.dependents[node] {
                if !seen[dependent] {
                    seen[dependent] = true;
                    queue.push_back(dependent);
                }
            }
        }

        seen.iter()
            .enumerate()
            .filter(|(_, seen)| **seen)
            .map(|(position, _)| self.ids[position].clone())
            .collect()
    }

    /// Depth-first search with an explicit path stack. Returns the first cycle
    /// found as `[a, b, ..., a]` following dependency edges.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut marks = vec![Mark::Unvisited; self.ids.len()];
        let mut path: Vec<usize> = Vec::new();

        for start in 0..self.ids.len() {
            if marks[start] != Mark::Unvisited {
                continue;
            }
            marks[start] = Mark::OnPath;
            path.push(start);
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];

            while let Some((node, next_edge)) = stack.last_mut() {
                let node = *node;
                let Some(&next) = self.dependencies[node].get(*next_edge) else {
                    marks[node] = Mark::Done;
                    path.pop();
                    stack.pop();
                    continue;
                };
                *next_edge += 1;

                match marks[next] {
                    Mark::Unvisited => {
                        marks[next] = Mark::OnPath;
                        path.push(next);
                        stack.push((next, 0));
                    }
                    Mark::OnPath => {
                        let from = path
                            .iter()
                            .position(|&position| position == next)
                            .unwrap_or(0);
                        let mut cycle: Vec<TaskId> =
                            path[from..].iter().map(|&i| self.ids[i].clone()).collect();
                        cycle.push(self.ids[next].clone());
                        return Some(cycle);
                    }
                    Mark::Done => {}
                }
            }
        }

        None
    }

    pub fn ensure_acyclic(&self) -> OrchestrationResult<()> {
        match self.find_cycle() {
            None => Ok(()),
            Some(cycle) => {
                let rendered = cycle
                    .iter()
                    .map(TaskId::as_str)
                    .collect::<Vec<_>>()
                    .join(" -> ");
                Err(CoreError::new(
                    CoreErrorKind::CyclicDependency,
                    format!("dependency cycle: {rendered}"),
                )
                .with_task(cycle[0].clone()))
            }
        }
    }

    /// Groups tasks into topological layers.
    ///
    /// Each layer contains the tasks whose dependencies all sit in earlier
    /// layers, in insertion order. Tasks on a cycle appear in no layer.
    pub fn execution_phases(&self) -> Vec<Vec<TaskId>> {
        let mut remaining: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut current: Vec<usize> = (0..self.ids.len())
            .filter(|&position| remaining[position] == 0)
            .collect();

        let mut phases = Vec::new();
        while !current.is_empty() {
            let mut next = Vec::new();
            for &node in &current {
                for &dependent in &self.dependents[node] {
                    remaining[dependent] -= 1;
                    if remaining[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            next.sort_unstable();
            phases.push(current.iter().map(|&i| self.ids[i].clone()).collect());
            current = next;
        }
        phases
    }
}
