//! Dependency scheduler: DAG construction, cycle detection, and
//! deterministic ready/ordering queries.
//!
//! The scheduler is owned and mutated by a single control loop; it is not
//! internally synchronized. All iteration is over `BTreeMap`s so that two
//! calls over unchanged state return identical ordered output, which
//! reproducible execution modes and the tests rely on.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use drover_core::{Task, TaskStatus};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("duplicate task id: {0}")]
    DuplicateTask(String),
    #[error("unknown task id: {0}")]
    UnknownTask(String),
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },
    #[error("circular dependency: {}", path.join(" -> "))]
    CircularDependency { path: Vec<String> },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Holds a task set with declared dependencies and answers ordering,
/// readiness, and cycle queries over it.
#[derive(Debug, Default)]
pub struct DependencyScheduler {
    tasks: BTreeMap<String, Task>,
    /// Reverse-edge index: dependents[x] = tasks that depend on x.
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task, updating the forward graph and the reverse index.
    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(SchedulerError::DuplicateTask(task.id));
        }
        for dep in &task.depends_on {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(task.id.clone());
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn add_tasks(&mut self, tasks: impl IntoIterator<Item = Task>) -> Result<()> {
        for task in tasks {
            self.add_task(task)?;
        }
        Ok(())
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Check that every declared dependency references a registered task.
    pub fn validate(&self) -> Result<()> {
        for task in self.tasks.values() {
            for dep in &task.depends_on {
                if !self.tasks.contains_key(dep) {
                    return Err(SchedulerError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        if let Some(path) = self.detect_cycles() {
            return Err(SchedulerError::CircularDependency { path });
        }
        Ok(())
    }

    /// All pending tasks whose every dependency is completed, sorted by id.
    /// Call-stable: unchanged state reproduces identical output.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && self.deps_satisfied(t))
            .collect()
    }

    /// Whether a task's dependencies are all satisfied.
    pub fn can_execute(&self, id: &str) -> bool {
        self.tasks.get(id).is_some_and(|t| self.deps_satisfied(t))
    }

    /// Dependency ids currently blocking a task (not completed, or missing
    /// from the task set entirely), sorted.
    pub fn blocking_tasks(&self, id: &str) -> Vec<String> {
        let Some(task) = self.tasks.get(id) else {
            return Vec::new();
        };
        task.depends_on
            .iter()
            .filter(|dep| {
                self.tasks
                    .get(*dep)
                    .is_none_or(|d| d.status != TaskStatus::Completed)
            })
            .cloned()
            .collect()
    }

    fn deps_satisfied(&self, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_some_and(|d| d.status == TaskStatus::Completed)
        })
    }

    /// Depth-first cycle search with a recursion-stack set. Start nodes are
    /// iterated in sorted order, so the returned path (which includes the
    /// repeated node at both ends) is deterministic.
    pub fn detect_cycles(&self) -> Option<Vec<String>> {
        let mut visited: HashSet<&str> = HashSet::new();
        for start in self.tasks.keys() {
            if visited.contains(start.as_str()) {
                continue;
            }
            let mut stack: Vec<&str> = Vec::new();
            let mut on_stack: HashSet<&str> = HashSet::new();
            if let Some(path) = self.dfs(start, &mut visited, &mut stack, &mut on_stack) {
                return Some(path);
            }
        }
        None
    }

    fn dfs<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
        on_stack: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        stack.push(node);
        on_stack.insert(node);

        if let Some(task) = self.tasks.get(node) {
            for dep in &task.depends_on {
                let dep = dep.as_str();
                if on_stack.contains(dep) {
                    let first = stack.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[first..].iter().map(|s| (*s).to_string()).collect();
                    path.push(dep.to_string());
                    return Some(path);
                }
                if !visited.contains(dep) && self.tasks.contains_key(dep) {
                    if let Some(path) = self.dfs(dep, visited, stack, on_stack) {
                        return Some(path);
                    }
                }
            }
        }

        visited.insert(node);
        on_stack.remove(node);
        stack.pop();
        None
    }

    /// Full topological leveling: each inner list is one wave of mutually
    /// independent task ids (sorted), in dependency order.
    pub fn execution_order(&self) -> Result<Vec<Vec<String>>> {
        let mut placed: BTreeSet<String> = BTreeSet::new();
        let mut waves: Vec<Vec<String>> = Vec::new();

        while placed.len() < self.tasks.len() {
            let wave: Vec<String> = self
                .tasks
                .values()
                .filter(|t| !placed.contains(&t.id))
                .filter(|t| t.depends_on.iter().all(|d| placed.contains(d)))
                .map(|t| t.id.clone())
                .collect();

            if wave.is_empty() {
                let path = self.detect_cycles().unwrap_or_default();
                return Err(SchedulerError::CircularDependency { path });
            }
            placed.extend(wave.iter().cloned());
            waves.push(wave);
        }

        Ok(waves)
    }

    /// Topological leveling with each wave re-chunked into groups of at
    /// most `max_parallel` ids. Wave boundaries still respect dependencies.
    pub fn parallel_batches(&self, max_parallel: usize) -> Result<Vec<Vec<String>>> {
        let max_parallel = max_parallel.max(1);
        let mut batches = Vec::new();
        for wave in self.execution_order()? {
            for chunk in wave.chunks(max_parallel) {
                batches.push(chunk.to_vec());
            }
        }
        Ok(batches)
    }

    // --- Status transitions (progress flags, not a full state machine) ---

    pub fn mark_running(&mut self, id: &str) -> Result<()> {
        let task = self.task_mut(id)?;
        task.status = TaskStatus::Running;
        Ok(())
    }

    pub fn mark_completed(&mut self, id: &str, result: serde_json::Value) -> Result<()> {
        let task = self.task_mut(id)?;
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        Ok(())
    }

    pub fn mark_failed(&mut self, id: &str, error: impl Into<String>) -> Result<()> {
        let task = self.task_mut(id)?;
        task.status = TaskStatus::Failed;
        task.error = Some(error.into());
        Ok(())
    }

    /// Record the tool selected for a task by the router.
    pub fn assign_tool(&mut self, id: &str, tool_id: impl Into<String>) -> Result<()> {
        let task = self.task_mut(id)?;
        task.selected_tool = Some(tool_id.into());
        Ok(())
    }

    fn task_mut(&mut self, id: &str) -> Result<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::UnknownTask(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(id, "code_edit").with_dependencies(deps.iter().copied())
    }

    #[test]
    fn empty_scheduler_has_no_ready_tasks() {
        let scheduler = DependencyScheduler::new();
        assert!(scheduler.ready_tasks().is_empty());
        assert!(scheduler.execution_order().unwrap().is_empty());
    }

    #[test]
    fn independent_tasks_are_all_ready_sorted_by_id() {
        let mut scheduler = DependencyScheduler::new();
        scheduler
            .add_tasks([task("c", &[]), task("a", &[]), task("b", &[])])
            .unwrap();

        let ready: Vec<&str> = scheduler.ready_tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["a", "b", "c"]);
    }

    #[test]
    fn ready_tasks_is_call_stable() {
        let mut scheduler = DependencyScheduler::new();
        scheduler
            .add_tasks([task("z", &[]), task("m", &[]), task("a", &["m"])])
            .unwrap();

        let first: Vec<String> = scheduler.ready_tasks().iter().map(|t| t.id.clone()).collect();
        let second: Vec<String> = scheduler.ready_tasks().iter().map(|t| t.id.clone()).collect();
        assert_eq!(first, second);
        assert_eq!(first, vec!["m".to_string(), "z".to_string()]);
    }

    #[test]
    fn duplicate_task_id_is_rejected() {
        let mut scheduler = DependencyScheduler::new();
        scheduler.add_task(task("a", &[])).unwrap();
        let err = scheduler.add_task(task("a", &[])).unwrap_err();
        assert_eq!(err, SchedulerError::DuplicateTask("a".to_string()));
    }

    #[test]
    fn task_with_incomplete_dependency_is_not_ready() {
        let mut scheduler = DependencyScheduler::new();
        scheduler
            .add_tasks([task("a", &[]), task("b", &["a"])])
            .unwrap();

        let ready: Vec<&str> = scheduler.ready_tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["a"]);

        scheduler.mark_completed("a", serde_json::json!({"ok": true})).unwrap();
        let ready: Vec<&str> = scheduler.ready_tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["b"]);
    }

    #[test]
    fn task_behind_failed_dependency_is_never_ready() {
        let mut scheduler = DependencyScheduler::new();
        scheduler
            .add_tasks([task("a", &[]), task("b", &["a"])])
            .unwrap();

        scheduler.mark_failed("a", "boom").unwrap();
        assert!(scheduler.ready_tasks().is_empty());
        // The scheduler does not auto-fail dependents; that policy is the caller's.
        assert_eq!(scheduler.task("b").unwrap().status, TaskStatus::Pending);
        assert_eq!(scheduler.blocking_tasks("b"), vec!["a".to_string()]);
    }

    #[test]
    fn execution_order_levels_a_diamond() {
        let mut scheduler = DependencyScheduler::new();
        scheduler
            .add_tasks([
                task("d", &["b", "c"]),
                task("b", &["a"]),
                task("c", &["a"]),
                task("a", &[]),
            ])
            .unwrap();

        let waves = scheduler.execution_order().unwrap();
        assert_eq!(
            waves,
            vec![
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()],
            ]
        );
    }

    #[test]
    fn execution_order_concatenation_is_a_valid_topological_sort() {
        let mut scheduler = DependencyScheduler::new();
        scheduler
            .add_tasks([
                task("a", &[]),
                task("b", &["a"]),
                task("c", &["a"]),
                task("d", &["b"]),
                task("e", &["c", "d"]),
            ])
            .unwrap();

        let flat: Vec<String> = scheduler.execution_order().unwrap().concat();
        for t in scheduler.tasks() {
            let pos = flat.iter().position(|id| *id == t.id).unwrap();
            for dep in &t.depends_on {
                let dep_pos = flat.iter().position(|id| id == dep).unwrap();
                assert!(dep_pos < pos, "{dep} must precede {}", t.id);
            }
        }

        // Re-running over unchanged state reproduces identical output.
        assert_eq!(flat, scheduler.execution_order().unwrap().concat());
    }

    #[test]
    fn parallel_batches_rechunks_waves() {
        let mut scheduler = DependencyScheduler::new();
        scheduler
            .add_tasks([
                task("a", &[]),
                task("b", &[]),
                task("c", &[]),
                task("d", &["a", "b", "c"]),
            ])
            .unwrap();

        let batches = scheduler.parallel_batches(2).unwrap();
        assert_eq!(
            batches,
            vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["c".to_string()],
                vec!["d".to_string()],
            ]
        );
    }

    #[test]
    fn detect_cycles_returns_deterministic_path() {
        let mut scheduler = DependencyScheduler::new();
        scheduler
            .add_tasks([task("a", &["b"]), task("b", &["c"]), task("c", &["a"])])
            .unwrap();

        let path = scheduler.detect_cycles().unwrap();
        assert_eq!(path.first(), path.last());
        // Every id in the path participates in the cycle.
        for id in &path {
            assert!(["a", "b", "c"].contains(&id.as_str()));
        }
        assert_eq!(path, scheduler.detect_cycles().unwrap());
    }

    #[test]
    fn execution_order_fails_on_cycle() {
        let mut scheduler = DependencyScheduler::new();
        scheduler
            .add_tasks([task("a", &["b"]), task("b", &["a"]), task("ok", &[])])
            .unwrap();

        let err = scheduler.execution_order().unwrap_err();
        assert!(matches!(err, SchedulerError::CircularDependency { .. }));
    }

    #[test]
    fn acyclic_graph_has_no_cycles() {
        let mut scheduler = DependencyScheduler::new();
        scheduler
            .add_tasks([task("a", &[]), task("b", &["a"]), task("c", &["a", "b"])])
            .unwrap();
        assert!(scheduler.detect_cycles().is_none());
        scheduler.validate().unwrap();
    }

    #[test]
    fn validate_catches_dangling_dependency() {
        let mut scheduler = DependencyScheduler::new();
        scheduler.add_task(task("a", &["ghost"])).unwrap();
        let err = scheduler.validate().unwrap_err();
        assert_eq!(
            err,
            SchedulerError::UnknownDependency {
                task: "a".to_string(),
                dependency: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn mark_operations_require_known_task() {
        let mut scheduler = DependencyScheduler::new();
        let err = scheduler.mark_running("ghost").unwrap_err();
        assert_eq!(err, SchedulerError::UnknownTask("ghost".to_string()));
    }

    #[test]
    fn can_execute_and_blocking_tasks_report_dependencies() {
        let mut scheduler = DependencyScheduler::new();
        scheduler
            .add_tasks([task("a", &[]), task("b", &[]), task("c", &["a", "b"])])
            .unwrap();

        assert!(!scheduler.can_execute("c"));
        assert_eq!(
            scheduler.blocking_tasks("c"),
            vec!["a".to_string(), "b".to_string()]
        );

        scheduler.mark_completed("a", serde_json::Value::Null).unwrap();
        assert_eq!(scheduler.blocking_tasks("c"), vec!["b".to_string()]);

        scheduler.mark_completed("b", serde_json::Value::Null).unwrap();
        assert!(scheduler.can_execute("c"));
        assert!(scheduler.blocking_tasks("c").is_empty());
    }
}
