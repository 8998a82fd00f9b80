//! In-memory task table and dependency graph.
//!
//! The graph lives inside the table: `depends_on` and `blocks` edges are
//! wired on insert and unwired on remove, so one lock covers both. All
//! methods are synchronous; the scheduler holds the surrounding mutex.

use crate::error::{Result, StagehandError};
use crate::id::now_ms;
use crate::task::{Task, TaskState};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: HashMap<String, Task>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self { tasks: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Insert a new task, wiring a `blocks` edge on every dependency
    /// already present in the table.
    pub fn insert(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(StagehandError::DuplicateTask(task.id.clone()));
        }
        for dep in &task.depends_on {
            if let Some(dep_task) = self.tasks.get_mut(dep) {
                dep_task.blocks.insert(task.id.clone());
            }
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Remove a task and unwire the `blocks` edges it holds on its
    /// dependencies. Dependents keep their `depends_on` entry: a
    /// resubmission under the same id re-satisfies them.
    pub fn remove(&mut self, id: &str) -> Option<Task> {
        let task = self.tasks.remove(id)?;
        for dep in &task.depends_on {
            if let Some(dep_task) = self.tasks.get_mut(dep) {
                dep_task.blocks.remove(id);
            }
        }
        Some(task)
    }

    /// Apply a lifecycle transition, refusing edges outside the state
    /// machine and stamping the matching timestamp.
    pub fn transition(&mut self, id: &str, to: TaskState) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| StagehandError::TaskNotFound(id.to_string()))?;
        if !task.state.can_transition(to) {
            return Err(StagehandError::InvalidTransition(format!(
                "{}: {} -> {}",
                id, task.state, to
            )));
        }
        let now = now_ms();
        match to {
            TaskState::Queued => task.queued_at = Some(now),
            TaskState::Running => task.started_at = Some(now),
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled => {
                task.completed_at = Some(now);
            }
            TaskState::Pending => task.next_retry_at = None,
            TaskState::RetryScheduled => {}
        }
        task.state = to;
        task.updated_at = now;
        Ok(())
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Clone of every record, for stats and dashboards.
    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks.values().cloned().collect()
    }

    /// Tasks in the given state, ordered by creation time then id.
    pub fn list_by_state(&self, state: TaskState) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.values().filter(|t| t.state == state).cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    pub fn count_in_state(&self, state: TaskState) -> usize {
        self.tasks.values().filter(|t| t.state == state).count()
    }

    pub fn count_by_state(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.state.as_str().to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn completed_ids(&self) -> HashSet<String> {
        self.tasks
            .values()
            .filter(|t| t.state == TaskState::Completed)
            .map(|t| t.id.clone())
            .collect()
    }

    /// True when every dependency exists and is Completed. An unknown
    /// dependency id counts as unmet.
    pub fn dependencies_met(&self, task: &Task) -> bool {
        task.depends_on
            .iter()
            .all(|dep| self.tasks.get(dep).is_some_and(|d| d.state == TaskState::Completed))
    }

    /// True when the edge `id depends_on dep` would close a cycle, i.e.
    /// `dep` already reaches `id` through `depends_on` edges.
    pub fn would_create_cycle(&self, id: &str, dep: &str) -> bool {
        if id == dep {
            return true;
        }
        self.reaches(dep, id)
    }

    fn reaches(&self, from: &str, target: &str) -> bool {
        let mut stack: Vec<&str> = vec![from];
        let mut seen: HashSet<&str> = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(task) = self.tasks.get(current) {
                stack.extend(task.depends_on.iter().map(String::as_str));
            }
        }
        false
    }

    /// Every task that transitively depends on `id`, breadth-first over
    /// `blocks` edges. Does not include `id` itself.
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        seen.insert(id.to_string());
        queue.push_back(id.to_string());
        while let Some(current) = queue.pop_front() {
            if let Some(task) = self.tasks.get(&current) {
                for dependent in &task.blocks {
                    if seen.insert(dependent.clone()) {
                        out.push(dependent.clone());
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskRequest;

    fn task(id: &str) -> Task {
        Task::from_request(TaskRequest::new(id, id, 5), 2, 1_000)
    }

    fn task_with_deps(id: &str, deps: &[&str]) -> Task {
        let mut request = TaskRequest::new(id, id, 5);
        request.depends_on = deps.iter().map(|d| d.to_string()).collect();
        Task::from_request(request, 2, 1_000)
    }

    #[test]
    fn test_insert_rejects_duplicate_id() {
        let mut table = TaskTable::new();
        table.insert(task("a")).unwrap();
        let err = table.insert(task("a")).unwrap_err();
        assert!(matches!(err, StagehandError::DuplicateTask(_)));
    }

    #[test]
    fn test_insert_wires_blocks_edges() {
        let mut table = TaskTable::new();
        table.insert(task("a")).unwrap();
        table.insert(task_with_deps("b", &["a"])).unwrap();

        assert!(table.get("a").unwrap().blocks.contains("b"));
        assert!(table.get("b").unwrap().depends_on.contains("a"));
    }

    #[test]
    fn test_remove_unwires_blocks_edges() {
        let mut table = TaskTable::new();
        table.insert(task("a")).unwrap();
        table.insert(task_with_deps("b", &["a"])).unwrap();

        table.remove("b").unwrap();
        assert!(table.get("a").unwrap().blocks.is_empty());
    }

    #[test]
    fn test_transition_stamps_timestamps() {
        let mut table = TaskTable::new();
        table.insert(task("a")).unwrap();

        table.transition("a", TaskState::Queued).unwrap();
        assert!(table.get("a").unwrap().queued_at.is_some());

        table.transition("a", TaskState::Running).unwrap();
        assert!(table.get("a").unwrap().started_at.is_some());

        table.transition("a", TaskState::Completed).unwrap();
        let a = table.get("a").unwrap();
        assert!(a.completed_at.is_some());
        assert_eq!(a.state, TaskState::Completed);
    }

    #[test]
    fn test_transition_rejects_illegal_edge() {
        let mut table = TaskTable::new();
        table.insert(task("a")).unwrap();

        let err = table.transition("a", TaskState::Running).unwrap_err();
        assert!(matches!(err, StagehandError::InvalidTransition(_)));
        assert!(err.to_string().contains("pending -> running"));
        // The failed attempt must not mutate the record
        assert_eq!(table.get("a").unwrap().state, TaskState::Pending);
    }

    #[test]
    fn test_transition_unknown_task() {
        let mut table = TaskTable::new();
        let err = table.transition("ghost", TaskState::Queued).unwrap_err();
        assert!(matches!(err, StagehandError::TaskNotFound(_)));
    }

    #[test]
    fn test_retry_cycle_clears_deadline() {
        let mut table = TaskTable::new();
        table.insert(task("a")).unwrap();
        table.transition("a", TaskState::Queued).unwrap();
        table.transition("a", TaskState::Running).unwrap();
        table.transition("a", TaskState::RetryScheduled).unwrap();
        table.get_mut("a").unwrap().next_retry_at = Some(now_ms() + 5_000);

        table.transition("a", TaskState::Pending).unwrap();
        assert!(table.get("a").unwrap().next_retry_at.is_none());
    }

    #[test]
    fn test_dependencies_met() {
        let mut table = TaskTable::new();
        table.insert(task("a")).unwrap();
        table.insert(task_with_deps("b", &["a"])).unwrap();

        let b = table.get("b").unwrap().clone();
        assert!(!table.dependencies_met(&b));

        table.transition("a", TaskState::Queued).unwrap();
        table.transition("a", TaskState::Running).unwrap();
        table.transition("a", TaskState::Completed).unwrap();
        assert!(table.dependencies_met(&b));
    }

    #[test]
    fn test_unknown_dependency_counts_as_unmet() {
        let mut table = TaskTable::new();
        table.insert(task_with_deps("b", &["never-submitted"])).unwrap();
        let b = table.get("b").unwrap().clone();
        assert!(!table.dependencies_met(&b));
    }

    #[test]
    fn test_cycle_detection() {
        let mut table = TaskTable::new();
        table.insert(task("a")).unwrap();
        table.insert(task_with_deps("b", &["a"])).unwrap();
        table.insert(task_with_deps("c", &["b"])).unwrap();

        // Self-edge
        assert!(table.would_create_cycle("a", "a"));
        // Direct: a -> b while b -> a exists
        assert!(table.would_create_cycle("a", "b"));
        // Transitive: a -> c while c -> b -> a exists
        assert!(table.would_create_cycle("a", "c"));
        // Legal new edge
        table.insert(task("d")).unwrap();
        assert!(!table.would_create_cycle("d", "a"));
        assert!(!table.would_create_cycle("c", "d"));
    }

    #[test]
    fn test_transitive_dependents_diamond() {
        let mut table = TaskTable::new();
        table.insert(task("a")).unwrap();
        table.insert(task_with_deps("b", &["a"])).unwrap();
        table.insert(task_with_deps("c", &["a"])).unwrap();
        table.insert(task_with_deps("d", &["b", "c"])).unwrap();

        let mut dependents = table.transitive_dependents("a");
        dependents.sort();
        assert_eq!(dependents, vec!["b", "c", "d"]);
        assert!(table.transitive_dependents("d").is_empty());
    }

    #[test]
    fn test_list_by_state_is_ordered() {
        let mut table = TaskTable::new();
        for (id, created_at) in [("c", 2_000), ("a", 2_000), ("b", 1_000)] {
            let mut t = task(id);
            t.created_at = created_at;
            table.insert(t).unwrap();
        }

        let pending: Vec<String> = table
            .list_by_state(TaskState::Pending)
            .into_iter()
            .map(|t| t.id)
            .collect();
        // b is oldest; a and c share a timestamp and fall back to id order
        assert_eq!(pending, vec!["b", "a", "c"]);
        assert_eq!(table.count_in_state(TaskState::Pending), 3);
    }

    #[test]
    fn test_count_by_state() {
        let mut table = TaskTable::new();
        table.insert(task("a")).unwrap();
        table.insert(task("b")).unwrap();
        table.transition("a", TaskState::Queued).unwrap();

        let counts = table.count_by_state();
        assert_eq!(counts.get("pending"), Some(&1));
        assert_eq!(counts.get("queued"), Some(&1));
        assert_eq!(counts.get("running"), None);
    }
}
