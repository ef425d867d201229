//! Task Queue (C3): per-model, per-priority FIFO admission queue plus the
//! authoritative task state table (§4.3).

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::Utc;

use crate::types::{Priority, Task, TaskId, TaskSpec, TaskStatus, TerminalRecord};

#[derive(Default)]
struct ModelBuckets {
    high: VecDeque<TaskId>,
    normal: VecDeque<TaskId>,
    low: VecDeque<TaskId>,
}

impl ModelBuckets {
    fn bucket_mut(&mut self, priority: Priority) -> &mut VecDeque<TaskId> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty() && self.low.is_empty()
    }

    fn pop_highest(&mut self) -> Option<TaskId> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn peek_highest(&self) -> Option<TaskId> {
        self.high
            .front()
            .or_else(|| self.normal.front())
            .or_else(|| self.low.front())
            .copied()
    }

    fn remove(&mut self, id: TaskId) {
        self.high.retain(|&x| x != id);
        self.normal.retain(|&x| x != id);
        self.low.retain(|&x| x != id);
    }
}

/// In-memory task queue: `tasks` is the single source of truth for task
/// state; the per-model priority buckets hold ids of tasks still waiting
/// to be dispatched (not yet `Loading`/`Processing`).
pub struct TaskQueue {
    tasks: HashMap<TaskId, Task>,
    pending: BTreeMap<String, ModelBuckets>,
    terminal_log: VecDeque<TerminalRecord>,
    terminal_log_capacity: usize,
    next_id: TaskId,
}

impl TaskQueue {
    /// Build an empty queue, retaining up to `terminal_log_capacity`
    /// diagnostic records of completed/failed tasks (§3).
    pub fn new(terminal_log_capacity: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            pending: BTreeMap::new(),
            terminal_log: VecDeque::new(),
            terminal_log_capacity: terminal_log_capacity.max(1),
            next_id: 1,
        }
    }

    /// Admit a new submission, returning its allocated id.
    pub fn submit(&mut self, spec: TaskSpec) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        let task = Task::new(id, spec, Utc::now());
        let model = task.spec.model.clone();
        let priority = task.spec.priority;
        self.tasks.insert(id, task);
        self.pending
            .entry(model)
            .or_default()
            .bucket_mut(priority)
            .push_back(id);
        id
    }

    /// Borrow a task by id.
    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Mutably borrow a task by id.
    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    /// Models with at least one task still waiting to be dispatched.
    pub fn models_with_pending_work(&self) -> Vec<String> {
        self.pending
            .iter()
            .filter(|(_, buckets)| !buckets.is_empty())
            .map(|(model, _)| model.clone())
            .collect()
    }

    /// Pop the next highest-priority pending task id for `model`, without
    /// removing it from the task table — only from the pending bucket.
    /// Callers transition the task's status themselves once a GPU is
    /// admitted.
    pub fn pop_next_pending(&mut self, model: &str) -> Option<TaskId> {
        let buckets = self.pending.get_mut(model)?;
        let id = buckets.pop_highest()?;
        if buckets.is_empty() {
            self.pending.remove(model);
        }
        Some(id)
    }

    /// Peek the id of the next task [`Self::pop_next_pending`] would return
    /// for `model`, without removing it — used for tie-breaking by age in
    /// model-bucket priority (§4.4).
    pub fn peek_next_pending(&self, model: &str) -> Option<TaskId> {
        self.pending.get(model)?.peek_highest()
    }

    /// Put a task id back at the front of its priority bucket — used when
    /// admission is attempted but no GPU currently has room, so the task
    /// must wait for the next scheduler tick without losing its place.
    pub fn requeue_front(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get(&id) else {
            return;
        };
        let model = task.spec.model.clone();
        let priority = task.spec.priority;
        self.pending
            .entry(model)
            .or_default()
            .bucket_mut(priority)
            .push_front(id);
    }

    /// Put a task id back at the tail of its priority bucket — used on a
    /// worker-reported retry, which per §4.3 gets "no priority boost" and
    /// instead rejoins the same model's queue behind tasks already waiting
    /// at the same priority.
    pub fn requeue_back(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get(&id) else {
            return;
        };
        let model = task.spec.model.clone();
        let priority = task.spec.priority;
        self.pending
            .entry(model)
            .or_default()
            .bucket_mut(priority)
            .push_back(id);
    }

    /// Mark a task terminal (`Completed` or `Failed`), removing it from
    /// the pending buckets (if still present) and appending a bounded
    /// diagnostic record.
    pub fn finish(&mut self, id: TaskId, status: TaskStatus) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        task.status = status;
        task.updated_at = Utc::now();
        task.finished_at = Some(task.updated_at);

        if let Some(buckets) = self.pending.get_mut(&task.spec.model) {
            buckets.remove(id);
            if buckets.is_empty() {
                self.pending.remove(&task.spec.model);
            }
        }

        self.terminal_log.push_back(TerminalRecord {
            id: task.id,
            model: task.spec.model.clone(),
            status,
            error: task.error.clone(),
            finished_at: task.updated_at,
        });
        while self.terminal_log.len() > self.terminal_log_capacity {
            self.terminal_log.pop_front();
        }
    }

    /// Recent terminal records, newest last.
    pub fn terminal_log(&self) -> impl Iterator<Item = &TerminalRecord> {
        self.terminal_log.iter()
    }

    /// All known tasks, for snapshotting.
    pub fn all_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Count of tasks not yet terminal.
    pub fn active_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| !matches!(t.status, TaskStatus::Completed | TaskStatus::Failed))
            .count()
    }

    /// Count of tasks currently occupying a GPU (`Loading`/`Processing`),
    /// the figure the global `Concurrency` cap bounds (§4.5).
    pub fn in_flight_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Loading | TaskStatus::Processing))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use crate::types::{Language, OutputFormat};

    use super::*;

    fn spec(model: &str, priority: Priority) -> TaskSpec {
        TaskSpec {
            files: vec!["a.wav".into()],
            model: model.into(),
            language: Language::Auto,
            formats: vec![OutputFormat::PlainText],
            priority,
            preferred_gpu: None,
        }
    }

    #[test]
    fn fifo_within_priority_bucket() {
        let mut q = TaskQueue::new(16);
        let a = q.submit(spec("m", Priority::Normal));
        let b = q.submit(spec("m", Priority::Normal));
        assert_eq!(q.pop_next_pending("m"), Some(a));
        assert_eq!(q.pop_next_pending("m"), Some(b));
    }

    #[test]
    fn higher_priority_dispatches_before_lower_regardless_of_arrival_order() {
        let mut q = TaskQueue::new(16);
        let low = q.submit(spec("m", Priority::Low));
        let high = q.submit(spec("m", Priority::High));
        assert_eq!(q.pop_next_pending("m"), Some(high));
        assert_eq!(q.pop_next_pending("m"), Some(low));
    }

    #[test]
    fn models_are_independent_queues() {
        let mut q = TaskQueue::new(16);
        q.submit(spec("a", Priority::Normal));
        q.submit(spec("b", Priority::Normal));
        assert_eq!(q.models_with_pending_work().len(), 2);
        assert!(q.pop_next_pending("a").is_some());
        assert_eq!(q.models_with_pending_work(), vec!["b".to_string()]);
    }

    #[test]
    fn terminal_log_is_capped() {
        let mut q = TaskQueue::new(2);
        for _ in 0..5 {
            let id = q.submit(spec("m", Priority::Normal));
            q.pop_next_pending("m");
            q.finish(id, TaskStatus::Completed);
        }
        assert_eq!(q.terminal_log().count(), 2);
    }

    #[test]
    fn requeue_front_preserves_priority_position() {
        let mut q = TaskQueue::new(16);
        let a = q.submit(spec("m", Priority::Normal));
        let popped = q.pop_next_pending("m").unwrap();
        assert_eq!(popped, a);
        q.requeue_front(a);
        assert_eq!(q.pop_next_pending("m"), Some(a));
    }

    #[test]
    fn requeue_back_gives_no_priority_boost_over_tasks_already_waiting() {
        let mut q = TaskQueue::new(16);
        let retried = q.submit(spec("m", Priority::Normal));
        assert_eq!(q.pop_next_pending("m"), Some(retried));
        let waiting = q.submit(spec("m", Priority::Normal));
        q.requeue_back(retried);
        assert_eq!(q.pop_next_pending("m"), Some(waiting));
        assert_eq!(q.pop_next_pending("m"), Some(retried));
    }
}
