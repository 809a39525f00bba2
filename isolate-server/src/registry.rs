//! The concurrent background-task registry `Submit`/`List`/`Cancel`
//! share. The orchestration crate deliberately leaves the registry's
//! concurrency story to its caller (see `isolate_executor::task`); this
//! module answers that open question with a `DashMap`, which gives
//! every RPC handler lock-free, independent access to a different
//! task's entry instead of serializing them behind one mutex.

use std::sync::Arc;

use dashmap::DashMap;
use isolate_executor::task::BackgroundTask;

#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, Arc<BackgroundTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Arc<BackgroundTask>) {
        self.tasks.insert(task.task_id.clone(), task);
    }

    /// Removes a finished task's entry so the registry doesn't grow
    /// without bound. Called by the task's own completion callback, and
    /// also by `Cancel` itself so a cancelled task stops appearing in
    /// `List` as soon as `Cancel` returns rather than racing its
    /// completion callback.
    pub fn remove(&self, task_id: &str) {
        self.tasks.remove(task_id);
    }

    pub fn list_ids(&self) -> Vec<String> {
        self.tasks.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<BackgroundTask>> {
        self.tasks.get(task_id).map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isolate_executor::task::BackgroundTask;

    fn registered_task(id: &str) -> Arc<BackgroundTask> {
        let handle = tokio::spawn(async {
            std::future::pending::<()>().await;
        });
        let (task, _context) = BackgroundTask::new_with_context(id.to_string(), handle);
        Arc::new(task)
    }

    #[tokio::test]
    async fn insert_and_list_round_trip() {
        let registry = TaskRegistry::new();
        registry.insert(registered_task("a"));
        registry.insert(registered_task("b"));

        let mut ids = registry.list_ids();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn remove_drops_the_entry() {
        let registry = TaskRegistry::new();
        let task = registered_task("a");
        registry.insert(task.clone());
        registry.remove("a");

        assert!(registry.get("a").is_none());
        task.cancel().await;
    }
}
