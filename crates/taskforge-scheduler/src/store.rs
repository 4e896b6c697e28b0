//! In-memory task store: bounded active map plus FIFO-evicted history.
//!
//! Terminal tasks move from `active` into `history`. When history exceeds its
//! bound the oldest entry is dropped from both the order ring and the id map
//! in the same call, so no index ever points at an evicted task.

use std::collections::{HashMap, VecDeque};

use taskforge_core::error::{Result, TaskForgeError};

use crate::tasks::Task;

pub struct TaskStore {
    active: HashMap<String, Task>,
    history: HashMap<String, Task>,
    /// History ids, oldest first.
    history_order: VecDeque<String>,
    max_active: usize,
    max_history: usize,
}

impl TaskStore {
    pub fn new(max_active: usize, max_history: usize) -> Self {
        Self {
            active: HashMap::new(),
            history: HashMap::new(),
            history_order: VecDeque::new(),
            max_active: max_active.max(1),
            max_history: max_history.max(1),
        }
    }

    /// Known as active or retained history.
    pub fn contains(&self, task_id: &str) -> bool {
        self.active.contains_key(task_id) || self.history.contains_key(task_id)
    }

    /// Admit a new task. Rejects duplicates and enforces capacity.
    pub fn insert(&mut self, task: Task) -> Result<()> {
        if self.contains(&task.task_id) {
            return Err(TaskForgeError::DuplicateTask(task.task_id));
        }
        if self.active.len() >= self.max_active {
            return Err(TaskForgeError::QueueFull(self.max_active));
        }
        self.active.insert(task.task_id.clone(), task);
        Ok(())
    }

    /// Active record first, then history.
    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.active.get(task_id).or_else(|| self.history.get(task_id))
    }

    pub fn get_active_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.active.get_mut(task_id)
    }

    /// Move a terminal task into history. Returns the id evicted to make room, if any.
    pub fn archive(&mut self, task_id: &str) -> Option<String> {
        let task = self.active.remove(task_id)?;
        self.history_order.push_back(task.task_id.clone());
        self.history.insert(task.task_id.clone(), task);

        if self.history_order.len() > self.max_history {
            let evicted = self.history_order.pop_front()?;
            self.history.remove(&evicted);
            tracing::debug!("🗑️ Evicted task '{}' from history", evicted);
            return Some(evicted);
        }
        None
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn history_len(&self) -> usize {
        self.history_order.len()
    }

    pub fn capacity(&self) -> usize {
        self.max_active
    }

    pub fn active(&self) -> impl Iterator<Item = &Task> {
        self.active.values()
    }

    /// History records, most recent first.
    pub fn history_recent(&self) -> impl Iterator<Item = &Task> {
        self.history_order
            .iter()
            .rev()
            .filter_map(|id| self.history.get(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_core::types::{TaskPriority, TaskStatus, WorkflowType};

    fn task(id: &str) -> Task {
        Task::new(id, WorkflowType::InquiryOnly, TaskPriority::Normal, serde_json::Value::Null)
    }

    #[test]
    fn test_duplicate_against_history() {
        let mut store = TaskStore::new(10, 10);
        store.insert(task("t1")).unwrap();
        store.get_active_mut("t1").unwrap().status = TaskStatus::Completed;
        store.archive("t1");

        let err = store.insert(task("t1")).unwrap_err();
        assert!(matches!(err, TaskForgeError::DuplicateTask(id) if id == "t1"));
    }

    #[test]
    fn test_capacity() {
        let mut store = TaskStore::new(2, 10);
        store.insert(task("a")).unwrap();
        store.insert(task("b")).unwrap();
        assert!(matches!(store.insert(task("c")), Err(TaskForgeError::QueueFull(2))));
        assert_eq!(store.active_len(), 2);
    }

    #[test]
    fn test_eviction_clears_every_index() {
        let mut store = TaskStore::new(10, 1);
        store.insert(task("a")).unwrap();
        store.insert(task("b")).unwrap();
        assert_eq!(store.archive("a"), None);
        assert_eq!(store.archive("b").as_deref(), Some("a"));

        assert!(store.get("a").is_none());
        assert!(!store.contains("a"));
        assert!(store.get("b").is_some());
        assert_eq!(store.history_len(), 1);
        // An evicted id may be reused.
        store.insert(task("a")).unwrap();
    }

    #[test]
    fn test_history_recent_order() {
        let mut store = TaskStore::new(10, 10);
        for id in ["a", "b", "c"] {
            store.insert(task(id)).unwrap();
            store.archive(id);
        }
        let ids: Vec<&str> = store.history_recent().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }
}
