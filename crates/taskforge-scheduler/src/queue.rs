//! Priority queue: orders task ids by (priority, arrival).
//!
//! The ordering key is `(TaskPriority, seq)`; `seq` is a monotonically
//! increasing counter, so equal priorities dequeue in strict FIFO order.

use std::collections::{BTreeMap, HashMap};

use taskforge_core::types::TaskPriority;

type Key = (TaskPriority, u64);

/// Ordering primitive. Holds ids only; the records live in the store.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    entries: BTreeMap<Key, String>,
    index: HashMap<String, Key>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an id. Returns false if the id is already queued.
    pub fn push(&mut self, task_id: &str, priority: TaskPriority) -> bool {
        if self.index.contains_key(task_id) {
            return false;
        }
        let key = (priority, self.next_seq);
        self.next_seq += 1;
        self.entries.insert(key, task_id.to_string());
        self.index.insert(task_id.to_string(), key);
        true
    }

    /// Remove and return the highest-priority, earliest-arrival id.
    pub fn pop(&mut self) -> Option<String> {
        let (_, task_id) = self.entries.pop_first()?;
        self.index.remove(&task_id);
        Some(task_id)
    }

    /// Drop a queued id (cancellation before dispatch).
    pub fn remove(&mut self, task_id: &str) -> bool {
        match self.index.remove(task_id) {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queued ids per priority.
    pub fn depth_by_priority(&self) -> BTreeMap<TaskPriority, usize> {
        let mut counts = BTreeMap::new();
        for (priority, _) in self.entries.keys() {
            *counts.entry(*priority).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_then_fifo() {
        let mut q = PriorityQueue::new();
        q.push("a", TaskPriority::Normal);
        q.push("b", TaskPriority::Critical);
        q.push("c", TaskPriority::High);
        q.push("d", TaskPriority::Normal);
        q.push("e", TaskPriority::Low);

        let order: Vec<String> = std::iter::from_fn(|| q.pop()).collect();
        assert_eq!(order, vec!["b", "c", "a", "d", "e"]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut q = PriorityQueue::new();
        q.push("a", TaskPriority::High);
        q.push("b", TaskPriority::High);
        q.push("c", TaskPriority::High);
        assert!(q.remove("b"));
        assert!(!q.remove("b"));
        assert_eq!(q.pop().as_deref(), Some("a"));
        assert_eq!(q.pop().as_deref(), Some("c"));
    }

    #[test]
    fn test_duplicate_push_rejected() {
        let mut q = PriorityQueue::new();
        assert!(q.push("a", TaskPriority::Low));
        assert!(!q.push("a", TaskPriority::Critical));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop().as_deref(), Some("a"));
    }

    #[test]
    fn test_depth_by_priority() {
        let mut q = PriorityQueue::new();
        q.push("a", TaskPriority::Low);
        q.push("b", TaskPriority::Low);
        q.push("c", TaskPriority::Critical);
        let depth = q.depth_by_priority();
        assert_eq!(depth.get(&TaskPriority::Low), Some(&2));
        assert_eq!(depth.get(&TaskPriority::Critical), Some(&1));
        assert_eq!(depth.get(&TaskPriority::High), None);
    }
}
