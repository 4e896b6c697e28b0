//! Notification router: fans task events out to every registered dispatcher.
//! Fire-and-forget: delivery runs on spawned tasks and failures are only logged.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use taskforge_core::traits::NotificationDispatcher;
use taskforge_core::types::TaskEvent;
use tokio::sync::broadcast;

/// Capacity of the in-process broadcast channel.
const BROADCAST_CAPACITY: usize = 256;

pub struct NotifyRouter {
    dispatchers: Vec<Arc<dyn NotificationDispatcher>>,
    /// Recent events (ring buffer).
    history: Mutex<VecDeque<TaskEvent>>,
    history_size: usize,
    events: broadcast::Sender<TaskEvent>,
}

impl NotifyRouter {
    pub fn new(history_size: usize) -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            dispatchers: Vec::new(),
            history: Mutex::new(VecDeque::new()),
            history_size: history_size.max(1),
            events,
        }
    }

    /// Register a dispatcher.
    pub fn register(&mut self, dispatcher: Arc<dyn NotificationDispatcher>) {
        tracing::debug!("📢 Notification dispatcher registered: {}", dispatcher.name());
        self.dispatchers.push(dispatcher);
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        self.register(dispatcher);
        self
    }

    pub fn dispatcher_names(&self) -> Vec<&str> {
        self.dispatchers.iter().map(|d| d.name()).collect()
    }

    fn lock_history(&self) -> MutexGuard<'_, VecDeque<TaskEvent>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an event and deliver it everywhere. Never fails, never blocks on delivery.
    pub fn publish(&self, event: TaskEvent) {
        {
            let mut history = self.lock_history();
            history.push_back(event.clone());
            if history.len() > self.history_size {
                history.pop_front();
            }
        }

        // No subscribers is fine.
        let _ = self.events.send(event.clone());

        if self.dispatchers.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No async runtime, skipping dispatch for '{}'", event.task_id);
            return;
        };
        for dispatcher in &self.dispatchers {
            let dispatcher = dispatcher.clone();
            let event = event.clone();
            runtime.spawn(async move {
                if let Err(e) = dispatcher.notify(&event).await {
                    tracing::warn!(
                        "⚠️ Notification via {} failed for '{}': {}",
                        dispatcher.name(),
                        event.task_id,
                        e
                    );
                }
            });
        }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Recent events, oldest first.
    pub fn history(&self) -> Vec<TaskEvent> {
        self.lock_history().iter().cloned().collect()
    }

    /// Recent events for one task, oldest first.
    pub fn history_for(&self, task_id: &str) -> Vec<TaskEvent> {
        self.lock_history()
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }
}

impl Default for NotifyRouter {
    fn default() -> Self {
        Self::new(100)
    }
}
