//! Registry of live task states.
//!
//! One [`TaskState`] per task id; handles are shared via `Arc` so control
//! operations (pause, cancel, message delivery) reach the same state the
//! engine is running against.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::state::TaskState;
use super::TaskId;

#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, Arc<TaskState>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a state under its own id. Returns `false` (leaving the
    /// existing entry untouched) when the id is already present.
    pub fn insert(&self, state: Arc<TaskState>) -> bool {
        let mut tasks = self.tasks.write().expect("registry lock poisoned");
        match tasks.entry(state.id()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(state);
                true
            }
        }
    }

    pub fn get(&self, id: TaskId) -> Option<Arc<TaskState>> {
        self.tasks
            .read()
            .expect("registry lock poisoned")
            .get(&id)
            .cloned()
    }

    pub fn remove(&self, id: TaskId) -> Option<Arc<TaskState>> {
        self.tasks
            .write()
            .expect("registry lock poisoned")
            .remove(&id)
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks
            .read()
            .expect("registry lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_exactly_once_per_id() {
        let registry = TaskRegistry::new();
        let state = Arc::new(TaskState::new("t"));
        let id = state.id();
        assert!(registry.insert(state.clone()));
        assert!(!registry.insert(state));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(id).is_some());
    }

    #[test]
    fn remove_drops_the_handle() {
        let registry = TaskRegistry::new();
        let state = Arc::new(TaskState::new("t"));
        let id = state.id();
        registry.insert(state);
        assert!(registry.remove(id).is_some());
        assert!(registry.get(id).is_none());
        assert!(registry.is_empty());
    }
}
