//! The processor's mutable cursor into a pipeline or task set.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::pipeline::Task;

/// Tasks are taken from the front; new tasks are only ever pushed to the
/// front (for nested task sets and branches).
#[derive(Debug, Default)]
pub struct Flow {
    tasks: VecDeque<Arc<Task>>,
}

impl Flow {
    pub fn new(tasks: &[Arc<Task>]) -> Self {
        Self {
            tasks: tasks.iter().cloned().collect(),
        }
    }

    pub fn take_front(&mut self) -> Option<Arc<Task>> {
        self.tasks.pop_front()
    }

    /// Queue a batch at the front, preserving its internal order.
    pub fn push_front(&mut self, tasks: &[Arc<Task>]) {
        for task in tasks.iter().rev() {
            self.tasks.push_front(task.clone());
        }
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}
