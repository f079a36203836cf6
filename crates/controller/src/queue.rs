//! FIFO work queue keyed by object; a key queued twice runs once.

use std::collections::VecDeque;

use intent_core::ObjectKey;
use rustc_hash::FxHashSet;

#[derive(Debug, Default)]
pub struct WorkQueue {
    queued: FxHashSet<ObjectKey>,
    order: VecDeque<ObjectKey>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Returns false when the key was already waiting.
    pub fn push(&mut self, key: ObjectKey) -> bool {
        if !self.queued.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        true
    }

    pub fn pop(&mut self) -> Option<ObjectKey> {
        let key = self.order.pop_front()?;
        self.queued.remove(&key);
        Some(key)
    }

    pub fn remove(&mut self, key: &ObjectKey) -> bool {
        if !self.queued.remove(key) {
            return false;
        }
        self.order.retain(|k| k != key);
        true
    }
}
