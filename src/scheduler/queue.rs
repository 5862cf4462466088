use std::collections::VecDeque;

use uuid::Uuid;

/// FIFO of jobs waiting for an execution slot.
#[derive(Debug)]
pub struct PendingQueue<T> {
    entries: VecDeque<(Uuid, T)>,
}

impl<T> Default for PendingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn push_back(&mut self, id: Uuid, item: T) {
        self.entries.push_back((id, item));
    }

    /// Oldest waiting job.
    pub fn pop_front(&mut self) -> Option<(Uuid, T)> {
        self.entries.pop_front()
    }

    /// Take a job out of line, wherever it is.
    pub fn remove(&mut self, id: &Uuid) -> Option<T> {
        let index = self.position(id)?;
        self.entries.remove(index).map(|(_, item)| item)
    }

    /// Zero-based place in line.
    pub fn position(&self, id: &Uuid) -> Option<usize> {
        self.entries.iter().position(|(queued, _)| queued == id)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
