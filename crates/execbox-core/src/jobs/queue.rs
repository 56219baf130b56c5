//! FIFO intake queue shared by the gateway and the worker pool.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use super::JobId;

#[derive(Default)]
pub struct JobQueue {
    ids: Mutex<VecDeque<JobId>>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, id: JobId) {
        self.lock().push_back(id);
        self.notify.notify_one();
    }

    /// Wait for the oldest queued id.
    pub async fn pop(&self) -> JobId {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register as a waiter before checking so a concurrent push cannot slip past us.
            notified.as_mut().enable();

            if let Some(id) = self.lock().pop_front() {
                return id;
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<JobId> {
        self.lock().pop_front()
    }

    /// Remove a job that has not been picked up yet. Returns false if it was not queued.
    pub fn remove(&self, id: &JobId) -> bool {
        let mut ids = self.lock();
        match ids.iter().position(|queued| queued == id) {
            Some(pos) => {
                ids.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<JobId>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
