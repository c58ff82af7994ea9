//! Counting task — a fan-in join over independent contributions.
//!
//! Contributors mutate a shared result container in place and then call
//! [`CountingTask::count_down`]. The call that moves the counter from a
//! positive value to zero completes the underlying [`Task`] with the
//! container; every other countdown is a no-op for completion.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::task::Task;

struct Inner<V> {
    task: Task<V>,
    result: V,
    count: AtomicI64,
}

/// Fan-in join completing after `count` contributions.
///
/// `V` is expected to be a cheaply clonable, thread-safe container (for
/// example `Arc<Mutex<Vec<_>>>`); the same instance is handed to the
/// completion listeners.
pub struct CountingTask<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for CountingTask<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Send + 'static> CountingTask<V> {
    /// Create a join expecting `count` contributions into `result`.
    pub fn new(result: V, count: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                task: Task::new(),
                result,
                count: AtomicI64::new(count as i64),
            }),
        }
    }

    /// The shared result container contributors write into.
    pub fn result(&self) -> &V {
        &self.inner.result
    }

    /// Contributions still outstanding.
    pub fn count(&self) -> i64 {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Expect one more contribution.
    pub fn increment_count(&self) {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Record one contribution.
    ///
    /// Returns `true` for the single call that completed the task.
    pub fn count_down(&self) -> bool {
        let previous = self.inner.count.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            return self.inner.task.complete(self.inner.result.clone());
        }
        false
    }

    /// Handle to the joined task.
    pub fn task(&self) -> Task<V> {
        self.inner.task.clone()
    }
}
