use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

/// Comparator ordering queued jobs by priority.
///
/// Supplied by the build-scheduling subsystem; the coordination layer only
/// wires it in.
pub type PriorityComparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// The named shared priority queue hosted by queue-bearing nodes.
///
/// Jobs are held in comparator order; jobs comparing equal keep FIFO order
/// so equal-priority work is served fairly.
pub struct SharedQueue<T> {
    inner: Arc<SharedQueueInner<T>>,
}

// Handles only clone the shared inner state, so no `T: Clone` bound.
impl<T> Clone for SharedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct SharedQueueInner<T> {
    name: String,
    backup_count: u16,
    comparator: PriorityComparator<T>,
    items: Mutex<VecDeque<T>>,
}

impl<T: Send + 'static> SharedQueue<T> {
    pub(crate) fn new(
        name: impl Into<String>,
        backup_count: u16,
        comparator: PriorityComparator<T>,
    ) -> Self {
        Self {
            inner: Arc::new(SharedQueueInner {
                name: name.into(),
                backup_count,
                comparator,
                items: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn backup_count(&self) -> u16 {
        self.inner.backup_count
    }

    /// Enqueues a job at its priority position.
    pub fn offer(&self, item: T) {
        let mut items = self.inner.items.lock();
        // Insert after all entries that do not compare greater, keeping
        // arrival order among equal priorities.
        let idx = items
            .iter()
            .position(|existing| (self.inner.comparator)(existing, &item) == Ordering::Greater)
            .unwrap_or(items.len());
        items.insert(idx, item);
    }

    /// Takes the highest-priority job, if any.
    pub fn poll(&self) -> Option<T> {
        self.inner.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq, Clone)]
    struct Job {
        id: u32,
        priority: u8,
    }

    fn priority_queue() -> SharedQueue<Job> {
        SharedQueue::new(
            "build-job-queue",
            1,
            Arc::new(|a: &Job, b: &Job| a.priority.cmp(&b.priority)),
        )
    }

    #[test]
    fn jobs_come_out_in_priority_order() {
        let queue = priority_queue();
        queue.offer(Job { id: 1, priority: 5 });
        queue.offer(Job { id: 2, priority: 1 });
        queue.offer(Job { id: 3, priority: 3 });

        assert_eq!(queue.poll().unwrap().id, 2);
        assert_eq!(queue.poll().unwrap().id, 3);
        assert_eq!(queue.poll().unwrap().id, 1);
        assert!(queue.poll().is_none());
    }

    #[test]
    fn equal_priorities_keep_fifo_order() {
        let queue = priority_queue();
        queue.offer(Job { id: 1, priority: 2 });
        queue.offer(Job { id: 2, priority: 2 });
        queue.offer(Job { id: 3, priority: 2 });

        assert_eq!(queue.poll().unwrap().id, 1);
        assert_eq!(queue.poll().unwrap().id, 2);
        assert_eq!(queue.poll().unwrap().id, 3);
    }

    #[test]
    fn handles_clone_without_a_cloneable_job_type() {
        // Jobs carry non-cloneable resources; only the handle is cloned.
        struct ExclusiveJob {
            _workspace: Box<dyn Send>,
        }

        let queue: SharedQueue<ExclusiveJob> =
            SharedQueue::new("build-job-queue", 1, Arc::new(|_, _| Ordering::Equal));
        let handle = queue.clone();

        queue.offer(ExclusiveJob {
            _workspace: Box::new(()),
        });
        assert_eq!(handle.len(), 1);
        assert!(handle.poll().is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn len_tracks_contents() {
        let queue = priority_queue();
        assert!(queue.is_empty());
        queue.offer(Job { id: 1, priority: 1 });
        assert_eq!(queue.len(), 1);
        queue.poll();
        assert!(queue.is_empty());
    }
}
