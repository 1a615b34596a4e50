use std::fmt;
use std::rc::Rc;

/// A pending signal delivery queued against a task.
///
/// Its contents are interpreted by the signal-delivery layer only.
pub trait SignalTask: fmt::Debug {
    fn signum(&self) -> i32;
}

pub type SignalTaskRef = Rc<dyn SignalTask>;

/// An immutable view of the pending signal tasks.
pub type SignalTasks = Rc<[SignalTaskRef]>;

thread_local! {
    static EMPTY: SignalTasks = Rc::from(Vec::new());
}

/// Ordered storage of pending signal tasks.
#[derive(Debug, Default)]
pub struct SignalTaskList(Vec<SignalTaskRef>);

impl SignalTaskList {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn add(&mut self, task: SignalTaskRef) {
        tracing::trace!("add signal task, signum={}", task.signum());
        self.0.push(task);
    }

    /// Removes the first occurrence of `task`, compared by identity.
    pub fn remove(&mut self, task: &SignalTaskRef) -> bool {
        let Some(i) = self.0.iter().position(|t| Rc::ptr_eq(t, task)) else {
            return false;
        };
        tracing::trace!("remove signal task, signum={}", task.signum());
        self.0.remove(i);
        true
    }

    /// Returns a snapshot detached from this list. All empty snapshots share
    /// one allocation.
    pub fn snapshot(&self) -> SignalTasks {
        if self.0.is_empty() {
            EMPTY.with(Rc::clone)
        } else {
            Rc::from(self.0.as_slice())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Pending(i32);

    impl SignalTask for Pending {
        fn signum(&self) -> i32 {
            self.0
        }
    }

    fn signums(tasks: &[SignalTaskRef]) -> Vec<i32> {
        tasks.iter().map(|t| t.signum()).collect()
    }

    #[test]
    fn empty_snapshots_are_shared() {
        let list = SignalTaskList::new();
        let a = list.snapshot();
        let b = list.snapshot();
        assert!(a.is_empty());
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(a[..].len(), b[..].len());
    }

    #[test]
    fn snapshot_is_detached() {
        let mut list = SignalTaskList::new();
        let sigint: SignalTaskRef = Rc::new(Pending(2));
        let sigusr1: SignalTaskRef = Rc::new(Pending(10));
        list.add(sigint.clone());
        list.add(sigusr1.clone());

        let first = list.snapshot();
        let mut copied = first.to_vec();
        copied.clear();
        list.remove(&sigint);

        assert_eq!(signums(&first), [2, 10]);
        assert_eq!(signums(&list.snapshot()), [10]);
        assert!(!Rc::ptr_eq(&first, &list.snapshot()));
    }

    #[test]
    fn remove_keeps_order() {
        let mut list = SignalTaskList::new();
        let tasks: Vec<SignalTaskRef> = [2, 10, 2, 15]
            .into_iter()
            .map(|n| Rc::new(Pending(n)) as SignalTaskRef)
            .collect();
        for t in &tasks {
            list.add(t.clone());
        }
        assert!(list.remove(&tasks[2]));
        assert!(!list.remove(&tasks[2]));
        assert_eq!(signums(&list.snapshot()), [2, 10, 15]);

        // Duplicates of the same task are removed one at a time.
        list.add(tasks[0].clone());
        assert!(list.remove(&tasks[0]));
        assert_eq!(signums(&list.snapshot()), [10, 15, 2]);
        assert_eq!(list.len(), 3);
    }
}
