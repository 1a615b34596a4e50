use std::fmt;

use crate::Result;
use crate::context::ExecutionContext;
use crate::emulator::Emulator;
use crate::signal::{SignalTaskRef, SignalTasks};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical guest thread, as seen by the scheduler.
///
/// Implementors own an [`ExecutionContext`] and only decide how a dispatch
/// starts; everything else is delegated to the context.
pub trait Task<E: Emulator>: fmt::Debug {
    fn id(&self) -> TaskId {
        self.context().id()
    }

    fn context(&self) -> &ExecutionContext<E>;

    fn context_mut(&mut self) -> &mut ExecutionContext<E>;

    /// Runs this task until the backend stops, returning the completion
    /// value.
    fn dispatch(&mut self, emu: &mut E) -> Result<u64>;

    fn is_main_thread(&self) -> bool;

    fn is_dead(&self) -> bool;

    fn can_dispatch(&self) -> bool {
        true
    }

    fn is_context_saved(&self) -> bool {
        self.context().is_context_saved()
    }

    fn save_context(&mut self, emu: &mut E) -> Result<()> {
        self.context_mut().save_context(emu)
    }

    fn destroy(&mut self, emu: &mut E) {
        tracing::debug!("destroy task, id={}", self.id());
        self.context_mut().destroy(emu)
    }

    fn add_signal_task(&mut self, task: SignalTaskRef) {
        self.context_mut().add_signal_task(task)
    }

    fn remove_signal_task(&mut self, task: &SignalTaskRef) -> bool {
        self.context_mut().remove_signal_task(task)
    }

    fn signal_task_list(&self) -> SignalTasks {
        self.context().signal_task_list()
    }
}

/// Destroys a task once it goes out of scope.
///
/// Normal completion, early returns and unwinding all pass through `Drop`, so
/// the task's context and stack are released on every path.
pub struct TaskGuard<'a, E, T>
where
    E: Emulator,
    T: ?Sized + Task<E>,
{
    emu: &'a mut E,
    task: &'a mut T,
}

impl<'a, E, T> TaskGuard<'a, E, T>
where
    E: Emulator,
    T: ?Sized + Task<E>,
{
    pub fn new(emu: &'a mut E, task: &'a mut T) -> Self {
        Self { emu, task }
    }

    pub fn dispatch(&mut self) -> Result<u64> {
        self.task.dispatch(self.emu)
    }

    pub fn save_context(&mut self) -> Result<()> {
        self.task.save_context(self.emu)
    }

    pub fn task(&self) -> &T {
        &*self.task
    }

    pub fn emulator(&mut self) -> &mut E {
        &mut *self.emu
    }
}

impl<E, T> Drop for TaskGuard<'_, E, T>
where
    E: Emulator,
    T: ?Sized + Task<E>,
{
    fn drop(&mut self) {
        self.task.destroy(self.emu);
    }
}
