use std::fmt;

use crate::Result;
use crate::context::ExecutionContext;
use crate::emulator::Emulator;
use crate::task::{Task, TaskId};

/// The guest-visible entry computation of a thread.
///
/// It runs once, on the first dispatch, and handles its own suspension
/// through the given context.
pub trait ThreadEntry<E: Emulator> {
    fn run(&mut self, emu: &mut E, cx: &mut ExecutionContext<E>) -> Result<u64>;
}

impl<E, F> ThreadEntry<E> for F
where
    E: Emulator,
    F: FnMut(&mut E, &mut ExecutionContext<E>) -> Result<u64>,
{
    fn run(&mut self, emu: &mut E, cx: &mut ExecutionContext<E>) -> Result<u64> {
        self(emu, cx)
    }
}

/// The initial thread of the guest process.
///
/// The first dispatch runs the entry; once a context has been saved, every
/// later dispatch resumes it instead.
pub struct MainTask<E: Emulator, R> {
    until: u64,
    entry: R,
    cx: ExecutionContext<E>,
}

impl<E, R> MainTask<E, R>
where
    E: Emulator,
    R: ThreadEntry<E>,
{
    /// The main thread shares its id with the process.
    pub fn new(pid: u32, until: u64, entry: R) -> Self {
        Self {
            until,
            entry,
            cx: ExecutionContext::new(TaskId(pid)),
        }
    }

    pub fn until(&self) -> u64 {
        self.until
    }
}

impl<E, R> Task<E> for MainTask<E, R>
where
    E: Emulator,
    R: ThreadEntry<E>,
{
    fn context(&self) -> &ExecutionContext<E> {
        &self.cx
    }

    fn context_mut(&mut self) -> &mut ExecutionContext<E> {
        &mut self.cx
    }

    fn dispatch(&mut self, emu: &mut E) -> Result<u64> {
        let _span = tracing::debug_span!("main", id = %self.cx.id()).entered();
        if self.cx.is_context_saved() {
            return self.cx.continue_run(emu, self.until);
        }
        tracing::debug!("run main thread, until={:#x}", self.until);
        self.entry.run(emu, &mut self.cx)
    }

    fn is_main_thread(&self) -> bool {
        true
    }

    // TODO: report death once the scheduler tracks main thread exit status.
    fn is_dead(&self) -> bool {
        false
    }
}

impl<E: Emulator, R> fmt::Debug for MainTask<E, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainTask")
            .field("id", &self.cx.id())
            .field("until", &format_args!("{:#x}", self.until))
            .field("cx", &self.cx)
            .finish_non_exhaustive()
    }
}
