use std::fmt;

use crate::Result;
use crate::backend::Backend;
use crate::context::ExecutionContext;
use crate::emulator::Emulator;
use crate::task::{Task, TaskId};

/// A thread spawned by the guest, such as a `pthread_create` child.
///
/// The first dispatch calls `entry(arg)` on a fresh stack with the link
/// register pointing at `until`, so the thread stops there once the entry
/// function returns. Reaching `until` marks the worker dead.
pub struct WorkerTask<E: Emulator> {
    entry: u64,
    arg: u64,
    until: u64,
    exit_value: Option<u64>,
    cx: ExecutionContext<E>,
}

impl<E: Emulator> WorkerTask<E> {
    pub fn new(tid: u32, entry: u64, arg: u64, until: u64) -> Self {
        Self {
            entry,
            arg,
            until,
            exit_value: None,
            cx: ExecutionContext::new(TaskId(tid)),
        }
    }

    pub fn exit_value(&self) -> Option<u64> {
        self.exit_value
    }

    /// Terminates this worker with `value`, as `pthread_exit` does.
    pub fn exit(&mut self, value: u64) {
        tracing::debug!("worker exited, id={}, value={value:#x}", self.cx.id());
        self.exit_value = Some(value);
    }

    fn run(&mut self, emu: &mut E) -> Result<u64> {
        let sp = self.cx.allocate_stack(emu)?;
        let arch = emu.arch();
        let backend = emu.backend_mut();
        backend.reg_write(arch.sp(), sp)?;
        backend.reg_write(arch.arg0(), self.arg)?;
        backend.reg_write(arch.lr(), self.until)?;
        tracing::debug!(
            "run worker, entry={:#x}, arg={:#x}, sp={sp:#x}",
            self.entry,
            self.arg,
        );
        emu.emulate(self.entry, self.until)
    }
}

impl<E: Emulator> Task<E> for WorkerTask<E> {
    fn context(&self) -> &ExecutionContext<E> {
        &self.cx
    }

    fn context_mut(&mut self) -> &mut ExecutionContext<E> {
        &mut self.cx
    }

    fn dispatch(&mut self, emu: &mut E) -> Result<u64> {
        let _span = tracing::debug_span!("worker", id = %self.cx.id()).entered();
        if let Some(value) = self.exit_value {
            tracing::debug!("dispatched a dead worker");
            return Ok(value);
        }
        let ret = if self.cx.is_context_saved() {
            self.cx.continue_run(emu, self.until)?
        } else {
            self.run(emu)?
        };
        if emu.stopped_at(self.until)? {
            self.exit(ret);
        }
        Ok(ret)
    }

    fn is_main_thread(&self) -> bool {
        false
    }

    fn is_dead(&self) -> bool {
        self.exit_value.is_some()
    }
}

impl<E: Emulator> fmt::Debug for WorkerTask<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerTask")
            .field("id", &self.cx.id())
            .field("entry", &format_args!("{:#x}", self.entry))
            .field("exit_value", &self.exit_value)
            .field("cx", &self.cx)
            .finish_non_exhaustive()
    }
}
