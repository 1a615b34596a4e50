use std::fmt;

use bytesize::ByteSize;

use crate::Result;
use crate::backend::{Backend, is_thumb};
use crate::config::{ARM_PC_MASK, THREAD_STACK_SIZE};
use crate::emulator::{BlockOf, ContextOf, Emulator};
use crate::memory::{MemoryBlock, StackAllocator};
use crate::signal::{SignalTaskList, SignalTaskRef, SignalTasks};
use crate::task::TaskId;

/// The per-task machine state kept while another task owns the backend.
///
/// Holds the saved register snapshot, the guest stack and the pending signal
/// tasks. Backend resources are only released by [`destroy`], since freeing
/// them needs the emulator; dropping a context that still owns any of them
/// leaks them and reports it.
///
/// [`destroy`]: ExecutionContext::destroy
pub struct ExecutionContext<E: Emulator> {
    id: TaskId,
    saved: Option<ContextOf<E>>,
    stack: Option<BlockOf<E>>,
    signals: SignalTaskList,
}

impl<E: Emulator> ExecutionContext<E> {
    pub const fn new(id: TaskId) -> Self {
        Self {
            id,
            saved: None,
            stack: None,
            signals: SignalTaskList::new(),
        }
    }

    /// The task owning this context.
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_context_saved(&self) -> bool {
        self.saved.is_some()
    }

    /// Snapshots the live machine state, allocating the context slot on the
    /// first call and reusing it afterwards.
    pub fn save_context(&mut self, emu: &mut E) -> Result<()> {
        let backend = emu.backend_mut();
        let cx = match self.saved.take() {
            Some(cx) => cx,
            None => backend.context_alloc()?,
        };
        let cx = self.saved.insert(cx);
        backend.context_save(cx)?;
        tracing::debug!("saved context, task={}", self.id);
        Ok(())
    }

    /// Restores the saved state and runs until the PC reaches `until`.
    ///
    /// On 32-bit ARM the PC is truncated to 32 bits and tagged with the low
    /// bit when the core was suspended in Thumb state.
    ///
    /// # Panics
    ///
    /// Panics if no context has been saved.
    pub fn continue_run(&self, emu: &mut E, until: u64) -> Result<u64> {
        let Some(cx) = &self.saved else {
            panic!("cannot resume a task without saved context")
        };
        let arch = emu.arch();
        let backend = emu.backend_mut();
        backend.context_restore(cx)?;
        let mut pc = backend.reg_read(arch.pc())?;
        if arch.is_32bit() {
            pc &= ARM_PC_MASK;
            if is_thumb(&*backend)? {
                pc += 1;
            }
        }
        tracing::debug!("continue run, task={}, pc={pc:#x}, until={until:#x}", self.id);
        emu.emulate(pc, until)
    }

    /// Returns the top of this task's guest stack, allocating the stack on
    /// the first call.
    pub fn allocate_stack(&mut self, emu: &mut E) -> Result<u64> {
        let block = match self.stack.take() {
            Some(block) => block,
            None => {
                let block = emu.memory_mut().allocate(THREAD_STACK_SIZE, true)?;
                tracing::debug!(
                    "allocated stack, task={}, base={:#x}, size={}",
                    self.id,
                    block.base(),
                    ByteSize(THREAD_STACK_SIZE),
                );
                block
            },
        };
        Ok(self.stack.insert(block).base() + THREAD_STACK_SIZE)
    }

    /// Releases the saved context and the stack. Further calls do nothing.
    pub fn destroy(&mut self, emu: &mut E) {
        if let Some(cx) = self.saved.take() {
            emu.backend_mut().context_free(cx);
            tracing::debug!("freed context, task={}", self.id);
        }
        if let Some(block) = self.stack.take() {
            tracing::debug!("freed stack, task={}, base={:#x}", self.id, block.base());
            emu.memory_mut().free(block);
        }
    }

    pub fn add_signal_task(&mut self, task: SignalTaskRef) {
        self.signals.add(task);
    }

    pub fn remove_signal_task(&mut self, task: &SignalTaskRef) -> bool {
        self.signals.remove(task)
    }

    pub fn signal_task_list(&self) -> SignalTasks {
        self.signals.snapshot()
    }
}

impl<E: Emulator> fmt::Debug for ExecutionContext<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("saved", &self.saved.is_some())
            .field("stack", &self.stack.as_ref().map(|b| b.base()))
            .field("signals", &self.signals.len())
            .finish()
    }
}

impl<E: Emulator> Drop for ExecutionContext<E> {
    fn drop(&mut self) {
        if self.saved.is_some() || self.stack.is_some() {
            tracing::warn!("leaked resources of an undestroyed task, {self:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Arch, Register};
    use crate::sim::SimEmulator;

    type Cx = ExecutionContext<SimEmulator>;

    const UNTIL: u64 = 0xffff_0000;
    const TASK: TaskId = TaskId(1);

    #[test]
    fn stack_is_allocated_once() {
        let mut emu = SimEmulator::new(Arch::Arm64);
        let mut cx = Cx::new(TASK);
        let a = cx.allocate_stack(&mut emu).unwrap();
        let b = cx.allocate_stack(&mut emu).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, SimEmulator::MEMORY_BASE + THREAD_STACK_SIZE);
        assert_eq!(emu.memory.allocs(), 1);
        cx.destroy(&mut emu);
    }

    #[test]
    fn stack_exhaustion_propagates() {
        let mut emu = SimEmulator::new(Arch::Arm64);
        emu.memory = crate::sim::SimMemory::new(0x1000, THREAD_STACK_SIZE - 1);
        let mut cx = Cx::new(TASK);
        let err = cx.allocate_stack(&mut emu).unwrap_err();
        assert!(err.to_string().contains("out of guest memory"));
        cx.destroy(&mut emu);
        assert_eq!(emu.memory.frees(), 0);
    }

    #[test]
    fn context_is_allocated_once() {
        let mut emu = SimEmulator::new(Arch::Arm);
        let mut cx = Cx::new(TASK);
        assert!(!cx.is_context_saved());
        for _ in 0..5 {
            cx.save_context(&mut emu).unwrap();
        }
        assert!(cx.is_context_saved());
        let stats = emu.backend.stats();
        assert_eq!(stats.context_allocs, 1);
        assert_eq!(stats.context_saves, 5);
        cx.destroy(&mut emu);
    }

    #[test]
    fn save_keeps_live_state() {
        let mut emu = SimEmulator::new(Arch::Arm64);
        emu.backend.reg_write(Register::Arm64Pc, 0x4000).unwrap();
        let mut cx = Cx::new(TASK);
        cx.save_context(&mut emu).unwrap();
        assert_eq!(emu.backend.reg_read(Register::Arm64Pc).unwrap(), 0x4000);
        cx.destroy(&mut emu);
    }

    #[test]
    fn save_overwrites_snapshot() {
        let mut emu = SimEmulator::new(Arch::Arm64);
        let mut cx = Cx::new(TASK);
        emu.backend.reg_write(Register::Arm64Pc, 0x4000).unwrap();
        cx.save_context(&mut emu).unwrap();
        emu.backend.reg_write(Register::Arm64Pc, 0x5000).unwrap();
        cx.save_context(&mut emu).unwrap();
        emu.backend.reg_write(Register::Arm64Pc, 0x6000).unwrap();

        cx.continue_run(&mut emu, UNTIL).unwrap();
        assert_eq!(emu.backend.stats().runs, [(0x5000, UNTIL)]);
        cx.destroy(&mut emu);
    }

    #[test]
    fn round_trip_arm() {
        let mut emu = SimEmulator::new(Arch::Arm);
        let mut cx = Cx::new(TASK);
        for _ in 0..64 {
            let pc = fastrand::u64(..) & !1;
            let thumb = fastrand::bool();
            let r0 = fastrand::u64(..u32::MAX as u64);
            emu.backend.reg_write(Register::ArmPc, pc).unwrap();
            emu.backend.reg_write(Register::ArmR0, r0).unwrap();
            emu.backend.set_thumb(thumb);
            cx.save_context(&mut emu).unwrap();

            // Clobber the live state as another task would.
            emu.backend.reg_write(Register::ArmPc, 0).unwrap();
            emu.backend.reg_write(Register::ArmR0, 0).unwrap();
            emu.backend.set_thumb(!thumb);

            let ret = cx.continue_run(&mut emu, UNTIL).unwrap();
            let expected = (pc & ARM_PC_MASK) | thumb as u64;
            assert_eq!(emu.backend.stats().runs.last(), Some(&(expected, UNTIL)));
            assert_eq!(ret, r0);
        }
        cx.destroy(&mut emu);
    }

    #[test]
    fn thumb_tagging() {
        let mut emu = SimEmulator::new(Arch::Arm);
        emu.backend.reg_write(Register::ArmPc, 0x1_0000_8a40).unwrap();
        emu.backend.set_thumb(true);
        let mut cx = Cx::new(TASK);
        cx.save_context(&mut emu).unwrap();
        cx.continue_run(&mut emu, UNTIL).unwrap();
        assert_eq!(emu.backend.stats().runs, [(0x8a41, UNTIL)]);
        cx.destroy(&mut emu);
    }

    #[test]
    fn round_trip_arm64() {
        let mut emu = SimEmulator::new(Arch::Arm64);
        let mut cx = Cx::new(TASK);
        for _ in 0..64 {
            let pc = fastrand::u64(1 << 32..) & !3;
            emu.backend.reg_write(Register::Arm64Pc, pc).unwrap();
            // A stale Thumb flag must not leak into 64-bit resumes.
            emu.backend.set_thumb(true);
            cx.save_context(&mut emu).unwrap();
            emu.backend.reg_write(Register::Arm64Pc, 0).unwrap();

            cx.continue_run(&mut emu, UNTIL).unwrap();
            assert_eq!(emu.backend.stats().runs.last(), Some(&(pc, UNTIL)));
        }
        cx.destroy(&mut emu);
    }

    #[test]
    fn guest_fault_propagates() {
        let mut emu = SimEmulator::new(Arch::Arm64);
        let mut cx = Cx::new(TASK);
        cx.save_context(&mut emu).unwrap();
        emu.backend.fault("invalid memory read");
        let err = cx.continue_run(&mut emu, UNTIL).unwrap_err();
        assert!(err.to_string().contains("invalid memory read"));
        assert!(cx.is_context_saved());
        cx.destroy(&mut emu);
    }

    #[test]
    #[should_panic = "without saved context"]
    fn resume_without_context() {
        let mut emu = SimEmulator::new(Arch::Arm64);
        _ = Cx::new(TASK).continue_run(&mut emu, UNTIL);
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut emu = SimEmulator::new(Arch::Arm);
        let mut cx = Cx::new(TASK);
        cx.save_context(&mut emu).unwrap();
        cx.allocate_stack(&mut emu).unwrap();

        cx.destroy(&mut emu);
        assert!(!cx.is_context_saved());
        assert_eq!(emu.backend.live_contexts(), 0);
        assert_eq!(emu.memory.live_blocks(), 0);

        cx.destroy(&mut emu);
        assert_eq!(emu.backend.stats().context_frees, 1);
        assert_eq!(emu.memory.frees(), 1);
    }

    #[test]
    fn destroy_without_resources() {
        let mut emu = SimEmulator::new(Arch::Arm);
        Cx::new(TASK).destroy(&mut emu);
        assert_eq!(emu.backend.stats().context_frees, 0);
        assert_eq!(emu.memory.frees(), 0);
    }
}
