use crate::Result;
use crate::backend::{Arch, Backend};
use crate::config::ARM_PC_MASK;
use crate::memory::StackAllocator;

/// The collaborators a task needs while it is dispatched.
pub trait Emulator {
    type Backend: Backend;
    type Memory: StackAllocator;

    fn arch(&self) -> Arch;

    fn backend(&self) -> &Self::Backend;

    fn backend_mut(&mut self) -> &mut Self::Backend;

    fn memory(&self) -> &Self::Memory;

    fn memory_mut(&mut self) -> &mut Self::Memory;

    fn is_32bit(&self) -> bool {
        self.arch().is_32bit()
    }

    fn emulate(&mut self, begin: u64, until: u64) -> Result<u64> {
        tracing::trace!("emulate, begin={begin:#x}, until={until:#x}");
        self.backend_mut().emulate(begin, until)
    }

    /// Returns whether the live PC sits at `until`, ignoring the Thumb tag.
    fn stopped_at(&self, until: u64) -> Result<bool> {
        let arch = self.arch();
        let pc = self.backend().reg_read(arch.pc())?;
        Ok(if arch.is_32bit() {
            pc & ARM_PC_MASK == until & ARM_PC_MASK & !1
        } else {
            pc == until
        })
    }
}

pub type ContextOf<E> = <<E as Emulator>::Backend as Backend>::Context;
pub type BlockOf<E> = <<E as Emulator>::Memory as StackAllocator>::Block;
