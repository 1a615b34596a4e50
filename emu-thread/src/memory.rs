use crate::Result;

/// A region of guest memory handed out by a [`StackAllocator`].
pub trait MemoryBlock {
    /// Guest address of the lowest byte of this block.
    fn base(&self) -> u64;

    fn size(&self) -> u64;
}

/// Carves blocks out of the emulated address space.
pub trait StackAllocator {
    type Block: MemoryBlock;

    /// Allocates `size` bytes. `runtime` marks memory owned by the emulator
    /// itself rather than by the guest program.
    fn allocate(&mut self, size: u64, runtime: bool) -> Result<Self::Block>;

    fn free(&mut self, block: Self::Block);
}
