/// Size of the guest stack backing each thread (512KB).
pub const THREAD_STACK_SIZE: u64 = 0x80000;

/// Thumb state flag (`T`) of the ARM CPSR.
pub const THUMB_BIT: u64 = 1 << 5;
/// Width mask of a 32-bit ARM program counter.
pub const ARM_PC_MASK: u64 = 0xffff_ffff;
