use crate::Result;
use crate::config::THUMB_BIT;

/// Register identifiers understood by a [`Backend`].
///
/// The discriminants are the Unicorn register ids, so a backend built on top
/// of Unicorn can pass them through untouched.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(i32)]
#[rustfmt::skip]
pub enum Register {
    ArmCpsr = 3,
    ArmLr   = 10,
    ArmPc   = 11,
    ArmSp   = 12,
    ArmR0   = 66,

    Arm64Lr = 2,
    Arm64Sp = 4,
    Arm64X0 = 199,
    Arm64Pc = 260,
}

impl Register {
    pub const fn id(self) -> i32 {
        self as i32
    }
}

/// Guest architecture, which decides register widths and ids.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Arch {
    Arm,
    Arm64,
}

#[rustfmt::skip]
impl Arch {
    pub const fn is_32bit(self) -> bool { matches!(self, Self::Arm) }

    pub const fn pc(self) -> Register {
        match self { Self::Arm => Register::ArmPc, Self::Arm64 => Register::Arm64Pc }
    }
    pub const fn sp(self) -> Register {
        match self { Self::Arm => Register::ArmSp, Self::Arm64 => Register::Arm64Sp }
    }
    pub const fn lr(self) -> Register {
        match self { Self::Arm => Register::ArmLr, Self::Arm64 => Register::Arm64Lr }
    }
    pub const fn arg0(self) -> Register {
        match self { Self::Arm => Register::ArmR0, Self::Arm64 => Register::Arm64X0 }
    }
}

/// The instruction-level emulation engine.
///
/// A backend holds exactly one live machine state. Snapshots of that state
/// are kept in opaque [`Context`](Backend::Context) handles owned by whoever
/// allocated them.
pub trait Backend {
    /// An opaque snapshot slot. It is neither `Clone` nor `Copy`, and
    /// [`context_free`](Backend::context_free) consumes it, so each handle is
    /// released exactly once.
    type Context;

    fn reg_read(&self, reg: Register) -> Result<u64>;

    fn reg_write(&mut self, reg: Register, val: u64) -> Result<()>;

    fn context_alloc(&mut self) -> Result<Self::Context>;

    /// Copies the live machine state into `cx`, overwriting its contents.
    fn context_save(&mut self, cx: &Self::Context) -> Result<()>;

    /// Loads the machine state stored in `cx`.
    fn context_restore(&mut self, cx: &Self::Context) -> Result<()>;

    fn context_free(&mut self, cx: Self::Context);

    /// Runs guest code from `begin` until the PC reaches `until` or the
    /// emulation is stopped, returning the completion value.
    fn emulate(&mut self, begin: u64, until: u64) -> Result<u64>;
}

/// Returns whether the 32-bit ARM core is currently in Thumb state.
pub fn is_thumb<B: Backend + ?Sized>(backend: &B) -> Result<bool> {
    Ok(backend.reg_read(Register::ArmCpsr)? & THUMB_BIT != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_ids() {
        assert_eq!(Arch::Arm.pc().id(), 11);
        assert_eq!(Arch::Arm64.pc().id(), 260);
        assert_eq!(Register::ArmCpsr.id(), 3);
        assert!(Arch::Arm.is_32bit());
        assert!(!Arch::Arm64.is_32bit());
    }
}
