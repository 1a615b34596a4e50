//! A register-file backend that executes no instructions.
//!
//! Every run jumps straight to its stop address unless a stop was scripted
//! with [`SimBackend::stop_at`], which is how tests and the demo emulate a
//! guest thread yielding mid-way. All collaborator calls are counted in
//! [`SimStats`].

use std::collections::{HashMap, VecDeque};

use anyhow::anyhow;
use slab::Slab;

use crate::Result;
use crate::backend::{Arch, Backend, Register};
use crate::config::THUMB_BIT;
use crate::emulator::Emulator;
use crate::memory::{MemoryBlock, StackAllocator};

type Registers = HashMap<Register, u64>;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SimStats {
    pub context_allocs: usize,
    pub context_frees: usize,
    pub context_saves: usize,
    pub context_restores: usize,
    /// `(begin, until)` of every run, in order.
    pub runs: Vec<(u64, u64)>,
}

#[derive(Debug)]
enum Stop {
    At(u64),
    Fault(String),
}

/// A context slot inside [`SimBackend`].
#[derive(Debug)]
pub struct SimContext(usize);

#[derive(Debug)]
pub struct SimBackend {
    arch: Arch,
    regs: Registers,
    contexts: Slab<Registers>,
    stops: VecDeque<Stop>,
    stats: SimStats,
}

impl SimBackend {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            regs: Registers::new(),
            contexts: Slab::new(),
            stops: VecDeque::new(),
            stats: SimStats::default(),
        }
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    /// Number of allocated and not yet freed context slots.
    pub fn live_contexts(&self) -> usize {
        self.contexts.len()
    }

    /// Makes the next run stop at `pc` instead of its stop address.
    pub fn stop_at(&mut self, pc: u64) {
        self.stops.push_back(Stop::At(pc));
    }

    /// Makes the next run fail with a guest fault.
    pub fn fault(&mut self, msg: impl Into<String>) {
        self.stops.push_back(Stop::Fault(msg.into()));
    }

    pub fn set_thumb(&mut self, thumb: bool) {
        let cpsr = self.regs.entry(Register::ArmCpsr).or_default();
        if thumb {
            *cpsr |= THUMB_BIT;
        } else {
            *cpsr &= !THUMB_BIT;
        }
    }
}

impl Backend for SimBackend {
    type Context = SimContext;

    fn reg_read(&self, reg: Register) -> Result<u64> {
        Ok(self.regs.get(&reg).copied().unwrap_or_default())
    }

    fn reg_write(&mut self, reg: Register, val: u64) -> Result<()> {
        self.regs.insert(reg, val);
        Ok(())
    }

    fn context_alloc(&mut self) -> Result<SimContext> {
        self.stats.context_allocs += 1;
        Ok(SimContext(self.contexts.insert(Registers::new())))
    }

    fn context_save(&mut self, cx: &SimContext) -> Result<()> {
        let slot = self
            .contexts
            .get_mut(cx.0)
            .ok_or_else(|| anyhow!("invalid context {}", cx.0))?;
        slot.clone_from(&self.regs);
        self.stats.context_saves += 1;
        Ok(())
    }

    fn context_restore(&mut self, cx: &SimContext) -> Result<()> {
        let slot = self
            .contexts
            .get(cx.0)
            .ok_or_else(|| anyhow!("invalid context {}", cx.0))?;
        self.regs.clone_from(slot);
        self.stats.context_restores += 1;
        Ok(())
    }

    fn context_free(&mut self, cx: SimContext) {
        self.contexts.remove(cx.0);
        self.stats.context_frees += 1;
    }

    fn emulate(&mut self, begin: u64, until: u64) -> Result<u64> {
        self.stats.runs.push((begin, until));
        let arch = self.arch;
        let mut entry = begin;
        if arch.is_32bit() {
            self.set_thumb(begin & 1 != 0);
            entry &= !1;
        }
        self.regs.insert(arch.pc(), entry);
        let stop = match self.stops.pop_front() {
            Some(Stop::Fault(msg)) => return Err(anyhow!("guest fault at {entry:#x}: {msg}")),
            Some(Stop::At(pc)) => pc,
            None if arch.is_32bit() => until & !1,
            None => until,
        };
        self.regs.insert(arch.pc(), stop);
        self.reg_read(arch.arg0())
    }
}

/// A guest memory block handed out by [`SimMemory`].
#[derive(Debug)]
pub struct SimBlock {
    key: usize,
    base: u64,
    size: u64,
}

impl MemoryBlock for SimBlock {
    fn base(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// A bump allocator over a fixed guest address range.
#[derive(Debug)]
pub struct SimMemory {
    next: u64,
    end: u64,
    live: Slab<(u64, u64)>,
    /// Bases of freed blocks, keyed by block size.
    recycled: HashMap<u64, Vec<u64>>,
    allocs: usize,
    frees: usize,
}

impl SimMemory {
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            next: base,
            end: base + size,
            live: Slab::new(),
            recycled: HashMap::new(),
            allocs: 0,
            frees: 0,
        }
    }

    pub fn allocs(&self) -> usize {
        self.allocs
    }

    pub fn frees(&self) -> usize {
        self.frees
    }

    pub fn live_blocks(&self) -> usize {
        self.live.len()
    }
}

impl StackAllocator for SimMemory {
    type Block = SimBlock;

    fn allocate(&mut self, size: u64, _runtime: bool) -> Result<SimBlock> {
        let base = match self.recycled.get_mut(&size).and_then(Vec::pop) {
            Some(base) => base,
            None if self.end - self.next < size => {
                return Err(anyhow!("out of guest memory, requested={size:#x}"));
            },
            None => {
                self.next += size;
                self.next - size
            },
        };
        self.allocs += 1;
        let key = self.live.insert((base, size));
        Ok(SimBlock { key, base, size })
    }

    fn free(&mut self, block: SimBlock) {
        self.live.remove(block.key);
        self.recycled.entry(block.size).or_default().push(block.base);
        self.frees += 1;
    }
}

/// A [`SimBackend`] paired with a [`SimMemory`].
#[derive(Debug)]
pub struct SimEmulator {
    pub backend: SimBackend,
    pub memory: SimMemory,
}

impl SimEmulator {
    /// Guest range used for thread stacks.
    pub const MEMORY_BASE: u64 = 0xbff0_0000;
    pub const MEMORY_SIZE: u64 = 0x0100_0000;

    pub fn new(arch: Arch) -> Self {
        Self {
            backend: SimBackend::new(arch),
            memory: SimMemory::new(Self::MEMORY_BASE, Self::MEMORY_SIZE),
        }
    }
}

impl Emulator for SimEmulator {
    type Backend = SimBackend;
    type Memory = SimMemory;

    fn arch(&self) -> Arch {
        self.backend.arch
    }

    fn backend(&self) -> &SimBackend {
        &self.backend
    }

    fn backend_mut(&mut self) -> &mut SimBackend {
        &mut self.backend
    }

    fn memory(&self) -> &SimMemory {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut SimMemory {
        &mut self.memory
    }
}
