//! Execution contexts for guest threads sharing one emulation backend.
//!
//! A backend keeps a single live machine state. Each [`Task`] parks its
//! registers in an [`ExecutionContext`] while another task runs and restores
//! them on its next dispatch.

pub mod config;
pub mod sim;

mod backend;
pub use backend::{Arch, Backend, Register, is_thumb};

mod memory;
pub use memory::{MemoryBlock, StackAllocator};

mod emulator;
pub use emulator::{BlockOf, ContextOf, Emulator};

mod signal;
pub use signal::{SignalTask, SignalTaskList, SignalTaskRef, SignalTasks};

mod context;
pub use context::ExecutionContext;

mod task;
pub use task::{Task, TaskGuard, TaskId};

mod main_task;
pub use main_task::{MainTask, ThreadEntry};

mod worker_task;
pub use worker_task::WorkerTask;

pub use anyhow::{Error, Result};

#[test]
fn round_robin_switching() {
    use std::collections::VecDeque;

    use sim::SimEmulator;

    const UNTIL: u64 = 0xffff_0000;

    let mut emu = SimEmulator::new(Arch::Arm64);
    let mut tasks = VecDeque::<Box<dyn Task<SimEmulator>>>::new();
    tasks.push_back(Box::new(MainTask::<SimEmulator, _>::new(
        1,
        UNTIL,
        |emu: &mut SimEmulator, _: &mut ExecutionContext<SimEmulator>| emu.emulate(0x1000, UNTIL),
    )));
    for tid in 2..4 {
        let entry = 0x2000 * tid as u64;
        tasks.push_back(Box::new(WorkerTask::<SimEmulator>::new(tid, entry, 0, UNTIL)));
    }

    // Every task yields twice before returning.
    let mut yields = [2; 4];
    let mut finished = Vec::new();
    while let Some(mut task) = tasks.pop_front() {
        let id = task.id().0 as usize;
        if yields[id] > 0 {
            yields[id] -= 1;
            emu.backend.stop_at(0x2000 * id as u64 + 0x10 * yields[id]);
        }
        task.dispatch(&mut emu).unwrap();
        if task.is_dead() || emu.stopped_at(UNTIL).unwrap() {
            finished.push(task.id().0);
            task.destroy(&mut emu);
        } else {
            task.save_context(&mut emu).unwrap();
            tasks.push_back(task);
        }
    }

    assert_eq!(finished, [1, 2, 3]);
    assert_eq!(emu.backend.stats().context_allocs, 3);
    assert_eq!(emu.backend.live_contexts(), 0);
    assert_eq!(emu.memory.allocs(), 2);
    assert_eq!(emu.memory.live_blocks(), 0);
}

#[test]
fn guard_releases_on_unwind() {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use sim::SimEmulator;

    let mut emu = SimEmulator::new(Arch::Arm);
    let mut task = WorkerTask::<SimEmulator>::new(5, 0x8000, 0, 0xffff_0000);
    let res = catch_unwind(AssertUnwindSafe(|| {
        let mut guard = TaskGuard::new(&mut emu, &mut task);
        guard.emulator().backend.stop_at(0x8040);
        guard.dispatch().unwrap();
        guard.save_context().unwrap();
        assert!(guard.task().is_context_saved());
        panic!("killed");
    }));

    assert!(res.is_err());
    assert!(!task.is_context_saved());
    assert_eq!(emu.backend.live_contexts(), 0);
    assert_eq!(emu.memory.live_blocks(), 0);
}

#[test]
fn signal_tasks_follow_the_task() {
    use std::rc::Rc;

    use sim::SimEmulator;

    #[derive(Debug)]
    struct Kill;
    impl SignalTask for Kill {
        fn signum(&self) -> i32 {
            9
        }
    }

    let mut task = WorkerTask::<SimEmulator>::new(6, 0x8000, 0, 0xffff_0000);
    let kill: SignalTaskRef = Rc::new(Kill);
    assert!(task.signal_task_list().is_empty());
    task.add_signal_task(kill.clone());
    assert_eq!(task.signal_task_list().len(), 1);
    assert!(task.remove_signal_task(&kill));
    assert!(Rc::ptr_eq(&task.signal_task_list(), &task.signal_task_list()));
}

#[test]
fn stacks_survive_thread_churn() {
    use sim::SimEmulator;

    let mut emu = SimEmulator::new(Arch::Arm64);
    let capacity = SimEmulator::MEMORY_SIZE / config::THREAD_STACK_SIZE;
    for tid in 0..capacity as u32 * 2 {
        let mut task = WorkerTask::<SimEmulator>::new(tid, 0x5000, 0, 0xffff_0000);
        assert_eq!(task.id(), task.context().id());
        emu.backend.stop_at(0x5010);
        task.dispatch(&mut emu).unwrap();
        task.save_context(&mut emu).unwrap();
        task.destroy(&mut emu);
        assert_eq!(emu.memory().live_blocks(), 0);
    }
    assert_eq!(emu.memory().allocs(), capacity as usize * 2);
    assert_eq!(emu.backend.live_contexts(), 0);
}
