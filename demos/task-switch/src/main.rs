use std::collections::{HashMap, VecDeque};
use std::str::FromStr;

use anyhow::Result;
use argh::FromArgs;
use emu_thread::sim::SimEmulator;
use emu_thread::{Arch, Emulator, ExecutionContext, MainTask, Task, TaskId, WorkerTask};

/// Address the guest returns to when a thread entry finishes.
const UNTIL: u64 = 0xffff_0000;
const MAIN_ENTRY: u64 = 0x1_0000;
const WORKER_ENTRY: u64 = 0x2_0000;

type Tasks = VecDeque<Box<dyn Task<SimEmulator>>>;

#[derive(Debug, FromArgs)]
/// Switch guest threads on a simulated backend
#[argh(help_triggers("--help"))]
struct Args {
    /// guest architecture, may be "arm" or "arm64"
    #[argh(option, default = "ArchArg(Arch::Arm64)")]
    arch: ArchArg,
    /// start threads in Thumb state (arm only)
    #[argh(switch)]
    thumb: bool,
    /// number of spawned threads
    #[argh(option, default = "2")]
    workers: u32,
    /// how many times each thread yields before returning
    #[argh(option, default = "3")]
    rounds: usize,
}

#[derive(Debug)]
struct ArchArg(Arch);

impl FromStr for ArchArg {
    type Err = &'static str;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arm" => Ok(Self(Arch::Arm)),
            "arm64" => Ok(Self(Arch::Arm64)),
            _ => Err("invalid arch"),
        }
    }
}

pub fn main() -> Result<()> {
    let args = argh::from_env::<Args>();
    tracing_subscriber::fmt()
        .without_time()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let arch = args.arch.0;
    let tag = u64::from(args.thumb && arch.is_32bit());
    let mut emu = SimEmulator::new(arch);
    let mut tasks = Tasks::new();
    tasks.push_back(Box::new(MainTask::<SimEmulator, _>::new(
        1,
        UNTIL,
        move |emu: &mut SimEmulator, _: &mut ExecutionContext<SimEmulator>| {
            emu.emulate(MAIN_ENTRY | tag, UNTIL)
        },
    )));
    for tid in 2..args.workers + 2 {
        let entry = WORKER_ENTRY * tid as u64;
        let arg = fastrand::u64(..0x1000);
        tasks.push_back(Box::new(WorkerTask::<SimEmulator>::new(tid, entry | tag, arg, UNTIL)));
    }

    let res = schedule(&mut emu, &mut tasks, args.rounds);
    for mut task in tasks.drain(..) {
        task.destroy(&mut emu);
    }
    res?;

    let stats = emu.backend.stats();
    tracing::info!(
        "done, runs={}, context_allocs={}, context_frees={}",
        stats.runs.len(),
        stats.context_allocs,
        stats.context_frees,
    );
    Ok(())
}

/// Dispatches tasks in turn until the main thread returns.
fn schedule(emu: &mut SimEmulator, tasks: &mut Tasks, rounds: usize) -> Result<()> {
    let mut yields = HashMap::<TaskId, usize>::new();
    while let Some(mut task) = tasks.pop_front() {
        let id = task.id();
        let left = yields.entry(id).or_insert(rounds);
        if *left > 0 {
            *left -= 1;
            // Pretend the guest called `sched_yield` somewhere in its body.
            let pc = WORKER_ENTRY * u64::from(id.0) + 4 * fastrand::u64(1..0x400);
            emu.backend.stop_at(pc);
        }

        let ret = task.dispatch(emu)?;
        if task.is_dead() {
            tracing::info!("thread exited, id={id}, value={ret:#x}");
            task.destroy(emu);
        } else if task.is_main_thread() && emu.stopped_at(UNTIL)? {
            tracing::info!("main thread returned, value={ret:#x}");
            task.destroy(emu);
            return Ok(());
        } else {
            task.save_context(emu)?;
            tasks.push_back(task);
        }
    }
    Ok(())
}
