//! The `Machine` trait: the boundary standing in for the out-of-scope
//! external hypervisor library. Everything above
//! this trait (the `sandbox` module) is hypervisor-agnostic; everything
//! below it is a concrete backend (`hypervisor::kvm` on Linux, `FakeMachine`
//! for tests).
//!
//! A run spans "run until the guest yields, faults, or the budget expires",
//! rather than a single guest function call.

use std::time::Duration;

use crate::hypervisor::fds::FdCallbacks;

/// General-purpose x86-64 register subset the sandbox layer needs to read or
/// write across a suspension point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub rip: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rsp: u64,
}

/// Why a `run`/`resume` call returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The guest entered its recognized request-wait syscall.
    WaitingForRequests,
    /// The guest halted or exited cleanly.
    Exited,
    /// The hypervisor reported a fault (bad instruction, unmapped access,
    /// unsupported exit reason, ...).
    Fault(String),
    /// The run was cancelled by the timeout watcher before the guest
    /// produced any other outcome.
    TimedOut,
}

/// Options governing a fork-from-master or reset-to-master call.
#[derive(Debug, Clone, Copy)]
pub struct ForkOptions {
    pub max_mem: u64,
    pub max_cow_mem: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ResetOptions {
    pub max_mem: u64,
    pub max_cow_mem: u64,
    pub reset_free_work_mem: u64,
    pub reset_copy_all_registers: bool,
    pub reset_keep_all_work_memory: bool,
}

/// A single hardware-virtualized guest instance, at whatever stage of its
/// lifecycle (unbooted master, booted master, or worker fork).
pub trait Machine: Send {
    /// Run (or resume) the guest for up to `budget`. Blocking; returns once
    /// the guest yields, faults, exits, or the budget elapses.
    fn run(&mut self, budget: Duration) -> RunOutcome;

    fn registers(&self) -> Registers;
    fn set_registers(&mut self, regs: Registers);

    /// Adjust the copy-on-write working-memory ceiling.
    fn prepare_copy_on_write(&mut self, working_mem_ceiling: u64);

    /// Derive a copy-on-write child of this (master) machine.
    fn fork(&self, worker_index: usize, opts: ForkOptions) -> Box<dyn Machine>;

    /// Reset this (worker) machine back to its master snapshot.
    fn reset_to_master(&mut self, opts: ResetOptions) -> anyhow::Result<()>;

    /// Install the path/network rewrite callbacks for this machine's
    /// file-descriptor subsystem.
    fn install_fd_callbacks(&mut self, callbacks: FdCallbacks);

    /// Disable epoll preemption for a fork (the forked machine no longer
    /// preempts its run loop on incoming epoll activity).
    fn disable_epoll_preemption(&mut self);

    /// Lay out the Linux process-start stack (argv + envp + auxv) into the
    /// guest. Backend-specific; the sandbox layer
    /// only supplies the already-built argv/envp vectors.
    fn load_process_args(&mut self, argv: &[String], envp: &[String]);
}
