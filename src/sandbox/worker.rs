//! Worker lifecycle: the per-thread fork/run/reset loop, restoring a worker
//! to its master snapshot via `RestoreSandbox` rather than tearing it down.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::hypervisor::fds::FdCallbacks;
use crate::hypervisor::machine::{ForkOptions, Machine, ResetOptions, RunOutcome};
use crate::sandbox::debugger::open_debugger;
use crate::sandbox::master::Master;
use crate::sandbox_state::{RestoreSandbox, Sandbox};

/// What happened in one iteration of the worker loop.
#[derive(Debug)]
pub enum WorkerStep {
    /// The guest yielded (or the loop is in ephemeral mode) and the worker
    /// was reset back to the master.
    Reset,
    /// The guest yielded and, because the worker is not ephemeral and did
    /// not fault, no reset was needed this iteration.
    Idle,
    /// A fault occurred, was logged, and recovered via reset.
    RecoveredFault(Error),
    /// A reset itself failed; logged, loop continues regardless.
    ResetFailed(Error),
}

/// A copy-on-write fork of the master, driven on its own OS thread.
pub struct Worker {
    machine: Box<dyn Machine>,
    master: Arc<Master>,
    worker_index: usize,
    reset_needed: bool,
    reset_callback: Option<Arc<dyn Fn(usize) + Send + Sync>>,
}

impl Sandbox for Worker {
    fn is_reusable(&self) -> bool {
        true
    }
}

impl RestoreSandbox for Worker {
    fn needs_state_reset(&self) -> bool {
        self.reset_needed
    }

    fn set_needs_state_reset(&mut self, value: bool) {
        self.reset_needed = value;
    }
}

impl Worker {
    /// Fork a worker from the master.
    pub fn fork_from(master: Arc<Master>, worker_index: usize) -> Self {
        let opts = ForkOptions {
            max_mem: master.policy.max_main_memory,
            max_cow_mem: master.policy.max_req_mem,
        };
        let mut machine = master.machine_ref().fork(worker_index, opts);
        machine.install_fd_callbacks(FdCallbacks::for_fork(master.policy.clone()));
        machine.disable_epoll_preemption();

        if std::env::var_os("DEBUG_FORK").is_some() {
            open_debugger(worker_index);
        }

        Worker {
            machine,
            master,
            worker_index,
            reset_needed: false,
            reset_callback: None,
        }
    }

    pub fn set_reset_callback(&mut self, cb: Arc<dyn Fn(usize) + Send + Sync>) {
        self.reset_callback = Some(cb);
    }

    pub fn index(&self) -> usize {
        self.worker_index
    }

    /// Explicitly mark this worker dirty, forcing its next reset to discard
    /// all working memory.
    pub fn mark_reset_needed(&mut self) {
        self.reset_needed = true;
    }

    fn reset_options(&self) -> ResetOptions {
        ResetOptions {
            max_mem: self.master.policy.address_space,
            max_cow_mem: self.master.policy.max_req_mem,
            reset_free_work_mem: self.master.policy.limit_req_mem,
            reset_copy_all_registers: true,
            reset_keep_all_work_memory: self.master.policy.ephemeral_keep_working_memory,
        }
    }

    fn reset(&mut self) -> anyhow::Result<()> {
        let ephemeral_keep = self.master.policy.ephemeral_keep_working_memory;
        let base = self.reset_options();
        let opts = self.next_reset_options(base, ephemeral_keep);
        self.machine.reset_to_master(opts)?;
        if let Some(cb) = &self.reset_callback {
            cb(self.worker_index);
        }
        Ok(())
    }

    /// One iteration of the worker loop.
    pub fn step(&mut self) -> WorkerStep {
        let budget = Duration::from_secs_f32(self.master.policy.max_req_time);
        let outcome = self.machine.run(budget);

        let failure = match outcome {
            RunOutcome::WaitingForRequests | RunOutcome::Exited => None,
            RunOutcome::TimedOut => Some(Error::WorkerTimeout {
                worker_index: self.worker_index,
                budget_secs: self.master.policy.max_req_time,
            }),
            RunOutcome::Fault(msg) => Some(Error::WorkerFault {
                worker_index: self.worker_index,
                source: anyhow::anyhow!(msg),
            }),
        };

        if !self.master.policy.ephemeral && failure.is_none() {
            return WorkerStep::Idle;
        }

        if failure.is_some() && std::env::var_os("DEBUG").is_some() {
            open_debugger(self.worker_index);
        }

        let reset_result = self.reset();
        match (failure, reset_result) {
            (Some(err), Ok(())) => WorkerStep::RecoveredFault(err),
            (None, Ok(())) => WorkerStep::Reset,
            (_, Err(err)) => WorkerStep::ResetFailed(Error::ResetFailure {
                worker_index: self.worker_index,
                source: err,
            }),
        }
    }
}
