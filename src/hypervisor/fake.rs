//! A deterministic [`Machine`] test double, standing in for real hardware
//! virtualization so `Policy`/`Sandbox`/`Worker` lifecycle logic is fully
//! testable without `/dev/kvm`. An in-process double rather than a
//! guest-binary fixture, queued up with scripted outcomes ahead of time.

use std::time::Duration;

use super::fds::FdCallbacks;
use super::machine::{ForkOptions, Machine, Registers, ResetOptions, RunOutcome};

/// What `FakeMachine::run` should report on its next call, queued by tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedOutcome {
    WaitingForRequests,
    Exited,
    Fault,
    TimedOut,
}

/// What `FakeMachine::reset_to_master` should report on its next call,
/// queued by tests. Separate from `ScriptedOutcome` since a reset failure is
/// orthogonal to what `run` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedReset {
    Succeeds,
    Fails,
}

#[derive(Debug, Clone)]
pub struct FakeMachine {
    pub regs: Registers,
    pub script: Vec<ScriptedOutcome>,
    pub run_count: usize,
    pub reset_count: usize,
    pub cow_ceiling_history: Vec<u64>,
    pub epoll_preemption_enabled: bool,
    pub forked_from_worker_index: Option<usize>,
    pub last_reset_opts: Option<ResetOptions>,
    pub loaded_argv: Vec<String>,
    pub loaded_envp: Vec<String>,
    pub reset_script: Vec<ScriptedReset>,
}

impl Default for FakeMachine {
    fn default() -> Self {
        Self {
            regs: Registers::default(),
            script: vec![ScriptedOutcome::WaitingForRequests],
            run_count: 0,
            reset_count: 0,
            cow_ceiling_history: Vec::new(),
            epoll_preemption_enabled: true,
            forked_from_worker_index: None,
            last_reset_opts: None,
            loaded_argv: Vec::new(),
            loaded_envp: Vec::new(),
            reset_script: Vec::new(),
        }
    }
}

impl FakeMachine {
    pub fn with_script(script: Vec<ScriptedOutcome>) -> Self {
        Self {
            script,
            ..Default::default()
        }
    }

    /// Queue up reset outcomes ahead of time; once exhausted, resets keep
    /// replaying the last queued outcome (or succeed, if none was queued).
    pub fn with_reset_script(mut self, reset_script: Vec<ScriptedReset>) -> Self {
        self.reset_script = reset_script;
        self
    }

    fn fork_concrete(&self, worker_index: usize) -> FakeMachine {
        let mut child = self.clone();
        child.forked_from_worker_index = Some(worker_index);
        child.run_count = 0;
        child
    }
}

impl Machine for FakeMachine {
    fn run(&mut self, _budget: Duration) -> RunOutcome {
        let outcome = if self.run_count < self.script.len() {
            self.script[self.run_count]
        } else {
            *self.script.last().unwrap_or(&ScriptedOutcome::Exited)
        };
        self.run_count += 1;
        match outcome {
            ScriptedOutcome::WaitingForRequests => RunOutcome::WaitingForRequests,
            ScriptedOutcome::Exited => RunOutcome::Exited,
            ScriptedOutcome::Fault => RunOutcome::Fault("scripted fault".to_string()),
            ScriptedOutcome::TimedOut => RunOutcome::TimedOut,
        }
    }

    fn registers(&self) -> Registers {
        self.regs
    }

    fn set_registers(&mut self, regs: Registers) {
        self.regs = regs;
    }

    fn prepare_copy_on_write(&mut self, working_mem_ceiling: u64) {
        self.cow_ceiling_history.push(working_mem_ceiling);
    }

    fn fork(&self, worker_index: usize, _opts: ForkOptions) -> Box<dyn Machine> {
        Box::new(self.fork_concrete(worker_index))
    }

    fn reset_to_master(&mut self, opts: ResetOptions) -> anyhow::Result<()> {
        let outcome = if self.reset_count < self.reset_script.len() {
            self.reset_script[self.reset_count]
        } else {
            *self.reset_script.last().unwrap_or(&ScriptedReset::Succeeds)
        };
        self.reset_count += 1;
        self.last_reset_opts = Some(opts);

        if outcome == ScriptedReset::Fails {
            return Err(anyhow::anyhow!("scripted reset failure"));
        }
        self.run_count = 0;
        Ok(())
    }

    fn install_fd_callbacks(&mut self, _callbacks: FdCallbacks) {}

    fn disable_epoll_preemption(&mut self) {
        self.epoll_preemption_enabled = false;
    }

    fn load_process_args(&mut self, argv: &[String], envp: &[String]) {
        self.loaded_argv = argv.to_vec();
        self.loaded_envp = envp.to_vec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_resets_run_count_and_records_worker_index() {
        let mut master = FakeMachine::with_script(vec![ScriptedOutcome::WaitingForRequests]);
        master.run(Duration::from_secs(1));
        let child = master.fork_concrete(3);
        assert_eq!(child.forked_from_worker_index, Some(3));
        assert_eq!(child.run_count, 0);
    }

    #[test]
    fn scripted_outcomes_play_back_in_order() {
        let mut m = FakeMachine::with_script(vec![
            ScriptedOutcome::WaitingForRequests,
            ScriptedOutcome::Fault,
        ]);
        assert_eq!(m.run(Duration::from_secs(1)), RunOutcome::WaitingForRequests);
        assert_eq!(m.run(Duration::from_secs(1)), RunOutcome::Fault("scripted fault".into()));
    }
}
