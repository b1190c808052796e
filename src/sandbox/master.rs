//! Master lifecycle: load and boot the master sandbox to its first
//! request-wait, then fork it into reusable workers.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::hypervisor::fds::FdCallbacks;
use crate::hypervisor::machine::{ForkOptions, Machine, Registers, RunOutcome};
use crate::policy::Policy;
use crate::sandbox::wiring::build_process_image;
use crate::sandbox::worker::Worker;
use crate::sandbox_state::{EvolvableSandbox, ForkFromMaster, Sandbox};

/// `RAX` value a guest observes when its wait syscall is resumed via the
/// resumption trap: `-EINTR`.
const EINTR_RAX: u64 = (-4i64) as u64;

/// Which readiness mechanism the guest's request-wait syscall represents.
/// Not derivable from the `Machine` boundary itself, so it defaults to
/// `Undefined` unless a caller knows better.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMethod {
    Epoll,
    Poll,
    Undefined,
}

/// Outcome of one in-place master run, used by the single-worker,
/// non-ephemeral path that drives the master directly rather than forking a
/// worker from it.
#[derive(Debug)]
pub enum MasterStep {
    /// The guest yielded (or exited) without incident.
    Idle,
    /// A fault occurred. Logged by the caller; the master has no snapshot
    /// of its own to reset to, so the loop simply keeps running it.
    Fault(Error),
}

/// An unbooted or booted master sandbox. The pristine, frozen fork source
/// and reset anchor for every worker.
pub struct Master {
    pub(crate) machine: Box<dyn Machine>,
    pub policy: Arc<Policy>,
    pub tenant_name: String,
    pub poll_method: PollMethod,
    waiting_for_requests: bool,
}

impl Sandbox for Master {}

impl Master {
    /// Construct an unbooted master from the program image.
    pub fn construct(mut machine: Box<dyn Machine>, tenant_name: String, policy: Arc<Policy>, image: &[u8]) -> Self {
        machine.prepare_copy_on_write(policy.max_main_memory);
        machine.install_fd_callbacks(FdCallbacks::for_master(policy.clone()));

        let process_image = build_process_image(&policy.filename.to_string_lossy(), &tenant_name, image, &policy);
        machine.load_process_args(&process_image.argv, &process_image.envp);

        Master {
            machine,
            policy,
            tenant_name,
            poll_method: PollMethod::Undefined,
            waiting_for_requests: false,
        }
    }

    pub fn is_waiting_for_requests(&self) -> bool {
        self.waiting_for_requests
    }

    /// The frozen master's machine, read-only fork source for every worker.
    pub(crate) fn machine_ref(&self) -> &dyn Machine {
        self.machine.as_ref()
    }

    /// Boot the master to its first request-wait. `single_vm_non_ephemeral` is the shortcut where a clean guest
    /// exit is accepted instead of treated as `BootDidNotWait` (scenario
    /// S1).
    pub fn initialize(
        &mut self,
        single_vm_non_ephemeral: bool,
        warmup: impl FnOnce(&mut Master),
    ) -> Result<(), Error> {
        let budget = Duration::from_secs_f32(self.policy.max_boot_time);
        match self.machine.run(budget) {
            RunOutcome::WaitingForRequests => {}
            RunOutcome::Exited if single_vm_non_ephemeral => {
                self.waiting_for_requests = false;
                return Ok(());
            }
            RunOutcome::Exited => return Err(Error::BootDidNotWait),
            RunOutcome::TimedOut => {
                return Err(Error::BootTimeout {
                    budget_secs: self.policy.max_boot_time,
                })
            }
            RunOutcome::Fault(msg) => {
                return Err(Error::BootFault {
                    source: anyhow::anyhow!(msg),
                })
            }
        }

        self.waiting_for_requests = true;
        warmup(self);

        // The resumption trap: emulate a return
        // from the wait syscall with EINTR, so every subsequent fork wakes
        // up as if interrupted out of its wait rather than mid-syscall.
        let regs = self.machine.registers();
        self.machine.set_registers(Registers {
            rip: regs.rcx,
            rax: EINTR_RAX,
            ..regs
        });

        self.machine.prepare_copy_on_write(0);
        Ok(())
    }

    /// Run the master itself for one iteration of the single-worker,
    /// non-ephemeral path: no fork, no reset-to-master, since the master is
    /// its own reset anchor and has nothing to reset to.
    pub fn step_in_place(&mut self) -> MasterStep {
        let budget = Duration::from_secs_f32(self.policy.max_req_time);
        match self.machine.run(budget) {
            RunOutcome::WaitingForRequests | RunOutcome::Exited => MasterStep::Idle,
            RunOutcome::TimedOut => MasterStep::Fault(Error::WorkerTimeout {
                worker_index: 0,
                budget_secs: self.policy.max_req_time,
            }),
            RunOutcome::Fault(msg) => MasterStep::Fault(Error::WorkerFault {
                worker_index: 0,
                source: anyhow::anyhow!(msg),
            }),
        }
    }
}

/// Forking a worker off the master is the crate's one `Master -> Worker`
/// lifecycle transition. `Worker::fork_from`
/// remains the ergonomic entry point for callers that already hold an
/// `Arc<Master>`; this impl is what actually wires that transition onto the
/// `EvolvableSandbox` state-machine contract.
impl EvolvableSandbox<Master, Worker, ForkFromMaster> for Arc<Master> {
    fn evolve(&self, tsn: ForkFromMaster) -> Worker {
        Worker::fork_from(self.clone(), tsn.worker_index)
    }
}

impl Sandbox for Arc<Master> {}

/// Build the `ForkFromMaster` transition metadata for `worker_index` from the
/// master's own policy, then evolve into the forked `Worker`. A free function
/// rather than an inherent impl since `Arc<Master>` is a foreign type.
pub fn fork_worker(master: &Arc<Master>, worker_index: usize) -> Worker {
    let options = ForkOptions {
        max_mem: master.policy.max_main_memory,
        max_cow_mem: master.policy.max_req_mem,
    };
    master.evolve(ForkFromMaster { worker_index, options })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::fake::{FakeMachine, ScriptedOutcome};

    fn master_with(script: Vec<ScriptedOutcome>) -> Master {
        let machine = Box::new(FakeMachine::with_script(script));
        Master::construct(machine, "tenant".into(), Arc::new(Policy::default()), &[])
    }

    #[test]
    fn boot_timeout_is_surfaced_scenario_s3() {
        let mut master = master_with(vec![ScriptedOutcome::TimedOut]);
        let err = master.initialize(false, |_| {}).unwrap_err();
        assert!(matches!(err, Error::BootTimeout { .. }));
    }

    #[test]
    fn clean_exit_is_fatal_unless_single_vm_shortcut_applies() {
        let mut master = master_with(vec![ScriptedOutcome::Exited]);
        assert!(matches!(
            master.initialize(false, |_| {}).unwrap_err(),
            Error::BootDidNotWait
        ));

        let mut master = master_with(vec![ScriptedOutcome::Exited]);
        assert!(master.initialize(true, |_| {}).is_ok());
    }

    #[test]
    fn wait_point_capture_sets_rax_to_eintr_and_rip_to_saved_rcx_property_6() {
        let mut master = master_with(vec![ScriptedOutcome::WaitingForRequests]);
        master.machine.set_registers(Registers {
            rip: 0x1000,
            rcx: 0x2000,
            ..Registers::default()
        });
        master.initialize(false, |_| {}).unwrap();
        assert!(master.is_waiting_for_requests());
        assert_eq!(master.machine.registers().rax, EINTR_RAX);
        assert_eq!(master.machine.registers().rip, 0x2000);
    }

    #[test]
    fn boot_fault_is_surfaced() {
        let mut master = master_with(vec![ScriptedOutcome::Fault]);
        assert!(matches!(
            master.initialize(false, |_| {}).unwrap_err(),
            Error::BootFault { .. }
        ));
    }

    #[test]
    fn fork_worker_evolves_master_into_a_reusable_worker() {
        let master = Arc::new(master_with(vec![ScriptedOutcome::WaitingForRequests]));
        let worker = fork_worker(&master, 7);
        assert_eq!(worker.index(), 7);
        assert!(worker.is_reusable());
    }

    #[test]
    fn step_in_place_runs_the_master_directly_without_forking() {
        let mut master = master_with(vec![ScriptedOutcome::WaitingForRequests]);
        assert!(matches!(master.step_in_place(), MasterStep::Idle));
    }

    #[test]
    fn step_in_place_surfaces_a_fault_without_resetting() {
        let mut master = master_with(vec![ScriptedOutcome::Fault]);
        assert!(matches!(
            master.step_in_place(),
            MasterStep::Fault(Error::WorkerFault { worker_index: 0, .. })
        ));
    }
}
