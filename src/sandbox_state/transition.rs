//! Transition metadata carried across an `evolve`/`devolve` call: each
//! `Cur -> Next` lifecycle step is paired with a small value type describing
//! what that particular transition needs to run.

use crate::hypervisor::machine::ForkOptions;

/// Implemented by the metadata type accompanying a particular
/// `Cur -> Next` transition.
pub trait TransitionMetadata<Cur, Next> {}

/// Fork a worker from the master. The sibling
/// `Worker -> Worker` reset transition is not modeled here: it is a
/// repeated in-place operation on a long-lived value, not a one-shot
/// consuming transition, so it is expressed instead through
/// `sandbox_state::reset::RestoreSandbox`.
#[derive(Debug, Clone, Copy)]
pub struct ForkFromMaster {
    pub worker_index: usize,
    pub options: ForkOptions,
}

impl<Cur, Next> TransitionMetadata<Cur, Next> for ForkFromMaster {}
