//! State-machine traits for sandbox lifecycle transitions. This crate's
//! states are Master -> Worker (fork) and Worker -> Worker (reset, same
//! type, see `reset::RestoreSandbox`).

use super::transition::TransitionMetadata;

/// The minimal functionality of a sandbox in this crate's state machine.
pub trait Sandbox: Sized {
    /// By default a sandbox is not reusable across resets; `Worker`
    /// overrides this to `true`.
    fn is_reusable(&self) -> bool {
        false
    }
}

/// A sandbox that knows how to evolve into a next state.
///
/// `evolve` borrows rather than consumes `self`: a single frozen master
/// forks many workers over its lifetime, so the fork transition cannot take
/// ownership of it.
pub trait EvolvableSandbox<Cur: Sandbox, Next: Sandbox, T: TransitionMetadata<Cur, Next>>:
    Sandbox
{
    fn evolve(&self, tsn: T) -> Next;
}
