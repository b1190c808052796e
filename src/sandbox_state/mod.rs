//! Sandbox lifecycle state machine: a sandbox is `Sandbox`, knows how to
//! `evolve` into its next state, and (when reusable) how to `restore` itself
//! in place rather than evolving forward.

pub mod reset;
pub mod sandbox;
pub mod transition;

pub use reset::RestoreSandbox;
pub use sandbox::{EvolvableSandbox, Sandbox};
pub use transition::{ForkFromMaster, TransitionMetadata};
