//! Sandbox common contract, master lifecycle, and worker lifecycle.

pub mod debugger;
pub mod master;
pub mod worker;
pub mod wiring;

pub use master::{fork_worker, Master, MasterStep, PollMethod};
pub use worker::{Worker, WorkerStep};
