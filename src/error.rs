use thiserror::Error;

/// The crate-level error taxonomy.
///
/// Internal plumbing (hypervisor ioctls, ELF parsing, stack layout) propagates
/// through `anyhow::Result` and is converted into one of these variants at the
/// two boundaries that need a typed error: master boot, and the worker loop.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration document was malformed, or referenced something that
    /// could not be resolved (e.g. a DNS name).
    #[error("invalid configuration: {message} (in: {fragment})")]
    ConfigError { message: String, fragment: String },

    /// The master did not reach its wait-for-requests point within
    /// `max_boot_time`.
    #[error("master boot exceeded {budget_secs}s without reaching a request wait")]
    BootTimeout { budget_secs: f32 },

    /// The hypervisor reported a fault while booting the master.
    #[error("master boot faulted: {source}")]
    BootFault {
        #[source]
        source: anyhow::Error,
    },

    /// The master reached a suspension point, but it was not a recognized
    /// request-wait (and the single-VM clean-exit shortcut did not apply).
    #[error("master did not suspend in a request-wait syscall")]
    BootDidNotWait,

    /// A worker's request exceeded `max_req_time`.
    #[error("worker {worker_index} request exceeded {budget_secs}s")]
    WorkerTimeout { worker_index: usize, budget_secs: f32 },

    /// The hypervisor reported a fault while a worker was running a request.
    #[error("worker {worker_index} faulted: {source}")]
    WorkerFault {
        worker_index: usize,
        #[source]
        source: anyhow::Error,
    },

    /// The hypervisor could not reset a worker back to the master snapshot.
    #[error("worker {worker_index} failed to reset: {source}")]
    ResetFailure {
        worker_index: usize,
        #[source]
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
