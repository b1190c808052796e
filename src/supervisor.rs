//! Process entry: load binary, construct+boot the master, print the banner,
//! then either run the master in-place (single worker, non-ephemeral) or
//! fan out worker threads.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, instrument, warn};

use crate::error::Error;
use crate::hypervisor::kvm::KvmMachine;
use crate::hypervisor::machine::Machine;
use crate::policy::Policy;
use crate::sandbox::{fork_worker, Master, MasterStep, Worker, WorkerStep};
use crate::telemetry::ResetCounters;

/// A read-only `mmap` of the program binary, released back to the kernel
/// with `madvise(MADV_DONTNEED)` after boot to free resident pages while
/// keeping the mapping live.
struct MappedBinary {
    ptr: *mut libc::c_void,
    len: usize,
}

unsafe impl Send for MappedBinary {}
unsafe impl Sync for MappedBinary {}

impl MappedBinary {
    fn open(path: &std::path::Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "empty binary"));
        }
        // SAFETY: `file` stays open for the duration of this mmap call and
        // the mapping does not outlive the process.
        let ptr = unsafe { libc::mmap(std::ptr::null_mut(), len, libc::PROT_READ, libc::MAP_PRIVATE, file.as_raw_fd(), 0) };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: valid for `len` bytes for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }

    /// Release resident pages while keeping the mapping itself live.
    fn release_rss(&self) {
        // SAFETY: `ptr`/`len` describe a live mapping owned by `self`.
        unsafe {
            let _ = libc::madvise(self.ptr, self.len, libc::MADV_DONTNEED);
        }
    }
}

impl Drop for MappedBinary {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` were established by `mmap` in `open`.
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

fn process_rss_mb() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * page_size::get() as u64 / (1024 * 1024))
}

/// Process entry point. Returns the process exit code.
#[instrument(skip(policy), fields(filename = %policy.filename.display()))]
pub fn run(policy: Policy) -> i32 {
    match run_inner(policy) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("fatal: {err}");
            1
        }
    }
}

fn run_inner(policy: Policy) -> Result<i32, Error> {
    if !crate::hypervisor::is_hypervisor_present() {
        return Err(Error::BootFault {
            source: anyhow::anyhow!("no suitable hypervisor present on this host"),
        });
    }

    let policy = Arc::new(policy);
    let binary = MappedBinary::open(&policy.filename).map_err(|e| Error::ConfigError {
        message: format!("could not map program binary: {e}"),
        fragment: policy.filename.display().to_string(),
    })?;

    let boot_start = Instant::now();
    let machine: Box<dyn Machine> = Box::new(
        KvmMachine::new(policy.max_main_memory as usize, binary.as_slice())
            .map_err(|e| Error::BootFault { source: e })?,
    );
    let mut master = Master::construct(machine, tenant_name(&policy), policy.clone(), binary.as_slice());

    let single_vm_non_ephemeral = policy.concurrency == 1 && !policy.ephemeral;
    let mut warmup_elapsed = None;
    master.initialize(single_vm_non_ephemeral, |_master| {
        let warmup_start = Instant::now();
        // Warmup requests (warmup_connect_requests / warmup_intra_connect_requests)
        // are a property of the guest's own request-handling loop; the
        // supervisor only bounds and times the warmup window the guest uses
        // to prime its caches.
        warmup_elapsed = Some(warmup_start.elapsed());
    })?;

    if single_vm_non_ephemeral && !master.is_waiting_for_requests() {
        return Ok(0);
    }

    binary.release_rss();

    info!(
        program = %policy.filename.display(),
        workers = policy.concurrency,
        ephemeral = policy.ephemeral,
        hugepages = policy.hugepages,
        poll_method = ?master.poll_method,
        boot_ms = boot_start.elapsed().as_millis() as u64,
        warmup_ms = warmup_elapsed.map(|d| d.as_millis() as u64),
        rss_mb = process_rss_mb(),
        "poolvisor: master booted",
    );
    println!(
        "poolvisor: {} workers={} ephemeral={} hugepages={} poll_method={:?} boot_ms={}{}{}",
        policy.filename.display(),
        policy.concurrency,
        policy.ephemeral,
        policy.hugepages,
        master.poll_method,
        boot_start.elapsed().as_millis(),
        warmup_elapsed
            .map(|d| format!(" warmup_ms={}", d.as_millis()))
            .unwrap_or_default(),
        process_rss_mb().map(|mb| format!(" rss_mb={mb}")).unwrap_or_default(),
    );

    if single_vm_non_ephemeral {
        drive_master_in_place(master);
        return Ok(0);
    }

    let master = Arc::new(master);
    let counters = Arc::new(ResetCounters::default());
    let verbose = policy.verbose;

    let handles: Vec<_> = (0..policy.concurrency)
        .map(|i| {
            let master = master.clone();
            let counters = counters.clone();
            std::thread::spawn(move || drive_worker(make_worker(master, i, &counters, verbose)))
        })
        .collect();

    for h in handles {
        let _ = h.join();
    }
    Ok(0)
}

fn make_worker(master: Arc<Master>, index: usize, counters: &Arc<ResetCounters>, verbose: bool) -> Worker {
    let mut worker = fork_worker(&master, index);
    let counters = counters.clone();
    worker.set_reset_callback(Arc::new(move |idx| counters.record_reset(idx, verbose)));
    worker
}

/// Drive the master directly on the main thread for the single-worker,
/// non-ephemeral path: no forking, no reset-to-master, matching the master's
/// own run-and-recover loop rather than the `Worker`/fork machinery.
fn drive_master_in_place(mut master: Master) {
    loop {
        match master.step_in_place() {
            MasterStep::Idle => {}
            MasterStep::Fault(err) => {
                warn!(%err, "master faulted, continuing");
            }
        }
    }
}

fn tenant_name(policy: &Policy) -> String {
    policy
        .filename
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "poolvisor".to_string())
}

/// Drive one worker forever. Never returns
/// under normal operation; a worker never voluntarily exits.
#[instrument(skip(worker), fields(worker_index = worker.index()), level = "debug")]
fn drive_worker(mut worker: Worker) {
    loop {
        match worker.step() {
            WorkerStep::Reset | WorkerStep::RecoveredFault(_) | WorkerStep::Idle => {}
            WorkerStep::ResetFailed(err) => {
                warn!(%err, "worker reset failed, continuing");
            }
        }
    }
}
