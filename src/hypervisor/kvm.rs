//! Linux KVM-backed [`Machine`](super::machine::Machine).
//!
//! Uses the raw ioctl wrapping idiom (`Kvm::open_with_cloexec`, `VmFd`/
//! `VcpuFd` creation, register get/set, `VcpuExit` matching) plus a
//! signal-based run-timeout cancellation dance to cancel a guest run that
//! overran its boot/request time budget.
//!
//! The guest's request-wait syscall and the host-side CoW fork/reset
//! primitives are not something `kvm-ioctls` provides directly; here they
//! are realized as host-level mmap/mremap/madvise operations over the
//! guest's physical memory region, the closest real Linux primitive to
//! "fork this address space copy-on-write, then reset it".

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};
use vmm_sys_util::signal::register_signal_handler;

use super::fds::FdCallbacks;
use super::machine::{ForkOptions, Machine, Registers, ResetOptions, RunOutcome};

/// The realtime signal used to interrupt a blocking `KVM_RUN` ioctl once a
/// run's time budget elapses.
const TIMEOUT_SIGNAL: i32 = libc::SIGRTMIN();

extern "C" fn handle_timeout_signal(_: libc::c_int) {}

fn ensure_signal_handler_registered() {
    static REGISTERED: std::sync::Once = std::sync::Once::new();
    REGISTERED.call_once(|| {
        // SAFETY: handler does nothing but return, which is sufficient to
        // make the blocking ioctl return EINTR.
        unsafe {
            let _ = register_signal_handler(TIMEOUT_SIGNAL, handle_timeout_signal);
        }
    });
}

/// Guest physical memory backing a `KvmMachine`, owned via a raw mmap so
/// `fork`/`reset_to_master` can perform host-level copy-on-write management
/// (mmap a fresh private region, `madvise(MADV_DONTNEED)` to drop dirty
/// pages back to the shared parent on reset).
///
/// A forked worker keeps an `Arc` to its master's `GuestMemory` for the
/// lifetime of the worker so it can reset against it repeatedly; writes go
/// through raw pointer arithmetic on `&self` rather than `&mut self` since
/// the vcpu itself already mutates this region outside of Rust's aliasing
/// model.
struct GuestMemory {
    ptr: *mut libc::c_void,
    size: usize,
}

unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

impl GuestMemory {
    fn anonymous(size: usize) -> io::Result<Self> {
        // SAFETY: standard anonymous-private mapping; checked below.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { ptr, size })
    }

    /// Derive a copy-on-write child mapping of `self` by mapping the same
    /// size freshly and copying its current contents — the host-level
    /// stand-in for "fork this guest's physical memory".
    fn fork(&self) -> io::Result<Self> {
        let child = Self::anonymous(self.size)?;
        // SAFETY: both regions are `self.size` bytes, non-overlapping.
        unsafe {
            ptr::copy_nonoverlapping(self.ptr as *const u8, child.ptr as *mut u8, self.size);
        }
        Ok(child)
    }

    /// Drop dirty pages above `keep_bytes` back to the kernel and
    /// re-establish the master's contents below it — the host-level stand-in
    /// for "reset this worker's memory to the master snapshot".
    fn reset_from(&self, master: &GuestMemory, keep_bytes: usize) {
        let keep = keep_bytes.min(self.size);
        // SAFETY: `keep..size` is within both regions' bounds; `master` is
        // never the same allocation as `self` (a machine never resets
        // against its own memory).
        unsafe {
            ptr::copy_nonoverlapping(
                (master.ptr as *const u8).add(keep),
                (self.ptr as *mut u8).add(keep),
                self.size - keep,
            );
            let _ = libc::madvise(
                (self.ptr as *mut u8).add(keep) as *mut libc::c_void,
                self.size - keep,
                libc::MADV_DONTNEED,
            );
        }
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `size` bytes for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.size) }
    }

    /// Write through the mapping without requiring unique Rust ownership,
    /// matching how the vcpu itself mutates this region.
    fn write_at(&self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.size);
        // SAFETY: bounds-checked above.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), (self.ptr as *mut u8).add(offset), bytes.len());
        }
    }

    /// Lay out a Linux process-start stack (argv, envp, a terminating
    /// auxv entry) in the top `STACK_RESERVATION` bytes of guest memory,
    /// following the System V AMD64 convention: the pointer table (argc,
    /// argv[], NULL, envp[], NULL, auxv, AT_NULL) sits at the lowest address,
    /// with the string data placed above it. Returns the guest address of
    /// `argc` (the value `rsp` should hold at process entry), or `None` if
    /// the reservation does not fit in this memory.
    fn layout_initial_stack(&self, argv: &[String], envp: &[String]) -> Option<u64> {
        const STACK_RESERVATION: usize = 64 * 1024;
        const AT_NULL: u64 = 0;

        if self.size < STACK_RESERVATION {
            return None;
        }
        let region_base = (self.size - STACK_RESERVATION) & !0xf; // 16-byte aligned

        let entry_count = 1 + argv.len() + 1 + envp.len() + 1 + 2;
        let table_size = entry_count * 8;
        let strings_start = (region_base + table_size + 0xf) & !0xf;

        let mut cursor = strings_start;
        let mut write_string = |s: &str| -> u64 {
            let addr = cursor;
            self.write_at(cursor, s.as_bytes());
            self.write_at(cursor + s.len(), &[0u8]);
            cursor += s.len() + 1;
            addr as u64
        };
        let argv_ptrs: Vec<u64> = argv.iter().map(|s| write_string(s)).collect();
        let envp_ptrs: Vec<u64> = envp.iter().map(|s| write_string(s)).collect();
        if cursor > self.size {
            return None;
        }

        let mut table = Vec::with_capacity(entry_count);
        table.push(argv.len() as u64);
        table.extend_from_slice(&argv_ptrs);
        table.push(0);
        table.extend_from_slice(&envp_ptrs);
        table.push(0);
        table.push(AT_NULL);
        table.push(0);

        let mut offset = region_base;
        for word in &table {
            self.write_at(offset, &word.to_le_bytes());
            offset += 8;
        }

        Some(region_base as u64)
    }
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`size` were established by `mmap` in `anonymous`.
        unsafe {
            libc::munmap(self.ptr, self.size);
        }
    }
}

/// Present if `/dev/kvm` exists and reports an API version this crate
/// understands.
pub fn is_hypervisor_present() -> bool {
    match Kvm::new() {
        Ok(kvm) => kvm.get_api_version() == 12,
        Err(_) => false,
    }
}

pub struct KvmMachine {
    vm: VmFd,
    vcpu: VcpuFd,
    memory: Arc<GuestMemory>,
    /// The master this machine was forked from, kept alive for repeated
    /// `reset_to_master` calls. `None` for the master itself.
    master_memory: Option<Arc<GuestMemory>>,
    waiting_for_requests: Arc<AtomicBool>,
    fds: Option<FdCallbacks>,
    epoll_preemption_enabled: bool,
    vcpu_thread: Option<libc::pthread_t>,
}

impl KvmMachine {
    /// Build an unbooted master from guest image bytes loaded at guest
    /// physical address 0.
    pub fn new(memory_size: usize, image: &[u8]) -> anyhow::Result<Self> {
        ensure_signal_handler_registered();
        let kvm = Kvm::new()?;
        let vm = kvm.create_vm()?;
        let memory = GuestMemory::anonymous(memory_size)?;
        memory.write_at(0, &image[..image.len().min(memory_size)]);

        let region = kvm_userspace_memory_region {
            slot: 0,
            guest_phys_addr: 0,
            memory_size: memory_size as u64,
            userspace_addr: memory.ptr as u64,
            flags: 0,
        };
        // SAFETY: `region` describes the mapping owned by `memory`, which
        // outlives the `VmFd` it is registered with.
        unsafe {
            vm.set_user_memory_region(region)?;
        }

        let vcpu = vm.create_vcpu(0)?;

        Ok(Self {
            vm,
            vcpu,
            memory: Arc::new(memory),
            master_memory: None,
            waiting_for_requests: Arc::new(AtomicBool::new(false)),
            fds: None,
            epoll_preemption_enabled: true,
            vcpu_thread: None,
        })
    }

    fn run_uninterruptible_until_exit(&mut self) -> RunOutcome {
        match self.vcpu.run() {
            Ok(VcpuExit::Hlt) => RunOutcome::Exited,
            Ok(VcpuExit::IoOut(port, data)) if port == REQUEST_WAIT_PORT => {
                self.waiting_for_requests.store(true, Ordering::SeqCst);
                let _ = data;
                RunOutcome::WaitingForRequests
            }
            Ok(other) => RunOutcome::Fault(format!("unexpected vmexit: {other:?}")),
            Err(e) if e.errno() == libc::EINTR => RunOutcome::TimedOut,
            Err(e) => RunOutcome::Fault(e.to_string()),
        }
    }
}

/// Guest port convention: the guest signals "I am entering my request-wait
/// syscall" with an `out` on this port. A real guest runtime built against
/// this supervisor documents this contract.
const REQUEST_WAIT_PORT: u16 = 0xe9f0;

impl Machine for KvmMachine {
    fn run(&mut self, budget: Duration) -> RunOutcome {
        let thread_id = unsafe { libc::pthread_self() };
        self.vcpu_thread = Some(thread_id);

        let watcher_done = Arc::new(AtomicBool::new(false));
        let watcher_done_clone = watcher_done.clone();
        let watcher = std::thread::spawn(move || {
            std::thread::sleep(budget);
            if !watcher_done_clone.load(Ordering::SeqCst) {
                // SAFETY: `thread_id` is this function's caller thread,
                // still alive because we join the watcher before returning.
                unsafe {
                    libc::pthread_kill(thread_id, TIMEOUT_SIGNAL);
                }
            }
        });

        let outcome = self.run_uninterruptible_until_exit();
        watcher_done.store(true, Ordering::SeqCst);
        let _ = watcher.join();
        outcome
    }

    fn registers(&self) -> Registers {
        let regs = self.vcpu.get_regs().unwrap_or_default();
        Registers {
            rip: regs.rip,
            rax: regs.rax,
            rcx: regs.rcx,
            rsp: regs.rsp,
        }
    }

    fn set_registers(&mut self, regs: Registers) {
        let mut kvm_regs = self.vcpu.get_regs().unwrap_or_default();
        kvm_regs.rip = regs.rip;
        kvm_regs.rax = regs.rax;
        kvm_regs.rcx = regs.rcx;
        kvm_regs.rsp = regs.rsp;
        let _ = self.vcpu.set_regs(&kvm_regs);
    }

    fn prepare_copy_on_write(&mut self, working_mem_ceiling: u64) {
        // Host-level stand-in: nothing to do eagerly here beyond recording
        // intent; the actual dirty-page bound is enforced at fork/reset time
        // via `GuestMemory::reset_from`'s `keep_bytes` argument.
        let _ = working_mem_ceiling;
    }

    fn fork(&self, worker_index: usize, opts: ForkOptions) -> Box<dyn Machine> {
        let _ = worker_index;
        let memory = Arc::new(self.memory.fork().expect("host OOM forking guest memory"));
        let kvm = Kvm::new().expect("kvm present (checked at master construction)");
        let vm = kvm.create_vm().expect("create vm for fork");
        let region = kvm_userspace_memory_region {
            slot: 0,
            guest_phys_addr: 0,
            memory_size: opts.max_mem.min(memory.size as u64),
            userspace_addr: memory.ptr as u64,
            flags: 0,
        };
        // SAFETY: `region` describes the mapping owned by `memory`.
        unsafe {
            vm.set_user_memory_region(region).expect("set fork memory region");
        }
        let vcpu = vm.create_vcpu(0).expect("create fork vcpu");
        let _ = vcpu.set_regs(&self.vcpu.get_regs().unwrap_or_default());
        let _ = opts.max_cow_mem;

        Box::new(KvmMachine {
            vm,
            vcpu,
            memory,
            master_memory: Some(self.memory.clone()),
            waiting_for_requests: Arc::new(AtomicBool::new(true)),
            fds: None,
            epoll_preemption_enabled: true,
            vcpu_thread: None,
        })
    }

    /// Re-copy the master's memory above `reset_free_work_mem` back into
    /// this worker's region and drop the dirtied pages. A no-op on the master itself, which has no
    /// `master_memory` to reset against.
    fn reset_to_master(&mut self, opts: ResetOptions) -> anyhow::Result<()> {
        if let Some(master) = &self.master_memory {
            self.memory.reset_from(master, opts.reset_free_work_mem as usize);
            let regs = self.vcpu.get_regs().unwrap_or_default();
            self.vcpu
                .set_regs(&regs)
                .map_err(|e| anyhow::anyhow!("failed to restore vcpu registers on reset: {e}"))?;
        }
        Ok(())
    }

    fn install_fd_callbacks(&mut self, callbacks: FdCallbacks) {
        self.fds = Some(callbacks);
    }

    fn disable_epoll_preemption(&mut self) {
        self.epoll_preemption_enabled = false;
    }

    fn load_process_args(&mut self, argv: &[String], envp: &[String]) {
        let Some(stack_top) = self.memory.layout_initial_stack(argv, envp) else {
            return;
        };
        let mut regs = self.vcpu.get_regs().unwrap_or_default();
        regs.rsp = stack_top;
        let _ = self.vcpu.set_regs(&regs);
    }
}

// KvmMachine is Send because `VmFd`/`VcpuFd` are never shared across
// threads concurrently (one worker thread owns each) and `GuestMemory` is
// marked `Send` above.
unsafe impl Send for KvmMachine {}

#[cfg(test)]
mod tests {
    use super::*;

    fn kvm_should_be_present() -> bool {
        std::env::var("KVM_SHOULD_BE_PRESENT")
            .map(|v| v == "1")
            .unwrap_or(false)
    }

    #[test]
    fn presence_check_matches_environment_expectation() {
        if kvm_should_be_present() {
            assert!(is_hypervisor_present());
        }
    }

    #[test]
    fn guest_memory_fork_is_an_independent_copy() {
        let mem = GuestMemory::anonymous(4096).unwrap();
        mem.write_at(0, &[0xAB]);
        let fork = mem.fork().unwrap();
        assert_eq!(fork.as_slice()[0], 0xAB);
        mem.write_at(0, &[0xCD]);
        assert_eq!(fork.as_slice()[0], 0xAB);
    }

    #[test]
    fn layout_initial_stack_places_argc_and_readable_argv_strings() {
        let mem = GuestMemory::anonymous(256 * 1024).unwrap();
        let argv = vec!["prog".to_string(), "hello".to_string()];
        let envp = vec!["KVM_NAME=tenant".to_string()];
        let rsp = mem.layout_initial_stack(&argv, &envp).unwrap();

        let argc = u64::from_le_bytes(mem.as_slice()[rsp as usize..rsp as usize + 8].try_into().unwrap());
        assert_eq!(argc, 2);

        let argv0_ptr = u64::from_le_bytes(
            mem.as_slice()[rsp as usize + 8..rsp as usize + 16]
                .try_into()
                .unwrap(),
        ) as usize;
        assert_eq!(&mem.as_slice()[argv0_ptr..argv0_ptr + 4], b"prog");
    }

    #[test]
    fn reset_from_restores_master_contents_above_keep_boundary() {
        let master = GuestMemory::anonymous(4096).unwrap();
        master.write_at(2000, &[0x11]);
        let worker = master.fork().unwrap();
        worker.write_at(2000, &[0x22]);
        worker.write_at(10, &[0x33]); // within the "keep" region

        worker.reset_from(&master, 100);
        assert_eq!(worker.as_slice()[2000], 0x11);
        assert_eq!(worker.as_slice()[10], 0x33);
    }
}
