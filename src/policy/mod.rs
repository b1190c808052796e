//! Typed, validated sandbox policy.
//!
//! A `Policy` is parsed once at startup from a JSONC-flavored configuration
//! document (see [`document`]) and then lives, immutable, for the rest of the
//! process. Megabyte-denominated fields are normalized to bytes during
//! parsing, and `$HOME`/`$PWD` substitution has already been applied to
//! every string field.

pub mod document;
pub mod network;
pub mod paths;

use std::path::PathBuf;

use network::NetworkPolicy;
use paths::PathTable;

/// A guest-virtual memory remapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Remapping {
    pub guest_base: u64,
    pub size: u64,
    /// `None` means "allocate from the guest heap" (sentinel physical base 0
    /// in the original document format).
    pub physical_base: Option<u64>,
    pub writable: bool,
    pub executable: bool,
}

pub const DEFAULT_CONCURRENCY: usize = 1;
pub const MIN_CONCURRENCY: usize = 1;
pub const DEFAULT_WARMUP_CONNECT_REQUESTS: u32 = 0;
pub const DEFAULT_WARMUP_INTRA_CONNECT_REQUESTS: u32 = 100;
pub const DEFAULT_WARMUP_PATH: &str = "/";
pub const DEFAULT_MAX_BOOT_TIME: f32 = 20.0;
pub const DEFAULT_MAX_REQ_TIME: f32 = 8.0;
pub const DEFAULT_MAX_ADDRESS_SPACE_MB: u64 = 128 * 1024;
pub const DEFAULT_MAX_MAIN_MEMORY_MB: u64 = 8 * 1024;
pub const DEFAULT_MAX_REQ_MEM_MB: u64 = 128;
pub const DEFAULT_LIMIT_REQ_MEM_MB: u64 = 128;
pub const DEFAULT_SHARED_MEMORY_MB: u64 = 0;
pub const DEFAULT_DYLINK_ADDRESS_HINT_MB: u64 = 2;
pub const DEFAULT_HEAP_ADDRESS_HINT_MB: u64 = 256;
pub const DEFAULT_HUGEPAGE_ARENA_SIZE_MB: u64 = 0;
pub const DEFAULT_HUGEPAGE_REQUESTS_ARENA_MB: u64 = 0;
const MB: u64 = 1024 * 1024;

/// Immutable, validated sandbox policy.
#[derive(Debug, Clone)]
pub struct Policy {
    pub filename: PathBuf,
    pub concurrency: usize,

    pub warmup_connect_requests: u32,
    pub warmup_intra_connect_requests: u32,
    pub warmup_path: String,

    pub max_boot_time: f32,
    pub max_req_time: f32,

    pub address_space: u64,
    pub max_main_memory: u64,
    pub max_req_mem: u64,
    pub limit_req_mem: u64,
    pub shared_memory: u64,
    pub dylink_address_hint: u64,
    pub heap_address_hint: u64,
    pub hugepage_arena_size: u64,
    pub hugepage_requests_arena: u64,

    pub executable_heap: bool,
    pub clock_gettime_uses_rdtsc: bool,
    pub hugepages: bool,
    pub split_hugepages: bool,
    pub transparent_hugepages: bool,
    pub relocate_fixed_mmap: bool,
    pub ephemeral: bool,
    pub ephemeral_keep_working_memory: bool,
    pub verbose: bool,
    pub verbose_syscalls: bool,
    pub verbose_pagetable: bool,

    pub environment: Vec<String>,
    pub main_arguments: Vec<String>,
    pub remappings: Vec<Remapping>,
    pub current_working_directory: PathBuf,

    pub paths: PathTable,
    pub network: NetworkPolicy,
}

impl Policy {
    /// Clamp `concurrency` to its documented minimum.
    pub(crate) fn clamp_concurrency(concurrency: usize) -> usize {
        concurrency.max(MIN_CONCURRENCY)
    }

    /// Address space must be at least as large as main memory.
    pub fn is_valid(&self) -> bool {
        self.address_space >= self.max_main_memory
    }

    pub fn mb_to_bytes(mb: u64) -> u64 {
        mb * MB
    }
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            filename: PathBuf::new(),
            concurrency: DEFAULT_CONCURRENCY,
            warmup_connect_requests: DEFAULT_WARMUP_CONNECT_REQUESTS,
            warmup_intra_connect_requests: DEFAULT_WARMUP_INTRA_CONNECT_REQUESTS,
            warmup_path: DEFAULT_WARMUP_PATH.to_string(),
            max_boot_time: DEFAULT_MAX_BOOT_TIME,
            max_req_time: DEFAULT_MAX_REQ_TIME,
            address_space: Policy::mb_to_bytes(DEFAULT_MAX_ADDRESS_SPACE_MB),
            max_main_memory: Policy::mb_to_bytes(DEFAULT_MAX_MAIN_MEMORY_MB),
            max_req_mem: Policy::mb_to_bytes(DEFAULT_MAX_REQ_MEM_MB),
            limit_req_mem: Policy::mb_to_bytes(DEFAULT_LIMIT_REQ_MEM_MB),
            shared_memory: Policy::mb_to_bytes(DEFAULT_SHARED_MEMORY_MB),
            dylink_address_hint: Policy::mb_to_bytes(DEFAULT_DYLINK_ADDRESS_HINT_MB),
            heap_address_hint: Policy::mb_to_bytes(DEFAULT_HEAP_ADDRESS_HINT_MB),
            hugepage_arena_size: Policy::mb_to_bytes(DEFAULT_HUGEPAGE_ARENA_SIZE_MB),
            hugepage_requests_arena: Policy::mb_to_bytes(DEFAULT_HUGEPAGE_REQUESTS_ARENA_MB),
            executable_heap: true,
            clock_gettime_uses_rdtsc: false,
            hugepages: false,
            split_hugepages: true,
            transparent_hugepages: false,
            relocate_fixed_mmap: true,
            ephemeral: false,
            ephemeral_keep_working_memory: true,
            verbose: false,
            verbose_syscalls: false,
            verbose_pagetable: false,
            environment: Vec::new(),
            main_arguments: Vec::new(),
            remappings: Vec::new(),
            current_working_directory: PathBuf::new(),
            paths: PathTable::default(),
            network: NetworkPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_match_documented_values() {
        let p = Policy::default();
        assert_eq!(p.concurrency, 1);
        assert_eq!(p.max_boot_time, 20.0);
        assert_eq!(p.max_req_time, 8.0);
        assert_eq!(p.address_space, 128 * 1024 * MB);
        assert_eq!(p.max_main_memory, 8 * 1024 * MB);
        assert!(p.is_valid());
    }

    #[test]
    fn clamp_concurrency_enforces_minimum() {
        assert_eq!(Policy::clamp_concurrency(0), MIN_CONCURRENCY);
        assert_eq!(Policy::clamp_concurrency(4), 4);
    }

    #[test]
    fn megabyte_normalization_is_exact() {
        assert_eq!(Policy::mb_to_bytes(128), 128 * 1024 * 1024);
    }
}
