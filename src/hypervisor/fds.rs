//! The three path-rewrite callbacks and the policy-backed connect callback
//! installed on a sandbox's file-descriptor subsystem.
//!
//! These callbacks close over `Arc<Policy>` rather than a raw reference
//! because worker threads are spawned with `'static` bounds.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::policy::Policy;

/// The bundle of callbacks a `Machine::install_fd_callbacks` call wires up.
/// Each is a thin closure over `Arc<Policy>`; the heavy lifting lives in
/// `policy::paths::PathTable` and `policy::network::NetworkPolicy`.
pub struct FdCallbacks {
    policy: Arc<Policy>,
    /// `true` for a fork: writable paths are not re-registered.
    is_fork: bool,
}

impl FdCallbacks {
    pub fn for_master(policy: Arc<Policy>) -> Self {
        Self { policy, is_fork: false }
    }

    pub fn for_fork(policy: Arc<Policy>) -> Self {
        Self { policy, is_fork: true }
    }

    /// `open-writable`: rewrite `guest_path` to its real path if it is a
    /// registered, writable allowed path. Always denies on a fork.
    pub fn open_writable(&self, guest_path: &Path) -> Option<PathBuf> {
        if self.is_fork {
            return None;
        }
        self.policy.paths.resolve_writable(guest_path).map(Path::to_path_buf)
    }

    /// `open-readable`: rewrite `guest_path` to its real path if it is a
    /// registered allowed path (writable or not).
    pub fn open_readable(&self, guest_path: &Path) -> Option<PathBuf> {
        self.policy.paths.resolve_readable(guest_path).map(Path::to_path_buf)
    }

    /// `resolve-symlink`: rewrite `guest_path` to its real target if it is
    /// registered as a symlink entry.
    pub fn resolve_symlink(&self, guest_path: &Path) -> Option<PathBuf> {
        self.policy.paths.resolve_symlink(guest_path).map(Path::to_path_buf)
    }

    /// `connect-socket`: admit a connection only if Policy actually allows it.
    pub fn admits_connect(&self, addr: Ipv4Addr, port: u16) -> bool {
        self.policy.network.admits_connect(addr, port)
    }

    /// `bind-listen`: admit a listen bind only if Policy actually allows it.
    pub fn admits_listen(&self, addr: Ipv4Addr, port: u16) -> bool {
        self.policy.network.admits_listen(addr, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::paths::{AllowedPath, PathTable};

    fn policy_with_paths(entries: Vec<AllowedPath>) -> Arc<Policy> {
        let mut policy = Policy::default();
        policy.paths = PathTable::new(entries);
        Arc::new(policy)
    }

    #[test]
    fn fork_never_admits_writes() {
        let mut entry = AllowedPath::read_only("/srv/data");
        entry.writable = true;
        let policy = policy_with_paths(vec![entry]);
        let fork_cb = FdCallbacks::for_fork(policy.clone());
        let master_cb = FdCallbacks::for_master(policy);

        assert_eq!(fork_cb.open_writable(Path::new("/srv/data")), None);
        assert_eq!(
            master_cb.open_writable(Path::new("/srv/data")),
            Some(PathBuf::from("/srv/data"))
        );
    }

    #[test]
    fn connect_denied_when_not_in_allowlist_and_not_globally_allowed() {
        let policy = Arc::new(Policy::default());
        let cb = FdCallbacks::for_master(policy);
        assert!(!cb.admits_connect(Ipv4Addr::new(1, 2, 3, 4), 80));
    }
}
