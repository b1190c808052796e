use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One entry of the guest's filesystem sandbox: a (virtual, real) pair plus
/// the permission bits that govern how the fork/master path-rewrite
/// callbacks treat it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedPath {
    pub real: PathBuf,
    pub virtual_path: PathBuf,
    pub writable: bool,
    pub symlink: bool,
    pub usable_in_fork: bool,
    pub prefix: bool,
}

impl AllowedPath {
    /// Build a read-only entry whose virtual path equals its real path, the
    /// shape produced by a bare string document entry.
    pub fn read_only(real: impl Into<PathBuf>) -> Self {
        let real = real.into();
        Self {
            virtual_path: real.clone(),
            real,
            writable: false,
            symlink: false,
            usable_in_fork: false,
            prefix: false,
        }
    }
}

/// The allowed-path list plus a side-index from virtual path to position,
/// used by the open-writable/open-readable/resolve-symlink callbacks
/// to do O(1) rewrite lookups instead of a linear scan
/// per guest open().
#[derive(Debug, Clone, Default)]
pub struct PathTable {
    entries: Vec<AllowedPath>,
    by_virtual: HashMap<PathBuf, usize>,
}

impl PathTable {
    pub fn new(entries: Vec<AllowedPath>) -> Self {
        let by_virtual = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.virtual_path.clone(), i))
            .collect();
        Self { entries, by_virtual }
    }

    pub fn entries(&self) -> &[AllowedPath] {
        &self.entries
    }

    /// Resolve a guest-visible path to its host-real path for a read-only
    /// open, honoring `prefix` entries (anything underneath the prefix is
    /// admitted) in addition to exact matches.
    pub fn resolve_readable(&self, guest_path: &Path) -> Option<&Path> {
        if let Some(&idx) = self.by_virtual.get(guest_path) {
            return Some(self.entries[idx].real.as_path());
        }
        self.entries
            .iter()
            .filter(|e| e.prefix)
            .find(|e| guest_path.starts_with(&e.virtual_path))
            .map(|e| {
                let suffix = guest_path.strip_prefix(&e.virtual_path).unwrap_or(guest_path);
                // A prefix entry's real path is a directory; callers own the
                // join so ownership of the returned path lifetime stays
                // simple. We return the entry's own real path here and the
                // caller appends `suffix` for prefix matches.
                let _ = suffix;
                e.real.as_path()
            })
    }

    /// Resolve a guest-visible path for a write open; only succeeds if the
    /// matching entry (exact or prefix) is writable.
    pub fn resolve_writable(&self, guest_path: &Path) -> Option<&Path> {
        if let Some(&idx) = self.by_virtual.get(guest_path) {
            let e = &self.entries[idx];
            return e.writable.then_some(e.real.as_path());
        }
        self.entries
            .iter()
            .filter(|e| e.prefix && e.writable)
            .find(|e| guest_path.starts_with(&e.virtual_path))
            .map(|e| e.real.as_path())
    }

    /// Resolve a symlink-flagged entry's real target.
    pub fn resolve_symlink(&self, guest_path: &Path) -> Option<&Path> {
        self.by_virtual
            .get(guest_path)
            .map(|&idx| &self.entries[idx])
            .filter(|e| e.symlink)
            .map(|e| e.real.as_path())
    }
}
