//! Hypervisor backend boundary. `machine`
//! defines the trait every backend implements; `kvm` is the one production
//! backend; `fds` holds the policy-backed rewrite callbacks every backend
//! installs; `fake` is the test double used when `/dev/kvm` is unavailable,
//! gated the same way production code gates on `is_hypervisor_present()`.

pub mod fake;
pub mod fds;
pub mod machine;
#[cfg(target_os = "linux")]
pub mod kvm;

pub use machine::Machine;

/// Whether a suitable hypervisor is available on this host.
pub fn is_hypervisor_present() -> bool {
    #[cfg(target_os = "linux")]
    {
        kvm::is_hypervisor_present()
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}
