//! Argv/envp construction and binary selection: choosing the main binary
//! and assembling the guest's `argv` and `KVM_NAME=` environment entry.

use crate::elf::{BinaryType, ElfInfo};
use crate::policy::Policy;

/// The guest's `argv`/`envp`, plus the detected binary type, ready to hand
/// to `Machine::load_process_args`.
pub struct ProcessImage {
    pub argv: Vec<String>,
    pub envp: Vec<String>,
    pub binary_type: BinaryType,
}

const DEFAULT_INTERPRETER: &str = "/lib64/ld-linux-x86-64.so.2";

/// Build the process image for the master's boot.
pub fn build_process_image(program_path: &str, tenant_name: &str, image: &[u8], policy: &Policy) -> ProcessImage {
    let info = ElfInfo::from_bytes(image).unwrap_or(ElfInfo {
        binary_type: BinaryType::Static,
        interpreter: None,
        entrypoint: 0,
    });

    let argv = match info.binary_type {
        BinaryType::Dynamic => {
            let interpreter = info.interpreter.clone().unwrap_or_else(|| DEFAULT_INTERPRETER.to_string());
            let mut argv = vec![interpreter, program_path.to_string()];
            argv.extend(policy.main_arguments.iter().cloned());
            argv
        }
        BinaryType::Static | BinaryType::StaticPie | BinaryType::Unknown => {
            let mut argv = vec![tenant_name.to_string()];
            argv.extend(policy.main_arguments.iter().cloned());
            argv
        }
    };

    let mut envp = policy.environment.clone();
    envp.push(format!("KVM_NAME={tenant_name}"));

    ProcessImage {
        argv,
        envp,
        binary_type: info.binary_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_elf() -> Vec<u8> {
        let mut bytes = vec![0u8; 64];
        bytes[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        bytes[4] = 2;
        bytes[5] = 1;
        bytes[6] = 1;
        bytes[16..18].copy_from_slice(&goblin::elf::header::ET_EXEC.to_le_bytes());
        bytes[18..20].copy_from_slice(&62u16.to_le_bytes());
        bytes[20..24].copy_from_slice(&1u32.to_le_bytes());
        bytes[52..54].copy_from_slice(&64u16.to_le_bytes());
        bytes
    }

    #[test]
    fn static_binary_uses_tenant_name_as_argv0_scenario_property_5() {
        let policy = Policy::default();
        let image = build_process_image("/bin/app", "tenant-1", &static_elf(), &policy);
        assert_eq!(image.argv[0], "tenant-1");
        assert_eq!(image.binary_type, BinaryType::Static);
    }

    #[test]
    fn envp_always_carries_kvm_name() {
        let policy = Policy::default();
        let image = build_process_image("/bin/app", "tenant-1", &static_elf(), &policy);
        assert!(image.envp.iter().any(|e| e == "KVM_NAME=tenant-1"));
    }
}
