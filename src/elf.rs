//! ELF binary inspection via `goblin`: detect static/static-PIE/dynamic
//! linkage from the presence and content of a `PT_INTERP` segment.

use goblin::elf::Elf;
use goblin::elf::program_header::PT_INTERP;

use crate::error::Error;

/// How the master's guest image should be constructed from the program
/// binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryType {
    /// No dynamic linker; fixed load address.
    Static,
    /// No dynamic linker, but position-independent.
    StaticPie,
    /// Has a `PT_INTERP` segment; must be loaded via its interpreter.
    Dynamic,
    /// Parsed, but neither a recognized executable nor shared-object
    /// `e_type` (e.g. `ET_REL`/`ET_CORE`). Not something a boot attempt can
    /// classify into one of the above.
    Unknown,
}

/// The subset of ELF metadata the master construction needs.
#[derive(Debug, Clone)]
pub struct ElfInfo {
    pub binary_type: BinaryType,
    /// Path of the dynamic linker named by `PT_INTERP`, if any.
    pub interpreter: Option<String>,
    pub entrypoint: u64,
}

impl ElfInfo {
    /// Parse ELF metadata out of a binary's bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let elf = Elf::parse(bytes).map_err(|e| Error::ConfigError {
            message: format!("not a valid ELF binary: {e}"),
            fragment: String::new(),
        })?;

        let interpreter = elf
            .program_headers
            .iter()
            .find(|ph| ph.p_type == PT_INTERP)
            .and_then(|ph| {
                let start = ph.p_offset as usize;
                let end = start + ph.p_filesz as usize;
                bytes.get(start..end)
            })
            .and_then(|raw| {
                let nul = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                std::str::from_utf8(&raw[..nul]).ok().map(str::to_string)
            });

        let binary_type = if interpreter.is_some() {
            BinaryType::Dynamic
        } else if elf.header.e_type == goblin::elf::header::ET_DYN {
            BinaryType::StaticPie
        } else if elf.header.e_type == goblin::elf::header::ET_EXEC {
            BinaryType::Static
        } else {
            BinaryType::Unknown
        };

        Ok(ElfInfo {
            binary_type,
            interpreter,
            entrypoint: elf.entry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A minimal static, non-PIE ET_EXEC ELF64 header with no program
    // headers, enough for goblin to parse the type without a PT_INTERP.
    fn minimal_elf(e_type: u16) -> Vec<u8> {
        let mut bytes = vec![0u8; 64];
        bytes[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        bytes[4] = 2; // ELFCLASS64
        bytes[5] = 1; // ELFDATA2LSB
        bytes[6] = 1; // EV_CURRENT
        bytes[16..18].copy_from_slice(&e_type.to_le_bytes());
        bytes[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        bytes[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
        bytes[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
        bytes
    }

    #[test]
    fn static_executable_has_no_interpreter() {
        let info = ElfInfo::from_bytes(&minimal_elf(goblin::elf::header::ET_EXEC)).unwrap();
        assert_eq!(info.binary_type, BinaryType::Static);
        assert!(info.interpreter.is_none());
    }

    #[test]
    fn position_independent_without_interp_is_static_pie() {
        let info = ElfInfo::from_bytes(&minimal_elf(goblin::elf::header::ET_DYN)).unwrap();
        assert_eq!(info.binary_type, BinaryType::StaticPie);
    }

    #[test]
    fn malformed_bytes_is_a_config_error() {
        assert!(ElfInfo::from_bytes(&[0u8; 4]).is_err());
    }

    #[test]
    fn unrecognized_e_type_is_unknown() {
        let info = ElfInfo::from_bytes(&minimal_elf(goblin::elf::header::ET_REL)).unwrap();
        assert_eq!(info.binary_type, BinaryType::Unknown);
    }
}
