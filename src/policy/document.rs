//! Parsing of the JSONC-flavored configuration document into a [`Policy`](super::Policy).
//!
//! Parsing proceeds in three passes: strip comments, substitute `$HOME`/
//! `$PWD` in every string value, then pull each field out of the resulting
//! `serde_json::Value` by name, applying each field's documented default.
//! A derived `Deserialize` on the whole document was deliberately not used;
//! defaulting and the two-shape remapping/path entries need field-by-field
//! logic a derive would obscure.

use std::path::PathBuf;

use serde_json::Value;

use super::network::{resolve_network_entry, AllowedNetwork};
use super::paths::AllowedPath;
use super::{Policy, Remapping};
use crate::error::Error;

/// Strip `//` line comments and `/* */` block comments from a JSON document,
/// leaving both forms inert inside string literals.
pub fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some((_, c)) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if matches!(chars.peek(), Some((_, '/'))) => {
                chars.next();
                for (_, c2) in chars.by_ref() {
                    if c2 == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if matches!(chars.peek(), Some((_, '*'))) => {
                chars.next();
                let mut prev = ' ';
                for (_, c2) in chars.by_ref() {
                    if prev == '*' && c2 == '/' {
                        break;
                    }
                    prev = c2;
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Replace `$HOME` and `$PWD` with the process's home directory and current
/// working directory, once.
pub fn substitute_dollar_vars(s: &str, home: &str, pwd: &str) -> String {
    s.replace("$HOME", home).replace("$PWD", pwd)
}

fn dollars(value: &str, home: &str, pwd: &str) -> String {
    substitute_dollar_vars(value, home, pwd)
}

fn parse_remapping(value: &Value, executable_default: bool) -> Result<Remapping, Error> {
    if let Some(arr) = value.as_array() {
        let guest_base = arr
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| bad_remapping(value))?;
        let size_mb = arr.get(1).and_then(Value::as_u64).ok_or_else(|| bad_remapping(value))?;
        return Ok(Remapping {
            guest_base,
            size: Policy::mb_to_bytes(size_mb),
            physical_base: None,
            writable: true,
            executable: executable_default,
        });
    }
    if let Some(obj) = value.as_object() {
        let guest_base = obj
            .get("virtual")
            .and_then(Value::as_u64)
            .ok_or_else(|| bad_remapping(value))?;
        let size_mb = obj.get("size").and_then(Value::as_u64).ok_or_else(|| bad_remapping(value))?;
        let physical_base = obj.get("physical").and_then(Value::as_u64).filter(|&b| b != 0);
        let writable = obj.get("writable").and_then(Value::as_bool).unwrap_or(true);
        let executable = obj
            .get("executable")
            .and_then(Value::as_bool)
            .unwrap_or(executable_default);
        return Ok(Remapping {
            guest_base,
            size: Policy::mb_to_bytes(size_mb),
            physical_base,
            writable,
            executable,
        });
    }
    Err(bad_remapping(value))
}

fn bad_remapping(value: &Value) -> Error {
    Error::ConfigError {
        message: "remapping entry must be [addr, size_mb] or an object with virtual/size".into(),
        fragment: value.to_string(),
    }
}

fn parse_allowed_path(value: &Value, home: &str, pwd: &str) -> Result<AllowedPath, Error> {
    if let Some(s) = value.as_str() {
        return Ok(AllowedPath::read_only(dollars(s, home, pwd)));
    }
    let obj = value.as_object().ok_or_else(|| Error::ConfigError {
        message: "allowed_paths entry must be a string or an object".into(),
        fragment: value.to_string(),
    })?;
    let real = obj
        .get("real")
        .and_then(Value::as_str)
        .map(|s| dollars(s, home, pwd))
        .ok_or_else(|| Error::ConfigError {
            message: "allowed_paths object entry is missing `real`".into(),
            fragment: value.to_string(),
        })?;

    // `virtual_path` is the higher-precedence alias of `virtual`; absence
    // of one never resets the other.
    let virtual_field = obj.get("virtual").and_then(Value::as_str).map(|s| dollars(s, home, pwd));
    let virtual_path_field = obj
        .get("virtual_path")
        .and_then(Value::as_str)
        .map(|s| dollars(s, home, pwd));
    let virtual_path = virtual_path_field
        .or(virtual_field)
        .unwrap_or_else(|| real.clone());

    Ok(AllowedPath {
        real: PathBuf::from(real),
        virtual_path: PathBuf::from(virtual_path),
        writable: obj.get("writable").and_then(Value::as_bool).unwrap_or(false),
        symlink: obj.get("symlink").and_then(Value::as_bool).unwrap_or(false),
        usable_in_fork: obj.get("usable_in_fork").and_then(Value::as_bool).unwrap_or(false),
        prefix: obj.get("prefix").and_then(Value::as_bool).unwrap_or(false),
    })
}

/// Parse a full configuration document into a [`Policy`]. `home`/`pwd` are
/// injected rather than read from the environment so the function stays
/// pure and testable; callers pass `std::env::var("HOME")`/`std::env::current_dir()`.
pub fn parse_policy(text: &str, home: &str, pwd: &str) -> Result<Policy, Error> {
    let stripped = strip_comments(text);
    let doc: Value = serde_json::from_str(&stripped).map_err(|e| Error::ConfigError {
        message: format!("invalid JSON: {e}"),
        fragment: stripped.clone(),
    })?;

    let mut policy = Policy::default();

    if let Some(filename) = doc.get("filename").and_then(Value::as_str) {
        policy.filename = PathBuf::from(dollars(filename, home, pwd));
    }
    if let Some(v) = doc.get("concurrency").and_then(Value::as_u64) {
        policy.concurrency = Policy::clamp_concurrency(v as usize);
    }
    if let Some(v) = doc.get("warmup_connect_requests").and_then(Value::as_u64) {
        policy.warmup_connect_requests = v as u32;
    }
    if let Some(v) = doc.get("warmup_intra_connect_requests").and_then(Value::as_u64) {
        policy.warmup_intra_connect_requests = v as u32;
    }
    if let Some(v) = doc.get("warmup_path").and_then(Value::as_str) {
        policy.warmup_path = dollars(v, home, pwd);
    }
    if let Some(v) = doc.get("max_boot_time").and_then(Value::as_f64) {
        policy.max_boot_time = v as f32;
    }
    if let Some(v) = doc.get("max_req_time").and_then(Value::as_f64) {
        policy.max_req_time = v as f32;
    }

    macro_rules! mb_field {
        ($key:literal, $target:expr) => {
            if let Some(v) = doc.get($key).and_then(Value::as_u64) {
                $target = Policy::mb_to_bytes(v);
            }
        };
    }
    mb_field!("address_space", policy.address_space);
    mb_field!("max_memory", policy.max_main_memory);
    mb_field!("max_request_memory", policy.max_req_mem);
    mb_field!("limit_req_mem", policy.limit_req_mem);
    mb_field!("shared_memory", policy.shared_memory);
    mb_field!("dylink_address_hint", policy.dylink_address_hint);
    mb_field!("heap_address_hint", policy.heap_address_hint);
    mb_field!("hugepage_arena_size", policy.hugepage_arena_size);
    mb_field!("hugepage_requests_arena", policy.hugepage_requests_arena);

    macro_rules! bool_field {
        ($key:literal, $target:expr) => {
            if let Some(v) = doc.get($key).and_then(Value::as_bool) {
                $target = v;
            }
        };
    }
    bool_field!("executable_heap", policy.executable_heap);
    bool_field!("clock_gettime_uses_rdtsc", policy.clock_gettime_uses_rdtsc);
    bool_field!("hugepages", policy.hugepages);
    bool_field!("split_hugepages", policy.split_hugepages);
    bool_field!("transparent_hugepages", policy.transparent_hugepages);
    bool_field!("relocate_fixed_mmap", policy.relocate_fixed_mmap);
    bool_field!("ephemeral", policy.ephemeral);
    bool_field!("ephemeral_keep_working_memory", policy.ephemeral_keep_working_memory);
    bool_field!("verbose", policy.verbose);
    bool_field!("verbose_syscalls", policy.verbose_syscalls);
    bool_field!("verbose_pagetable", policy.verbose_pagetable);
    bool_field!("network_allow_connect", policy.network.allow_connect);
    bool_field!("network_allow_listen", policy.network.allow_listen);

    if let Some(v) = doc.get("current_working_directory").and_then(Value::as_str) {
        policy.current_working_directory = PathBuf::from(dollars(v, home, pwd));
    }
    if let Some(arr) = doc.get("environment").and_then(Value::as_array) {
        policy.environment = arr
            .iter()
            .filter_map(Value::as_str)
            .map(|s| dollars(s, home, pwd))
            .collect();
    }
    if let Some(arr) = doc.get("main_arguments").and_then(Value::as_array) {
        policy.main_arguments = arr
            .iter()
            .filter_map(Value::as_str)
            .map(|s| dollars(s, home, pwd))
            .collect();
    }

    if let Some(arr) = doc.get("remappings").and_then(Value::as_array) {
        for v in arr {
            policy.remappings.push(parse_remapping(v, false)?);
        }
    }
    if let Some(arr) = doc.get("executable_remappings").and_then(Value::as_array) {
        for v in arr {
            policy.remappings.push(parse_remapping(v, true)?);
        }
    }

    if let Some(arr) = doc.get("allowed_paths").and_then(Value::as_array) {
        let mut entries = Vec::with_capacity(arr.len());
        for v in arr {
            entries.push(parse_allowed_path(v, home, pwd)?);
        }
        policy.paths = super::paths::PathTable::new(entries);
    }

    if let Some(arr) = doc.get("allowed_networks").and_then(Value::as_array) {
        for v in arr {
            let obj = v.as_object().ok_or_else(|| Error::ConfigError {
                message: "allowed_networks entry must be an object".into(),
                fragment: v.to_string(),
            })?;
            let path = obj.get("path").and_then(Value::as_str);
            let domain = obj.get("domain").and_then(Value::as_str);
            let address = obj.get("address").and_then(Value::as_str);
            let port = obj.get("port").and_then(Value::as_u64).map(|p| p as u16);
            let listen = obj.get("listen").and_then(Value::as_bool).unwrap_or(false);
            let entry = resolve_network_entry(path, domain, address, port, listen)?;
            policy.network.push(entry);
        }
    }

    if std::env::var("VERBOSE").is_ok() {
        policy.verbose = true;
        policy.verbose_syscalls = true;
    }

    policy.address_space = policy.address_space.max(policy.max_main_memory);

    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_line_and_block_comments_but_not_inside_strings() {
        let doc = r#"{
            // a comment
            "filename": "a//b", /* block
            comment */
            "concurrency": 4
        }"#;
        let stripped = strip_comments(doc);
        let v: Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(v["filename"], "a//b");
        assert_eq!(v["concurrency"], 4);
    }

    #[test]
    fn dollar_substitution_is_idempotent() {
        let once = substitute_dollar_vars("$HOME/data", "/home/u", "/pwd");
        let twice = substitute_dollar_vars(&once, "/home/u", "/pwd");
        assert_eq!(once, twice);
        assert_eq!(once, "/home/u/data");
    }

    #[test]
    fn home_prefixed_allowed_path_scenario_s6() {
        let doc = r#"{ "allowed_paths": ["$HOME/data"] }"#;
        let policy = parse_policy(doc, "/home/u", "/pwd").unwrap();
        let entry = &policy.paths.entries()[0];
        assert_eq!(entry.real, PathBuf::from("/home/u/data"));
        assert_eq!(entry.virtual_path, PathBuf::from("/home/u/data"));
        assert!(!entry.writable);
        assert!(!entry.prefix);
        assert!(!entry.symlink);
    }

    #[test]
    fn invalid_remapping_shape_is_config_error_scenario_s5() {
        let doc = r#"{ "remappings": [42] }"#;
        let err = parse_policy(doc, "/home/u", "/pwd").unwrap_err();
        match err {
            Error::ConfigError { fragment, .. } => assert_eq!(fragment, "42"),
            other => panic!("expected ConfigError, got {other:?}"),
        }
    }

    #[test]
    fn virtual_path_alias_takes_precedence_and_does_not_reset_virtual() {
        let doc = r#"{ "allowed_paths": [
            { "real": "/srv/a", "virtual": "/a" },
            { "real": "/srv/b", "virtual": "/b", "virtual_path": "/bb" }
        ] }"#;
        let policy = parse_policy(doc, "/home/u", "/pwd").unwrap();
        assert_eq!(policy.paths.entries()[0].virtual_path, PathBuf::from("/a"));
        assert_eq!(policy.paths.entries()[1].virtual_path, PathBuf::from("/bb"));
    }

    #[test]
    fn address_space_smaller_than_main_memory_is_clamped_not_rejected() {
        let doc = r#"{ "max_memory": 512, "address_space": 128 }"#;
        let policy = parse_policy(doc, "/home/u", "/pwd").unwrap();
        assert_eq!(policy.address_space, policy.max_main_memory);
        assert!(policy.is_valid());
    }

    #[test]
    fn megabyte_fields_normalize_to_bytes() {
        let doc = r#"{ "max_memory": 256, "address_space": 512 }"#;
        let policy = parse_policy(doc, "/home/u", "/pwd").unwrap();
        assert_eq!(policy.max_main_memory, 256 * 1024 * 1024);
        assert_eq!(policy.address_space, 512 * 1024 * 1024);
    }
}
