//! `poolvisor [--config <path>] [<program> [-- <program-args>...]]`

use std::process::ExitCode;

fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_default()
}

fn pwd() -> String {
    std::env::current_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1).peekable();
    let mut config_path = None;
    let mut program = None;
    let mut program_args = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = args.next(),
            "--" => program_args.extend(args.by_ref()),
            _ if program.is_none() => program = Some(arg),
            _ => program_args.push(arg),
        }
    }

    let document = match &config_path {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                eprintln!("fatal: could not read config {path}: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => "{}".to_string(),
    };

    let mut policy = match poolvisor::policy::document::parse_policy(&document, &home_dir(), &pwd()) {
        Ok(policy) => policy,
        Err(e) => {
            eprintln!("fatal: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(program) = program {
        policy.filename = program.into();
    }
    if !program_args.is_empty() {
        policy.main_arguments.extend(program_args);
    }

    if policy.filename.as_os_str().is_empty() {
        eprintln!("fatal: no program given (set `filename` in --config or pass it on the command line)");
        return ExitCode::FAILURE;
    }

    let code = poolvisor::supervisor::run(policy);
    if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
