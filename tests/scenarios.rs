//! End-to-end scenarios S1-S6, exercised against the
//! `FakeMachine` test double rather than real hardware virtualization.

use std::sync::Arc;

use poolvisor::hypervisor::fake::{FakeMachine, ScriptedOutcome};
use poolvisor::policy::document::parse_policy;
use poolvisor::sandbox::{Master, Worker, WorkerStep};
use poolvisor::Policy;

fn policy_from(doc: &str) -> Policy {
    parse_policy(doc, "/home/test", "/work").expect("policy should parse")
}

/// S1: single static program, single worker, non-ephemeral — a guest that
/// runs to completion without waiting yields exit code 0, not a fatal
/// BootDidNotWait.
#[test]
fn s1_single_vm_clean_exit_shortcut() {
    let policy = policy_from(r#"{ "concurrency": 1, "ephemeral": false }"#);
    let machine = Box::new(FakeMachine::with_script(vec![ScriptedOutcome::Exited]));
    let mut master = Master::construct(machine, "s1".into(), Arc::new(policy), &[]);

    assert!(master.initialize(true, |_| {}).is_ok());
    assert!(!master.is_waiting_for_requests());
}

/// S2: dynamic program, 4 workers, ephemeral with keep-working-memory —
/// every worker resets on every iteration and none ever exits the loop.
#[test]
fn s2_ephemeral_workers_reset_every_iteration() {
    let policy = policy_from(
        r#"{ "concurrency": 4, "ephemeral": true, "ephemeral_keep_working_memory": true }"#,
    );
    let policy = Arc::new(policy);
    let master_machine = Box::new(FakeMachine::with_script(vec![ScriptedOutcome::WaitingForRequests]));
    let master = Arc::new(Master::construct(master_machine, "s2".into(), policy.clone(), &[]));

    for i in 0..policy.concurrency {
        let mut worker = Worker::fork_from(master.clone(), i);
        for _ in 0..3 {
            assert!(matches!(worker.step(), WorkerStep::Reset));
        }
    }
}

/// S3: boot-time budget violation surfaces as BootTimeout.
#[test]
fn s3_boot_timeout_violation() {
    let policy = policy_from(r#"{ "max_boot_time": 0.01 }"#);
    let machine = Box::new(FakeMachine::with_script(vec![ScriptedOutcome::TimedOut]));
    let mut master = Master::construct(machine, "s3".into(), Arc::new(policy), &[]);
    let err = master.initialize(false, |_| {}).unwrap_err();
    assert!(matches!(err, poolvisor::Error::BootTimeout { .. }));
}

/// S4: a worker's request hangs past max_req_time; the worker recovers via
/// reset rather than propagating the error out of the loop.
#[test]
fn s4_worker_timeout_recovers_via_reset() {
    let policy = Arc::new(policy_from(r#"{ "max_req_time": 1.0 }"#));
    // The master's own machine script is what a fork replays from index 0,
    // so seeding it with TimedOut (rather than calling `initialize`, which
    // is orthogonal to forking) gives the worker a hung first request.
    let master_machine = Box::new(FakeMachine::with_script(vec![ScriptedOutcome::TimedOut]));
    let master = Arc::new(Master::construct(master_machine, "s4".into(), policy, &[]));
    let mut worker = Worker::fork_from(master, 0);

    match worker.step() {
        WorkerStep::RecoveredFault(poolvisor::Error::WorkerTimeout { .. }) => {}
        other => panic!("expected RecoveredFault(WorkerTimeout), got {other:?}"),
    }
    // the worker loop continues driving requests afterward rather than
    // exiting, even though this fake backend keeps replaying the same
    // scripted outcome after each reset:
    match worker.step() {
        WorkerStep::RecoveredFault(poolvisor::Error::WorkerTimeout { .. }) => {}
        other => panic!("expected the worker loop to keep running, got {other:?}"),
    }
}

/// S5: an invalid remapping shape in the configuration document is a
/// ConfigError naming the offending fragment.
#[test]
fn s5_invalid_remapping_shape_is_config_error() {
    let err = parse_policy(r#"{ "remappings": [42] }"#, "/home/test", "/work").unwrap_err();
    match err {
        poolvisor::Error::ConfigError { fragment, .. } => assert_eq!(fragment, "42"),
        other => panic!("expected ConfigError, got {other:?}"),
    }
}

/// S6: a `$HOME`-prefixed allowed path resolves to a read-only entry with
/// matching virtual and real paths.
#[test]
fn s6_home_prefixed_allowed_path() {
    let policy = policy_from(r#"{ "allowed_paths": ["$HOME/data"] }"#);
    let entry = &policy.paths.entries()[0];
    assert_eq!(entry.real, std::path::PathBuf::from("/home/test/data"));
    assert_eq!(entry.virtual_path, std::path::PathBuf::from("/home/test/data"));
    assert!(!entry.writable && !entry.symlink && !entry.prefix);
}
