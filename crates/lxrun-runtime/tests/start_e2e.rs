//! End-to-end runs of `start` against real namespaces.
//!
//! Needs root. Runs without the libtest harness: `SIGCHLD` is process
//! directed, so every thread must have it blocked for the signalfd to see
//! it, and here there is only the main thread.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::print_stderr, clippy::panic)]

use std::cell::RefCell;
use std::path::Path;
use std::process::Command;
use std::rc::Rc;

use lxrun_common::config::ContainerConfig;
use lxrun_common::constants::pid_file;
use lxrun_common::error::LxrunError;
use lxrun_common::types::ContainerState::{self, Aborting, Running, Starting, Stopped, Stopping};
use lxrun_core::cgroup::CgroupV2;
use lxrun_runtime::handler::Collaborators;
use lxrun_runtime::monitor::Monitor;
use lxrun_runtime::network::NoNetwork;
use lxrun_runtime::setup::DefaultSetup;
use lxrun_runtime::start::start;
use nix::errno::Errno;

#[derive(Clone, Default)]
struct Recorder(Rc<RefCell<Vec<ContainerState>>>);

impl Monitor for Recorder {
    fn send_state(&self, _name: &str, state: ContainerState) {
        self.0.borrow_mut().push(state);
    }
}

impl Recorder {
    fn states(&self) -> Vec<ContainerState> {
        self.0.borrow().clone()
    }
}

struct Run {
    result: lxrun_common::error::Result<i32>,
    states: Vec<ContainerState>,
    pid_file_left: bool,
}

fn run(name: &str, argv: &[&str], root: &Path) -> Run {
    let recorder = Recorder::default();
    let config = ContainerConfig {
        run_dir: root.join("run"),
        ..ContainerConfig::default()
    };
    let collab = Collaborators {
        monitor: Box::new(recorder.clone()),
        cgroup: Box::new(CgroupV2::new(root.join("cgroup"))),
        network: Box::new(NoNetwork),
        setup: Box::new(DefaultSetup::default()),
    };
    let argv: Vec<String> = argv.iter().map(|s| (*s).to_owned()).collect();
    let result = start(name, &argv, config, collab);
    Run {
        result,
        states: recorder.states(),
        pid_file_left: pid_file(&root.join("run"), name).exists(),
    }
}

fn unsupported(run: &Run) -> bool {
    matches!(
        run.result,
        Err(LxrunError::Sys {
            op: "clone",
            source: Errno::EPERM | Errno::EINVAL | Errno::ENOSPC
        })
    )
}

fn successful_command_reports_full_lifecycle(root: &Path) -> bool {
    let run = run("e2e-true", &["true"], root);
    if unsupported(&run) {
        return false;
    }
    assert_eq!(run.result.unwrap(), 0);
    assert_eq!(run.states, vec![Starting, Running, Stopping, Stopped]);
    assert!(!run.pid_file_left);
    true
}

fn exit_code_is_propagated(root: &Path) {
    let run = run("e2e-exit", &["sh", "-c", "exit 3"], root);
    assert_eq!(run.result.unwrap(), 3);
    assert_eq!(run.states, vec![Starting, Running, Stopping, Stopped]);
}

fn failed_exec_aborts_and_cleans_up(root: &Path) {
    let run = run("e2e-missing", &["/nonexistent/lxrun-test-binary"], root);
    match run.result {
        Err(LxrunError::ChildFailed { code, .. }) => assert_eq!(code, libc::ENOENT),
        other => panic!("expected the child to report ENOENT, got {other:?}"),
    }
    assert_eq!(run.states, vec![Starting, Aborting, Stopping, Stopped]);
    assert!(!run.pid_file_left);
}

// SIGINT aimed at the supervisor reaches the container, and the run still
// tears down normally once the container exits.
fn interrupt_is_forwarded_and_run_finishes(root: &Path) {
    let mut sender = Command::new("sh")
        .arg("-c")
        .arg(format!("sleep 1; kill -INT {}", std::process::id()))
        .spawn()
        .expect("spawn signal sender");
    let run = run(
        "e2e-interrupt",
        &["sh", "-c", "trap 'exit 7' INT; while :; do sleep 0.1; done"],
        root,
    );
    let _ = sender.wait().expect("reap signal sender");

    assert_eq!(run.result.unwrap(), 7);
    assert_eq!(run.states, vec![Starting, Running, Stopping, Stopped]);
    assert!(!run.pid_file_left);
}

fn main() {
    if !nix::unistd::geteuid().is_root() {
        eprintln!("start_e2e: skipped, needs root");
        return;
    }
    let root = tempfile::tempdir().expect("tempdir");

    if !successful_command_reports_full_lifecycle(root.path()) {
        eprintln!("start_e2e: skipped, namespaces unavailable");
        return;
    }
    exit_code_is_propagated(root.path());
    failed_exec_aborts_and_cleans_up(root.path());
    interrupt_is_forwarded_and_run_finishes(root.path());
    eprintln!("start_e2e: 4 scenarios passed");
}
