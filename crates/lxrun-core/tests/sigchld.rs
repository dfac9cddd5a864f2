//! `SIGCHLD` handling against real child processes.
//!
//! Runs without the libtest harness: the signal is process directed, so
//! every thread must have it blocked for the signalfd to see it, and here
//! there is only the main thread.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::print_stderr, clippy::panic)]

use std::ops::ControlFlow;
use std::process::Command;

use lxrun_core::mainloop::EventLoop;
use lxrun_core::signal::{SignalCapture, watch_child};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid};
use nix::unistd::Pid;

struct Supervisor(SignalCapture);

impl AsMut<SignalCapture> for Supervisor {
    fn as_mut(&mut self) -> &mut SignalCapture {
        &mut self.0
    }
}

fn spawn(program: &str, args: &[&str]) -> Pid {
    let child = Command::new(program).args(args).spawn().expect("spawn");
    Pid::from_raw(i32::try_from(child.id()).unwrap())
}

/// Blocks until `pid` has exited, leaving it to be reaped later.
fn wait_exited(pid: Pid) {
    let status = waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT).unwrap();
    assert!(!matches!(status, WaitStatus::StillAlive));
}

fn watch(pid: Pid) -> (EventLoop<Supervisor>, Supervisor) {
    let supervisor = Supervisor(SignalCapture::install().unwrap());
    let mut lp = EventLoop::open(1).unwrap();
    watch_child(&mut lp, &supervisor.0, pid).unwrap();
    (lp, supervisor)
}

// Both exits happen while the signal is blocked, so only the first one
// leaves a record and it names the other process.
fn exit_hidden_behind_other_child_ends_the_loop() {
    let mut supervisor = Supervisor(SignalCapture::install().unwrap());

    let other = spawn("true", &[]);
    wait_exited(other);
    let tracked = spawn("true", &[]);
    wait_exited(tracked);

    let mut lp = EventLoop::open(1).unwrap();
    watch_child(&mut lp, &supervisor.0, tracked).unwrap();
    assert_eq!(lp.run_once(&mut supervisor, Some(1000)).unwrap(), ControlFlow::Break(()));

    assert_eq!(waitpid(tracked, None).unwrap(), WaitStatus::Exited(tracked, 0));
    let _ = waitpid(other, None).unwrap();
}

fn other_child_exit_keeps_watching_live_child() {
    let tracked = spawn("sleep", &["10"]);
    let (mut lp, mut supervisor) = watch(tracked);

    let other = spawn("true", &[]);
    wait_exited(other);
    assert_eq!(lp.run_once(&mut supervisor, Some(1000)).unwrap(), ControlFlow::Continue(()));
    let _ = waitpid(other, None).unwrap();

    kill(tracked, Signal::SIGTERM).unwrap();
    assert_eq!(lp.run_once(&mut supervisor, Some(2000)).unwrap(), ControlFlow::Break(()));
    assert_eq!(
        waitpid(tracked, None).unwrap(),
        WaitStatus::Signaled(tracked, Signal::SIGTERM, false)
    );
}

fn interrupt_is_passed_to_child() {
    let tracked = spawn("sleep", &["10"]);
    let (mut lp, mut supervisor) = watch(tracked);

    kill(nix::unistd::getpid(), Signal::SIGINT).unwrap();
    // First the signal is forwarded, then the child's death ends the loop.
    assert_eq!(lp.run_once(&mut supervisor, Some(1000)).unwrap(), ControlFlow::Continue(()));
    assert_eq!(lp.run_once(&mut supervisor, Some(2000)).unwrap(), ControlFlow::Break(()));
    assert_eq!(
        waitpid(tracked, None).unwrap(),
        WaitStatus::Signaled(tracked, Signal::SIGINT, false)
    );
}

fn main() {
    exit_hidden_behind_other_child_ends_the_loop();
    other_child_exit_keeps_watching_live_child();
    interrupt_is_passed_to_child();
    eprintln!("sigchld: 3 scenarios passed");
}
