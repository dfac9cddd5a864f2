//! The per-invocation container handler and its lifecycle state machine.
//!
//! A [`ContainerHandler`] owns every resource a `start` acquires: the
//! handler lock, the `SIGCHLD` capture, the tty service, the pid file and
//! the cgroup membership. It is created by [`ContainerHandler::init`] and
//! consumed by [`ContainerHandler::fini`], so teardown runs exactly once.

use lxrun_common::config::{ContainerConfig, validate_name};
use lxrun_common::error::{LxrunError, Result};
use lxrun_common::types::ContainerState;
use lxrun_core::cgroup::{Cgroup, CgroupV2};
use lxrun_core::signal::SignalCapture;
use lxrun_core::tty::TtyService;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::monitor::{Monitor, SocketMonitor};
use crate::network::{IpNetwork, Network, NoNetwork};
use crate::setup::{DefaultSetup, NamespaceSetup};
use crate::state::{HandlerLock, PidFile};

/// External subsystems the handler talks to.
pub struct Collaborators {
    /// Receives every state transition.
    pub monitor: Box<dyn Monitor>,
    /// Cgroup membership of the container init.
    pub cgroup: Box<dyn Cgroup>,
    /// Network devices handed to the container.
    pub network: Box<dyn Network>,
    /// Namespace-internal setup run by the child.
    pub setup: Box<dyn NamespaceSetup>,
}

impl Collaborators {
    /// Default collaborators for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if network devices are configured but the `ip`
    /// tool is missing.
    pub fn system(config: &ContainerConfig) -> Result<Self> {
        let network: Box<dyn Network> = if config.wants_network() {
            Box::new(IpNetwork::new()?)
        } else {
            Box::new(NoNetwork)
        };
        Ok(Self {
            monitor: Box::new(SocketMonitor::new()),
            cgroup: Box::new(CgroupV2::new(&config.cgroup_root)),
            network,
            setup: Box::new(DefaultSetup::from_config(config)),
        })
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// State and resources of one supervised container.
#[derive(Debug)]
pub struct ContainerHandler {
    name: String,
    config: ContainerConfig,
    state: ContainerState,
    pid: Option<Pid>,
    lock: HandlerLock,
    signals: SignalCapture,
    ttys: TtyService,
    pid_file: Option<PidFile>,
    cgroup_linked: bool,
    collab: Collaborators,
}

impl ContainerHandler {
    /// Enters STARTING and acquires the handler's resources.
    ///
    /// STARTING is reported before anything is allocated. If an allocation
    /// fails, whatever was acquired is released again and ABORTING is
    /// reported.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid, the container is already
    /// supervised, or the signal capture or tty service cannot be set up.
    pub fn init(name: &str, config: ContainerConfig, collab: Collaborators) -> Result<Self> {
        validate_name(name)?;
        config.validate()?;
        collab.monitor.send_state(name, ContainerState::Starting);

        let acquired = HandlerLock::acquire(&config.run_dir, name).and_then(|lock| {
            let signals = SignalCapture::install()?;
            let ttys = TtyService::open(name, config.tty_count)?;
            Ok((lock, signals, ttys))
        });
        let (lock, signals, ttys) = match acquired {
            Ok(resources) => resources,
            Err(e) => {
                tracing::error!(name, error = %e, "failed to initialize container handler");
                collab.monitor.send_state(name, ContainerState::Aborting);
                return Err(e);
            }
        };

        tracing::info!(name, ttys = config.tty_count, "container handler initialized");
        Ok(Self {
            name: name.to_owned(),
            config,
            state: ContainerState::Starting,
            pid: None,
            lock,
            signals,
            ttys,
            pid_file: None,
            cgroup_linked: false,
            collab,
        })
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Container configuration.
    #[must_use]
    pub const fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ContainerState {
        self.state
    }

    /// Pid of the container init, once cloned.
    #[must_use]
    pub const fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// The `SIGCHLD` capture.
    #[must_use]
    pub const fn signals(&self) -> &SignalCapture {
        &self.signals
    }

    /// The tty service.
    #[must_use]
    pub const fn ttys(&self) -> &TtyService {
        &self.ttys
    }

    /// External collaborators.
    #[must_use]
    pub const fn collaborators(&self) -> &Collaborators {
        &self.collab
    }

    /// Moves to `next` and reports it.
    ///
    /// # Errors
    ///
    /// Returns [`LxrunError::InvalidTransition`] if the state machine does
    /// not allow `next` from the current state; nothing is reported then.
    pub fn set_state(&mut self, next: ContainerState) -> Result<()> {
        if !self.state.permits(next) {
            return Err(LxrunError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.enter(next);
        Ok(())
    }

    fn enter(&mut self, next: ContainerState) {
        tracing::debug!(name = %self.name, from = %self.state, to = %next, "state transition");
        self.state = next;
        self.collab.monitor.send_state(&self.name, next);
    }

    pub(crate) fn set_pid(&mut self, pid: Pid) {
        self.pid = Some(pid);
    }

    pub(crate) fn mark_cgroup_linked(&mut self) {
        self.cgroup_linked = true;
    }

    /// Persists the pid of the container init.
    pub(crate) fn persist_pid(&mut self) -> Result<()> {
        let pid = self.pid.ok_or_else(|| LxrunError::Setup {
            message: "container pid is not known yet".into(),
        })?;
        self.pid_file = Some(PidFile::create(&self.config.run_dir, &self.name, pid)?);
        Ok(())
    }

    /// Kills the container init and enters ABORTING.
    ///
    /// Safe to call repeatedly and after the init already exited.
    pub fn abort(&mut self) {
        if let Some(pid) = self.pid {
            match kill(pid, Signal::SIGKILL) {
                Ok(()) => {
                    tracing::warn!(name = %self.name, pid = pid.as_raw(), "container init killed");
                }
                Err(Errno::ESRCH) => {}
                Err(e) => tracing::error!(
                    name = %self.name,
                    pid = pid.as_raw(),
                    error = %e,
                    "failed to kill container init"
                ),
            }
        }
        if self.state == ContainerState::Aborting {
            return;
        }
        if let Err(e) = self.set_state(ContainerState::Aborting) {
            tracing::warn!(name = %self.name, error = %e, "abort outside an active state");
        }
    }

    /// Tears the handler down, reporting STOPPING then STOPPED.
    ///
    /// Runs from any state. A handler that never reached RUNNING passes
    /// through ABORTING first. Releases the tty service, the pid file, the
    /// cgroup and finally the lock.
    pub fn fini(mut self) {
        if self.state == ContainerState::Starting {
            self.enter(ContainerState::Aborting);
        }
        // Teardown enters STOPPING from ABORTING as well.
        self.enter(ContainerState::Stopping);

        let Self {
            name,
            lock,
            signals,
            ttys,
            pid_file,
            cgroup_linked,
            collab,
            ..
        } = self;

        drop(ttys);
        if let Some(pid_file) = pid_file {
            pid_file.remove();
        }
        if cgroup_linked {
            collab.cgroup.unlink(&name);
        }
        drop(signals);
        tracing::debug!(name, lock = %lock.path().display(), "releasing handler lock");
        drop(lock);

        collab.monitor.send_state(&name, ContainerState::Stopped);
        tracing::info!(name, "container stopped");
    }
}

impl AsMut<SignalCapture> for ContainerHandler {
    fn as_mut(&mut self) -> &mut SignalCapture {
        &mut self.signals
    }
}

impl AsMut<TtyService> for ContainerHandler {
    fn as_mut(&mut self) -> &mut TtyService {
        &mut self.ttys
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::path::Path;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use lxrun_common::constants::pid_file;
    use ContainerState::{Aborting, Running, Starting, Stopped, Stopping};

    /// Monitor that remembers every transition.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct RecordingMonitor {
        seen: Rc<RefCell<Vec<ContainerState>>>,
    }

    impl RecordingMonitor {
        pub(crate) fn states(&self) -> Vec<ContainerState> {
            self.seen.borrow().clone()
        }
    }

    impl Monitor for RecordingMonitor {
        fn send_state(&self, _name: &str, state: ContainerState) {
            self.seen.borrow_mut().push(state);
        }
    }

    static NEXT: AtomicUsize = AtomicUsize::new(0);

    pub(crate) fn unique_name() -> String {
        format!(
            "handler-test-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    pub(crate) fn collaborators(monitor: &RecordingMonitor, root: &Path) -> Collaborators {
        Collaborators {
            monitor: Box::new(monitor.clone()),
            cgroup: Box::new(CgroupV2::new(root.join("cgroup"))),
            network: Box::new(NoNetwork),
            setup: Box::new(DefaultSetup::default()),
        }
    }

    fn config(root: &Path) -> ContainerConfig {
        ContainerConfig {
            run_dir: root.join("run"),
            tty_count: 1,
            ..ContainerConfig::default()
        }
    }

    fn start_handler(monitor: &RecordingMonitor, root: &Path) -> ContainerHandler {
        ContainerHandler::init(&unique_name(), config(root), collaborators(monitor, root)).unwrap()
    }

    #[test]
    fn fault_free_lifecycle_is_reported_in_order() {
        let root = tempfile::tempdir().expect("tempdir");
        let monitor = RecordingMonitor::default();
        let mut handler = start_handler(&monitor, root.path());
        assert_eq!(handler.state(), Starting);

        handler.set_state(Running).unwrap();
        handler.fini();
        assert_eq!(monitor.states(), vec![Starting, Running, Stopping, Stopped]);
    }

    #[test]
    fn invalid_transition_is_rejected_and_not_reported() {
        let root = tempfile::tempdir().expect("tempdir");
        let monitor = RecordingMonitor::default();
        let mut handler = start_handler(&monitor, root.path());

        let err = handler.set_state(Stopped).unwrap_err();
        assert!(matches!(err, LxrunError::InvalidTransition { from: Starting, to: Stopped }));
        assert_eq!(handler.state(), Starting);
        assert_eq!(monitor.states(), vec![Starting]);
    }

    #[test]
    fn abort_without_pid_is_idempotent() {
        let root = tempfile::tempdir().expect("tempdir");
        let monitor = RecordingMonitor::default();
        let mut handler = start_handler(&monitor, root.path());

        handler.abort();
        handler.abort();
        assert_eq!(handler.state(), Aborting);
        handler.fini();
        assert_eq!(monitor.states(), vec![Starting, Aborting, Stopping, Stopped]);
    }

    #[test]
    fn abort_kills_the_child_and_survives_its_exit() {
        let root = tempfile::tempdir().expect("tempdir");
        let monitor = RecordingMonitor::default();
        let mut handler = start_handler(&monitor, root.path());

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        handler.set_pid(Pid::from_raw(i32::try_from(child.id()).unwrap()));
        handler.set_state(Running).unwrap();

        handler.abort();
        let status = child.wait().unwrap();
        assert!(!status.success());

        // Already reaped: the kill fails with ESRCH and is ignored.
        handler.abort();
        assert_eq!(handler.state(), Aborting);
        assert_eq!(monitor.states(), vec![Starting, Running, Aborting]);
    }

    #[test]
    fn fini_from_starting_passes_through_aborting() {
        let root = tempfile::tempdir().expect("tempdir");
        let monitor = RecordingMonitor::default();
        let handler = start_handler(&monitor, root.path());
        handler.fini();
        assert_eq!(monitor.states(), vec![Starting, Aborting, Stopping, Stopped]);
    }

    #[test]
    fn fini_releases_pid_file_lock_and_cgroup() {
        let root = tempfile::tempdir().expect("tempdir");
        let monitor = RecordingMonitor::default();
        let name = unique_name();
        let cfg = config(root.path());
        let run_dir = cfg.run_dir.clone();
        let mut handler =
            ContainerHandler::init(&name, cfg, collaborators(&monitor, root.path())).unwrap();

        handler.set_pid(Pid::from_raw(4242));
        handler.persist_pid().unwrap();
        assert!(pid_file(&run_dir, &name).exists());
        let cgroup = CgroupV2::new(root.path().join("cgroup"));
        std::fs::create_dir_all(cgroup.path(&name)).unwrap();
        handler.mark_cgroup_linked();
        handler.set_state(Running).unwrap();

        handler.fini();
        assert!(!pid_file(&run_dir, &name).exists());
        assert!(!cgroup.path(&name).exists());
        assert!(HandlerLock::acquire(&run_dir, &name).is_ok());
    }

    #[test]
    fn concurrent_init_of_same_name_is_locked_out() {
        let root = tempfile::tempdir().expect("tempdir");
        let name = unique_name();
        let first_monitor = RecordingMonitor::default();
        let first = ContainerHandler::init(
            &name,
            config(root.path()),
            collaborators(&first_monitor, root.path()),
        )
        .unwrap();

        let second_monitor = RecordingMonitor::default();
        let err = ContainerHandler::init(
            &name,
            config(root.path()),
            collaborators(&second_monitor, root.path()),
        )
        .unwrap_err();
        assert!(matches!(err, LxrunError::Locked { .. }));
        assert_eq!(second_monitor.states(), vec![Starting, Aborting]);
        first.fini();
    }

    #[test]
    fn failed_allocation_rolls_back_and_aborts() {
        let root = tempfile::tempdir().expect("tempdir");
        let blocker = root.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let monitor = RecordingMonitor::default();
        let cfg = ContainerConfig {
            // A regular file where the run directory should be.
            run_dir: blocker,
            ..ContainerConfig::default()
        };

        let err = ContainerHandler::init(&unique_name(), cfg, collaborators(&monitor, root.path()))
            .unwrap_err();
        assert!(matches!(err, LxrunError::Io { .. }));
        assert_eq!(monitor.states(), vec![Starting, Aborting]);
    }
}
