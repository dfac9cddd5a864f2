//! Network collaborator.
//!
//! The spawner only needs three things from the network subsystem: create
//! host-side devices before the clone, move them into the child's network
//! namespace once its pid is known, and delete them again if the spawn
//! fails. [`IpNetwork`] does this with the `ip` tool.

use std::path::PathBuf;
use std::process::Command;

use lxrun_common::config::{NetworkDevice, NetworkKind};
use lxrun_common::error::{LxrunError, Result};
use nix::unistd::Pid;

/// Network collaborator consumed by the spawner.
pub trait Network {
    /// Creates host-side devices.
    ///
    /// # Errors
    ///
    /// Returns an error if a device cannot be created.
    fn create(&self, devices: &[NetworkDevice]) -> Result<()>;

    /// Moves the container side of every device into the network namespace
    /// of `pid`. Returns `false` on failure.
    fn assign(&self, devices: &[NetworkDevice], pid: Pid) -> bool;

    /// Removes whatever [`create`](Self::create) made on the host.
    fn delete(&self, devices: &[NetworkDevice]);
}

/// [`Network`] driving `ip(8)`.
#[derive(Debug, Clone)]
pub struct IpNetwork {
    ip: PathBuf,
}

impl IpNetwork {
    /// Locates `ip` on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`LxrunError::NotFound`] if the tool is not installed.
    pub fn new() -> Result<Self> {
        let ip = which::which("ip").map_err(|_| LxrunError::NotFound {
            kind: "network tool",
            id: "ip (install iproute2 to use network devices)".into(),
        })?;
        Ok(Self { ip })
    }

    fn run(&self, args: &[&str]) -> Result<()> {
        tracing::debug!(tool = %self.ip.display(), ?args, "running network command");
        let output = Command::new(&self.ip)
            .args(args)
            .output()
            .map_err(|e| LxrunError::Io {
                path: self.ip.clone(),
                source: e,
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(LxrunError::Setup {
                message: format!(
                    "ip {} failed: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }
}

impl Network for IpNetwork {
    fn create(&self, devices: &[NetworkDevice]) -> Result<()> {
        for dev in devices {
            if let NetworkKind::Veth { peer } = &dev.kind {
                self.run(&["link", "add", &dev.link, "type", "veth", "peer", "name", peer])?;
                self.run(&["link", "set", &dev.link, "up"])?;
                tracing::info!(link = %dev.link, peer = %peer, "veth pair created");
            }
        }
        Ok(())
    }

    fn assign(&self, devices: &[NetworkDevice], pid: Pid) -> bool {
        let netns = pid.to_string();
        for dev in devices {
            let link = dev.container_link();
            if let Err(e) = self.run(&["link", "set", link, "netns", &netns]) {
                tracing::error!(link, pid = pid.as_raw(), error = %e, "failed to move network device");
                return false;
            }
            tracing::info!(link, pid = pid.as_raw(), "network device assigned");
        }
        true
    }

    fn delete(&self, devices: &[NetworkDevice]) {
        for dev in devices {
            if matches!(dev.kind, NetworkKind::Veth { .. }) {
                if let Err(e) = self.run(&["link", "delete", &dev.link]) {
                    tracing::warn!(link = %dev.link, error = %e, "failed to delete network device");
                }
            }
        }
    }
}

/// [`Network`] for containers without devices; every call succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNetwork;

impl Network for NoNetwork {
    fn create(&self, _devices: &[NetworkDevice]) -> Result<()> {
        Ok(())
    }

    fn assign(&self, _devices: &[NetworkDevice], _pid: Pid) -> bool {
        true
    }

    fn delete(&self, _devices: &[NetworkDevice]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failing_command_reports_stderr() {
        let net = IpNetwork {
            ip: PathBuf::from("/bin/sh"),
        };
        let err = net.run(&["-c", "echo boom >&2; exit 1"]).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn missing_tool_is_io_error() {
        let net = IpNetwork {
            ip: PathBuf::from("/nonexistent/ip"),
        };
        assert!(matches!(net.run(&["link"]), Err(LxrunError::Io { .. })));
        assert!(!net.assign(
            &[NetworkDevice {
                kind: NetworkKind::Phys,
                link: "eth9".into(),
            }],
            Pid::from_raw(1)
        ));
    }

    #[test]
    fn no_network_accepts_everything() {
        assert!(NoNetwork.create(&[]).is_ok());
        assert!(NoNetwork.assign(&[], Pid::from_raw(1)));
    }
}
