//! Container configuration model.
//!
//! The configuration is persisted as JSON. Only the fields the supervisor
//! itself consumes are modelled here; everything namespace-internal beyond
//! hostname and tty wiring is left to the setup collaborator.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{CGROUP_V2_PATH, DEFAULT_RUN_DIR, MAX_TTYS};
use crate::error::{LxrunError, Result};

/// Network device handed to the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDevice {
    /// How the device is provided.
    pub kind: NetworkKind,
    /// Host-side link name.
    pub link: String,
}

/// Kind of network device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum NetworkKind {
    /// A veth pair; `peer` is the end moved into the container.
    Veth {
        /// Name of the container-side end.
        peer: String,
    },
    /// An existing physical link moved into the container as-is.
    Phys,
}

impl NetworkDevice {
    /// Returns the link that ends up inside the container's namespace.
    #[must_use]
    pub fn container_link(&self) -> &str {
        match &self.kind {
            NetworkKind::Veth { peer } => peer,
            NetworkKind::Phys => &self.link,
        }
    }
}

/// Configuration of a single container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Hostname set inside a private UTS namespace.
    pub hostname: Option<String>,
    /// Number of pseudo-terminals pre-allocated for the container.
    pub tty_count: usize,
    /// Network devices; a non-empty list implies a network namespace.
    pub network: Vec<NetworkDevice>,
    /// Root filesystem the pty slaves are bound into.
    pub rootfs: Option<PathBuf>,
    /// Directory holding per-container pid files and locks.
    pub run_dir: PathBuf,
    /// Mount point of the cgroup v2 hierarchy.
    pub cgroup_root: PathBuf,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            tty_count: 0,
            network: Vec::new(),
            rootfs: None,
            run_dir: PathBuf::from(DEFAULT_RUN_DIR),
            cgroup_root: PathBuf::from(CGROUP_V2_PATH),
        }
    }
}

impl ContainerConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| LxrunError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Checks that the configuration is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns [`LxrunError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.tty_count > MAX_TTYS {
            return Err(LxrunError::Config {
                message: format!("tty_count {} exceeds the maximum of {MAX_TTYS}", self.tty_count),
            });
        }
        if let Some(hostname) = &self.hostname {
            if hostname.is_empty() || hostname.len() > 64 {
                return Err(LxrunError::Config {
                    message: format!("invalid hostname '{hostname}'"),
                });
            }
        }
        if let Some(dev) = self.network.iter().find(|d| d.link.is_empty()) {
            return Err(LxrunError::Config {
                message: format!("network device {dev:?} has no link name"),
            });
        }
        Ok(())
    }

    /// Returns whether a private UTS namespace is needed.
    #[must_use]
    pub const fn wants_uts(&self) -> bool {
        self.hostname.is_some()
    }

    /// Returns whether a private network namespace is needed.
    #[must_use]
    pub fn wants_network(&self) -> bool {
        !self.network.is_empty()
    }
}

/// Validates a container name.
///
/// Names become path components and socket names, so they must be
/// non-empty and free of `/` and NUL bytes.
///
/// # Errors
///
/// Returns [`LxrunError::Config`] if the name is unusable.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(LxrunError::Config {
            message: format!("invalid container name '{name}'"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_optional_namespaces() {
        let cfg = ContainerConfig::default();
        assert!(!cfg.wants_uts());
        assert!(!cfg.wants_network());
        assert_eq!(cfg.tty_count, 0);
        assert_eq!(cfg.run_dir, PathBuf::from(DEFAULT_RUN_DIR));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: ContainerConfig =
            serde_json::from_str(r#"{ "hostname": "box", "tty_count": 4 }"#).unwrap();
        assert_eq!(cfg.hostname.as_deref(), Some("box"));
        assert_eq!(cfg.tty_count, 4);
        assert_eq!(cfg.cgroup_root, PathBuf::from(CGROUP_V2_PATH));
        assert!(cfg.wants_uts());
    }

    #[test]
    fn network_devices_parse_by_type() {
        let cfg: ContainerConfig = serde_json::from_str(
            r#"{ "network": [
                { "kind": { "type": "veth", "peer": "eth0" }, "link": "vethbox" },
                { "kind": { "type": "phys" }, "link": "enp3s0" }
            ] }"#,
        )
        .unwrap();
        assert!(cfg.wants_network());
        assert_eq!(cfg.network[0].container_link(), "eth0");
        assert_eq!(cfg.network[1].container_link(), "enp3s0");
    }

    #[test]
    fn too_many_ttys_is_rejected() {
        let cfg = ContainerConfig {
            tty_count: MAX_TTYS + 1,
            ..ContainerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_reads_json_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("box.json");
        std::fs::write(&path, r#"{ "tty_count": 2 }"#).unwrap();
        let cfg = ContainerConfig::load(&path).unwrap();
        assert_eq!(cfg.tty_count, 2);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = ContainerConfig::load(Path::new("/nonexistent/box.json")).unwrap_err();
        assert!(matches!(err, LxrunError::Io { .. }));
    }

    #[test]
    fn container_names_are_validated() {
        assert!(validate_name("web").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("..").is_err());
    }
}
