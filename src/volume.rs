//! Volume lifecycle.
//!
//! A [`VolumeSet`] owns every host directory mounted into one container run
//! and produces the host↔container path pair for each of them.
//!
//! ## Volume Kinds
//!
//! | Kind | Created by | Host path | Container path | Torn down |
//! |------|------------|-----------|----------------|-----------|
//! | Bind | [`VolumeSet::add_bind`] | caller's | caller's | never |
//! | Default temporary | implicit, one per set | `<tmp_root>/magikworker-*` | `<prefix>/<uuid>` | if resolved |
//! | Declared temporary | [`VolumeSet::temporary`] | `<host_dir>/magikworker-*` | `<prefix>/<uuid>` | if resolved |
//! | Pinned temporary | [`VolumeSet::temporary_at`] | `<tmp_root>/magikworker-*` | caller's | if resolved |
//!
//! ## Lazy Resolution
//!
//! Temporary volumes follow a two-state machine:
//!
//! ```text
//!   Unresolved ──resolve()──► Resolved { host_path, container_path }
//!       ▲                              │
//!       └──────────teardown()──────────┘
//! ```
//!
//! The host directory is created on the first [`VolumeSet::resolve`]; later
//! calls return the same pair. Teardown skips volumes that were never
//! resolved.
//!
//! Resolution takes `&mut self`: the preparation phase that resolves volumes
//! is single-threaded and needs no lock. Sharing a set across threads would
//! require wrapping it in a `Mutex`.

use crate::config::WorkerConfig;
use crate::constants::TEMP_DIR_PREFIX;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

// =============================================================================
// Mounts
// =============================================================================

/// Access mode of a mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeMode {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "rw")]
    ReadWrite,
}

impl std::fmt::Display for VolumeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadOnly => write!(f, "ro"),
            Self::ReadWrite => write!(f, "rw"),
        }
    }
}

/// One host directory (or file) mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub mode: VolumeMode,
}

impl Mount {
    pub fn new(host_path: impl Into<PathBuf>, container_path: impl Into<String>, mode: VolumeMode) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            mode,
        }
    }

    pub fn read_only(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self::new(host_path, container_path, VolumeMode::ReadOnly)
    }

    pub fn read_write(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self::new(host_path, container_path, VolumeMode::ReadWrite)
    }
}

// =============================================================================
// Volume Set
// =============================================================================

/// Handle to a volume inside a [`VolumeSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VolumeRef(usize);

/// Host and container paths of a resolved volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVolume {
    pub host_path: PathBuf,
    pub container_path: String,
}

impl ResolvedVolume {
    /// Host path of `name` inside this volume.
    pub fn host_join(&self, name: &str) -> PathBuf {
        self.host_path.join(name)
    }

    /// Container path of `name` inside this volume.
    pub fn container_join(&self, name: &str) -> String {
        join_container_path(&self.container_path, name)
    }
}

#[derive(Debug)]
enum VolumeState {
    Unresolved,
    Resolved(ResolvedVolume),
}

#[derive(Debug)]
enum Slot {
    Bind(Mount),
    Temporary {
        /// Host root to create the directory under; `None` uses `tmp_root`.
        host_dir: Option<PathBuf>,
        /// Fixed container path; `None` generates one under the prefix.
        container_path: Option<String>,
        state: VolumeState,
    },
}

/// The volumes of one container run.
#[derive(Debug)]
pub struct VolumeSet {
    tmp_root: PathBuf,
    mount_prefix: String,
    slots: Vec<Slot>,
}

const DEFAULT_VOLUME: VolumeRef = VolumeRef(0);

impl VolumeSet {
    /// Creates a set holding only the (unresolved) default temporary volume.
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            tmp_root: config.tmp_root.clone(),
            mount_prefix: config.mount_prefix.clone(),
            slots: vec![Slot::Temporary {
                host_dir: None,
                container_path: None,
                state: VolumeState::Unresolved,
            }],
        }
    }

    /// The per-run default temporary volume.
    pub fn default_volume(&self) -> VolumeRef {
        DEFAULT_VOLUME
    }

    /// Declares a temporary volume.
    ///
    /// Without a `host_dir` this is the default volume. With one, a distinct
    /// volume is created under that directory (which is created if missing).
    pub fn temporary(&mut self, host_dir: Option<PathBuf>) -> VolumeRef {
        match host_dir {
            None => DEFAULT_VOLUME,
            Some(dir) => self.push(Slot::Temporary {
                host_dir: Some(dir),
                container_path: None,
                state: VolumeState::Unresolved,
            }),
        }
    }

    /// Declares a temporary volume mounted at a fixed container path.
    pub fn temporary_at(&mut self, container_path: impl Into<String>) -> VolumeRef {
        self.push(Slot::Temporary {
            host_dir: None,
            container_path: Some(container_path.into()),
            state: VolumeState::Unresolved,
        })
    }

    /// Adds a caller-owned bind mount. Identical mounts share one entry.
    pub fn add_bind(&mut self, mount: Mount) -> VolumeRef {
        let existing = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Slot::Bind(m) if *m == mount));
        match existing {
            Some(i) => VolumeRef(i),
            None => self.push(Slot::Bind(mount)),
        }
    }

    fn push(&mut self, slot: Slot) -> VolumeRef {
        self.slots.push(slot);
        VolumeRef(self.slots.len() - 1)
    }

    /// Returns true if the volume has a host path yet.
    pub fn is_resolved(&self, volume: VolumeRef) -> bool {
        match self.slots.get(volume.0) {
            Some(Slot::Bind(_)) => true,
            Some(Slot::Temporary { state, .. }) => matches!(state, VolumeState::Resolved(_)),
            None => false,
        }
    }

    /// Returns the volume's paths, materializing a temporary volume's host
    /// directory on first use.
    pub fn resolve(&mut self, volume: VolumeRef) -> Result<ResolvedVolume> {
        let tmp_root = &self.tmp_root;
        let mount_prefix = &self.mount_prefix;
        let slot = self
            .slots
            .get_mut(volume.0)
            .ok_or_else(|| Error::Internal(format!("unknown volume {}", volume.0)))?;

        match slot {
            Slot::Bind(mount) => Ok(ResolvedVolume {
                host_path: mount.host_path.clone(),
                container_path: mount.container_path.clone(),
            }),
            Slot::Temporary {
                state: VolumeState::Resolved(resolved),
                ..
            } => Ok(resolved.clone()),
            Slot::Temporary {
                host_dir,
                container_path,
                state,
            } => {
                let root = host_dir.as_deref().unwrap_or(tmp_root);
                let host_path = create_host_dir(root)?;
                let container_path = container_path.clone().unwrap_or_else(|| {
                    join_container_path(mount_prefix, &Uuid::new_v4().simple().to_string())
                });
                debug!(
                    host = %host_path.display(),
                    container = %container_path,
                    "Materialized temporary volume"
                );
                let resolved = ResolvedVolume {
                    host_path,
                    container_path,
                };
                *state = VolumeState::Resolved(resolved.clone());
                Ok(resolved)
            }
        }
    }

    /// Mounts to hand to the container runtime: every bind plus every
    /// resolved temporary volume (read-write).
    pub fn mounts(&self) -> Vec<Mount> {
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Bind(mount) => Some(mount.clone()),
                Slot::Temporary {
                    state: VolumeState::Resolved(resolved),
                    ..
                } => Some(Mount::read_write(
                    resolved.host_path.clone(),
                    resolved.container_path.clone(),
                )),
                Slot::Temporary { .. } => None,
            })
            .collect()
    }

    /// Removes every resolved temporary volume.
    ///
    /// Permissions are normalized first so files created by another user
    /// inside the container can be deleted. Every volume is attempted; the
    /// first failure is returned.
    pub fn teardown(&mut self) -> Result<()> {
        let mut first_error = None;
        for slot in &mut self.slots {
            let Slot::Temporary { state, .. } = slot else {
                continue;
            };
            let VolumeState::Resolved(resolved) = std::mem::replace(state, VolumeState::Unresolved)
            else {
                continue;
            };

            let path = resolved.host_path;
            make_writable(&path);
            match fs::remove_dir_all(&path) {
                Ok(()) => info!("Removed temporary volume {}", path.display()),
                Err(e) => {
                    warn!("Failed to remove temporary volume {}: {}", path.display(), e);
                    first_error.get_or_insert(Error::TeardownFailed {
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

pub(crate) fn join_container_path(base: &str, name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), name.trim_start_matches('/'))
}

fn create_host_dir(root: &Path) -> Result<PathBuf> {
    let to_error = |e: std::io::Error| Error::VolumeCreateFailed {
        path: root.to_path_buf(),
        reason: e.to_string(),
    };
    if !root.exists() {
        fs::create_dir_all(root).map_err(to_error)?;
    }
    let dir = tempfile::Builder::new()
        .prefix(TEMP_DIR_PREFIX)
        .tempdir_in(root)
        .map_err(to_error)?;
    Ok(dir.keep())
}

/// Grants the owner full access to everything under `path`, best effort.
///
/// Symlinks are not followed.
fn make_writable(path: &Path) {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) => {
            debug!("Cannot stat {}: {}", path.display(), e);
            return;
        }
    };
    let file_type = meta.file_type();
    if file_type.is_symlink() {
        return;
    }

    let extra = if file_type.is_dir() { 0o700 } else { 0o600 };
    let mode = meta.permissions().mode();
    if mode & extra != extra
        && let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode | extra))
    {
        warn!("Failed to update permissions of {}: {}", path.display(), e);
    }

    if file_type.is_dir() {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to list {}: {}", path.display(), e);
                return;
            }
        };
        for entry in entries.flatten() {
            make_writable(&entry.path());
        }
    }
}
