//! Volume domain types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{PoolError, Result};
use crate::paths;

/// Separator between a parent volume name and a snapshot name.
pub const SNAPSHOT_SEPARATOR: &str = "/";

/// Mode applied to volume mount-point directories.
const MOUNT_DIR_MODE: u32 = 0o711;

/// Kind of workload a volume backs; determines the on-disk directory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeType {
    Container,
    VirtualMachine,
    Image,
    Custom,
}

impl VolumeType {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::VirtualMachine => "virtual-machine",
            Self::Image => "image",
            Self::Custom => "custom",
        }
    }

    /// Name of the per-type directory beneath the pool root.
    #[must_use]
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Container => "containers",
            Self::VirtualMachine => "virtual-machines",
            Self::Image => "images",
            Self::Custom => "custom",
        }
    }

    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "container" => Some(Self::Container),
            "virtual-machine" => Some(Self::VirtualMachine),
            "image" => Some(Self::Image),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for VolumeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a volume holds: a mountable filesystem or a raw block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Filesystem,
    Block,
}

impl ContentType {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Block => "block",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A storage volume, or a snapshot of one when `name` is `parent/snap`.
#[derive(Debug, Clone)]
pub struct Volume {
    /// Owning pool name.
    pub pool: String,

    /// Volume type.
    pub vol_type: VolumeType,

    /// Content type.
    pub content_type: ContentType,

    /// Bare volume name, or `parent/snap` for a snapshot.
    pub name: String,

    /// Per-volume config options.
    pub config: HashMap<String, String>,

    /// Pool-wide config options.
    pub pool_config: HashMap<String, String>,
}

impl Volume {
    pub fn new(
        pool: impl Into<String>,
        vol_type: VolumeType,
        content_type: ContentType,
        name: impl Into<String>,
        config: HashMap<String, String>,
        pool_config: HashMap<String, String>,
    ) -> Self {
        Self { pool: pool.into(), vol_type, content_type, name: name.into(), config, pool_config }
    }

    /// Whether this volume is a snapshot of another volume.
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.name.contains(SNAPSHOT_SEPARATOR)
    }

    /// A virtual-machine block volume; implies a sibling filesystem volume.
    #[must_use]
    pub fn is_vm_block(&self) -> bool {
        self.vol_type == VolumeType::VirtualMachine && self.content_type == ContentType::Block
    }

    /// Split the name into parent and snapshot parts.
    ///
    /// For a non-snapshot volume the snapshot part is `None`.
    #[must_use]
    pub fn parent_and_snapshot_name(&self) -> (&str, Option<&str>) {
        match self.name.split_once(SNAPSHOT_SEPARATOR) {
            Some((parent, snap)) => (parent, Some(snap)),
            None => (&self.name, None),
        }
    }

    /// Derive the sibling filesystem volume of a VM block volume.
    ///
    /// Same name, content type switched to filesystem. The pair is
    /// lifecycle-atomic: every operation on the block volume recurses onto
    /// the sibling.
    #[must_use]
    pub fn new_vm_block_filesystem_volume(&self) -> Volume {
        Volume { content_type: ContentType::Filesystem, ..self.clone() }
    }

    /// Instantiate a snapshot volume of this volume from a bare snapshot name.
    pub fn new_snapshot(&self, snapshot_name: &str) -> Result<Volume> {
        if self.is_snapshot() {
            return Err(PoolError::InvalidConfig {
                reason: format!("Volume {:?} is itself a snapshot", self.name),
            });
        }

        Ok(Volume {
            name: snapshot_volume_name(&self.name, snapshot_name),
            ..self.clone()
        })
    }

    /// Mount-point path of this volume beneath `base`.
    #[must_use]
    pub fn mount_path(&self, base: &Path) -> PathBuf {
        paths::volume_mount_path(base, &self.pool, self.vol_type, &self.name)
    }

    /// Create the mount-point directory if missing and assert its mode.
    ///
    /// Also called after mounting, to fix up the permissions of the mounted
    /// filesystem root.
    pub fn ensure_mount_path(&self, base: &Path) -> Result<()> {
        let path = self.mount_path(base);
        if !path.exists() {
            fs::create_dir_all(&path).map_err(|e| PoolError::io(&path, e))?;
        }
        fs::set_permissions(&path, fs::Permissions::from_mode(MOUNT_DIR_MODE))
            .map_err(|e| PoolError::io(&path, e))?;
        Ok(())
    }
}

/// Build the full name of a snapshot volume from its parent and snapshot name.
#[must_use]
pub fn snapshot_volume_name(parent: &str, snapshot: &str) -> String {
    format!("{parent}{SNAPSHOT_SEPARATOR}{snapshot}")
}

/// Caller-supplied function that populates a freshly created volume.
///
/// The filler runs with the volume mounted and receives the mount path, plus
/// the block device path for block volumes (`None` for filesystem volumes).
pub struct VolumeFiller<'a> {
    pub fill: Box<dyn FnMut(&Path, Option<&Path>) -> anyhow::Result<()> + 'a>,
}

/// Opaque operation handle threaded through public driver calls.
///
/// The driver never polls it; helpers that spawn long-running children check
/// it once immediately before each spawn so an external cancellation takes
/// effect at tool-invocation boundaries.
#[derive(Debug, Default)]
pub struct Operation {
    cancelled: AtomicBool,
}

impl Operation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of future tool spawns within the operation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
