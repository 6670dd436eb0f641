//! LVM-backed storage pool driver.
//!
//! The driver maps pool-level volume operations onto LVM primitives. It keeps
//! no state beyond its pool config: every query that could go stale re-asks
//! the tool layer, and the on-disk directory layout is the ground truth for
//! snapshot enumeration. Callers serialize operations on a single volume;
//! cross-volume concurrency relies on LVM's own VG locking.

mod generic;
mod snapshots;
mod volumes;

pub use generic::{PostHook, RevertHook};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::mount::MsFlags;
use tracing::warn;

use crate::error::{PoolError, Result};
use crate::paths;
use crate::tools::{FsCli, FsTools, LvmCli, LvmTools};
use crate::units;
use crate::volume::{ContentType, Operation, Volume};

/// Filesystems the driver will format and manage.
pub const ALLOWED_FILESYSTEMS: &[&str] = &["ext4", "xfs", "btrfs"];

/// Filesystem used when a volume does not specify one.
const DEFAULT_FILESYSTEM: &str = "ext4";

/// Size used when a volume does not specify one.
const DEFAULT_VOLUME_SIZE: &str = "10GiB";

/// Mount and unmount are retried while the kernel reports the target busy,
/// since concurrent tool invocations on the same VG briefly hold it open.
const MOUNT_RETRIES: u32 = 20;
const MOUNT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// LVM sizes must be multiples of the 512-byte sector.
const SECTOR_SIZE: u64 = 512;

/// LVM-backed pool driver.
pub struct Lvm {
    name: String,
    config: HashMap<String, String>,
    data_dir: PathBuf,
    lvm: Arc<dyn LvmTools>,
    fs: Arc<dyn FsTools>,
}

impl Lvm {
    /// Create a driver for `name` using the system tool suite and the default
    /// data directory.
    pub fn new(name: impl Into<String>, config: HashMap<String, String>) -> Result<Self> {
        let lvm = LvmCli::detect().map_err(|e| PoolError::tool("Error locating LVM tools", e))?;
        Self::with_tools(name, config, paths::data_dir(), Arc::new(lvm), Arc::new(FsCli))
    }

    /// Create a driver with explicit tool layers and data directory.
    ///
    /// This is the seam embedders and tests use to substitute tool
    /// implementations.
    pub fn with_tools(
        name: impl Into<String>,
        config: HashMap<String, String>,
        data_dir: PathBuf,
        lvm: Arc<dyn LvmTools>,
        fs: Arc<dyn FsTools>,
    ) -> Result<Self> {
        if config.get("lvm.vg_name").map_or(true, |v| v.is_empty()) {
            return Err(PoolError::InvalidConfig {
                reason: "lvm.vg_name is required".to_string(),
            });
        }

        Ok(Self { name: name.into(), config, data_dir, lvm, fs })
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Data directory the pool's mount-point tree lives under.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub(crate) fn vg_name(&self) -> &str {
        self.config.get("lvm.vg_name").map(String::as_str).unwrap_or_default()
    }

    pub(crate) fn thinpool_name(&self) -> Option<&str> {
        self.config.get("lvm.thinpool_name").map(String::as_str).filter(|v| !v.is_empty())
    }

    /// Whether volumes are thin-provisioned. Selects the thin branch of every
    /// copy, snapshot and restore path.
    pub(crate) fn uses_thinpool(&self) -> bool {
        self.thinpool_name().is_some()
    }

    pub(crate) fn bwlimit(&self) -> &str {
        self.config.get("rsync.bwlimit").map(String::as_str).unwrap_or_default()
    }

    pub(crate) fn volume_filesystem(&self, vol: &Volume) -> String {
        vol.config
            .get("block.filesystem")
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_FILESYSTEM.to_string())
    }

    pub(crate) fn volume_mount_options(&self, _vol: &Volume) -> String {
        "discard".to_string()
    }

    pub(crate) fn lv_name_of(&self, vol: &Volume) -> String {
        paths::lv_name(vol.vol_type, vol.content_type, &vol.name)
    }

    pub(crate) fn dev_path(&self, vol: &Volume) -> PathBuf {
        paths::lv_dev_path(self.vg_name(), vol.vol_type, vol.content_type, &vol.name)
    }

    /// Parse a size string and round it up to the LVM sector granularity.
    pub(crate) fn rounded_size(&self, size: &str) -> Result<u64> {
        Ok(units::round_up(units::parse_byte_size(size)?, SECTOR_SIZE))
    }

    /// Provisioning size of a volume from its config.
    pub(crate) fn volume_size(&self, vol: &Volume) -> Result<u64> {
        let size = vol
            .config
            .get("size")
            .filter(|v| !v.is_empty() && v.as_str() != "0")
            .map(String::as_str)
            .unwrap_or(DEFAULT_VOLUME_SIZE);
        self.rounded_size(size)
    }

    /// Create the LV backing `vol` and format it for filesystem content.
    pub(crate) fn create_logical_volume(&self, vol: &Volume) -> Result<()> {
        let dev = self.dev_path(vol);
        let size = self.volume_size(vol)?;
        let thin = self.uses_thinpool();

        // Stripe settings only apply to classic volumes; a thinpool stripes
        // at the pool level.
        let mut stripes = None;
        let mut stripe_size = None;
        if !thin {
            stripes = vol.config.get("lvm.stripes").and_then(|v| v.parse().ok());
            stripe_size = match vol.config.get("lvm.stripes.size") {
                Some(v) => Some(self.rounded_size(v)?),
                None => None,
            };
        }

        self.lvm
            .create_lv(
                self.vg_name(),
                self.thinpool_name(),
                &self.lv_name_of(vol),
                size,
                stripes,
                stripe_size,
            )
            .map_err(|e| {
                PoolError::tool(format!("Error creating LVM logical volume {dev:?}"), e)
            })?;

        if vol.content_type == ContentType::Filesystem {
            let fs = self.volume_filesystem(vol);
            self.fs.mkfs(&fs, &dev).map_err(|e| {
                PoolError::tool(format!("Error formatting LVM logical volume {dev:?}"), e)
            })?;
        }

        Ok(())
    }

    /// Create a snapshot LV of `src_vol` named after `snap_vol`.
    pub(crate) fn create_logical_volume_snapshot(
        &self,
        src_vol: &Volume,
        snap_vol: &Volume,
        readonly: bool,
    ) -> Result<()> {
        let thin = self.uses_thinpool();
        let src_dev = self.dev_path(src_vol);

        // Classic snapshots need a copy-on-write area; size it from the
        // source LV so it can never overflow during the snapshot's lifetime.
        let cow_size = if thin {
            0
        } else {
            self.lvm.lv_size(&src_dev).map_err(|e| {
                PoolError::tool(format!("Error reading size of LVM logical volume {src_dev:?}"), e)
            })?
        };

        self.lvm
            .create_lv_snapshot(
                self.vg_name(),
                &self.lv_name_of(src_vol),
                &self.lv_name_of(snap_vol),
                cow_size,
                readonly,
                thin,
            )
            .map_err(|e| {
                PoolError::tool(
                    format!("Error creating LVM logical volume snapshot {:?}", snap_vol.name),
                    e,
                )
            })
    }

    pub(crate) fn remove_logical_volume(&self, dev: &Path) -> Result<()> {
        self.lvm
            .remove_lv(dev)
            .map_err(|e| PoolError::tool(format!("Error removing LVM logical volume {dev:?}"), e))
    }

    pub(crate) fn rename_logical_volume(&self, old_lv: &str, new_lv: &str) -> Result<()> {
        self.lvm.rename_lv(self.vg_name(), old_lv, new_lv).map_err(|e| {
            PoolError::tool(
                format!("Error renaming LVM logical volume {old_lv:?} to {new_lv:?}"),
                e,
            )
        })
    }

    pub(crate) fn logical_volume_exists(&self, dev: &Path) -> Result<bool> {
        self.lvm.lv_exists(dev).map_err(|e| {
            PoolError::tool(format!("Error checking LVM logical volume {dev:?}"), e)
        })
    }

    /// Mount with retry while the kernel reports the device or target busy.
    pub(crate) fn try_mount(
        &self,
        dev: &Path,
        target: &Path,
        fs: &str,
        flags: MsFlags,
        options: &str,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.fs.mount(dev, target, fs, flags, options) {
                Ok(()) => return Ok(()),
                Err(crate::tools::ToolError::Busy) if attempt + 1 < MOUNT_RETRIES => {
                    attempt += 1;
                    std::thread::sleep(MOUNT_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(PoolError::tool(format!("Failed to mount {dev:?} at {target:?}"), e))
                }
            }
        }
    }

    /// Unmount with the same busy retry as [`Lvm::try_mount`].
    pub(crate) fn try_unmount(&self, target: &Path) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.fs.unmount(target) {
                Ok(()) => return Ok(()),
                Err(crate::tools::ToolError::Busy) if attempt + 1 < MOUNT_RETRIES => {
                    attempt += 1;
                    std::thread::sleep(MOUNT_RETRY_DELAY);
                }
                Err(e) => return Err(PoolError::tool(format!("Failed to unmount {target:?}"), e)),
            }
        }
    }

    /// Run `task` with the volume mounted, unmounting again afterwards if
    /// this call was the one that mounted it.
    pub(crate) fn mount_task<T>(
        &self,
        vol: &Volume,
        op: Option<&Operation>,
        task: impl FnOnce(&Path) -> Result<T>,
    ) -> Result<T> {
        let our_mount = if vol.is_snapshot() {
            self.mount_volume_snapshot(vol, op)?
        } else {
            self.mount_volume(vol, op)?
        };

        let result = task(&vol.mount_path(&self.data_dir));

        if our_mount {
            let unmounted = if vol.is_snapshot() {
                self.unmount_volume_snapshot(vol, op)
            } else {
                self.unmount_volume(vol, op)
            };
            if let Err(e) = unmounted {
                warn!(volume = %vol.name, error = %e, "Failed to unmount volume after task");
            }
        }

        result
    }

    /// Run `task` with the volume unmounted, remounting afterwards if this
    /// call was the one that unmounted it.
    pub(crate) fn unmount_task<T>(
        &self,
        vol: &Volume,
        op: Option<&Operation>,
        task: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let our_unmount = if vol.is_snapshot() {
            self.unmount_volume_snapshot(vol, op)?
        } else {
            self.unmount_volume(vol, op)?
        };

        let result = task();

        if our_unmount {
            let mounted = if vol.is_snapshot() {
                self.mount_volume_snapshot(vol, op)
            } else {
                self.mount_volume(vol, op)
            };
            if let Err(e) = mounted {
                warn!(volume = %vol.name, error = %e, "Failed to remount volume after task");
            }
        }

        result
    }

    /// Validate the supplied volume config against the recognized keys.
    ///
    /// Unknown keys are dropped when `remove_unknown_keys` is set, rejected
    /// otherwise.
    pub fn validate_volume(&self, vol: &mut Volume, remove_unknown_keys: bool) -> Result<()> {
        if vol.name.contains(paths::TMP_VOLUME_SUFFIX) {
            return Err(PoolError::InvalidConfig {
                reason: format!(
                    "Volume names may not contain the reserved suffix {:?}",
                    paths::TMP_VOLUME_SUFFIX
                ),
            });
        }

        let mut unknown = Vec::new();
        for (key, value) in &vol.config {
            match key.as_str() {
                "block.filesystem" => {
                    if !value.is_empty() && !ALLOWED_FILESYSTEMS.contains(&value.as_str()) {
                        return Err(PoolError::InvalidConfig {
                            reason: format!("Filesystem {value:?} is not supported"),
                        });
                    }
                }
                "lvm.stripes" => {
                    if value.parse::<u32>().is_err() {
                        return Err(PoolError::InvalidConfig {
                            reason: format!("Invalid lvm.stripes value {value:?}"),
                        });
                    }
                }
                "lvm.stripes.size" => {
                    units::parse_byte_size(value)?;
                }
                "size" => {
                    units::parse_byte_size(value)?;
                }
                _ => unknown.push(key.clone()),
            }
        }

        if !unknown.is_empty() {
            if !remove_unknown_keys {
                return Err(PoolError::InvalidConfig {
                    reason: format!("Unknown configuration keys: {}", unknown.join(", ")),
                });
            }
            for key in unknown {
                vol.config.remove(&key);
            }
        }

        if self.uses_thinpool() {
            for key in ["lvm.stripes", "lvm.stripes.size"] {
                if vol.config.get(key).is_some_and(|v| !v.is_empty()) {
                    return Err(PoolError::InvalidConfig {
                        reason: format!("{key} cannot be used with thin pool volumes"),
                    });
                }
            }
        }

        Ok(())
    }

    /// Apply config changes to an existing volume.
    pub fn update_volume(
        &self,
        vol: &Volume,
        changed_config: &HashMap<String, String>,
    ) -> Result<()> {
        if vol.content_type != ContentType::Filesystem {
            return Err(PoolError::NotSupported);
        }

        if let Some(size) = changed_config.get("size") {
            self.set_volume_quota(vol, size, None)?;
        }

        for key in ["lvm.stripes", "lvm.stripes.size"] {
            if changed_config.contains_key(key) {
                return Err(PoolError::InvalidConfig {
                    reason: format!("{key} cannot be changed"),
                });
            }
        }

        Ok(())
    }

    /// Grow a filesystem to fill its device, mounting it when the filesystem
    /// only resizes online.
    pub(crate) fn grow_filesystem(
        &self,
        fs: &str,
        dev: &Path,
        vol: &Volume,
        op: Option<&Operation>,
    ) -> Result<()> {
        match fs {
            "ext4" => self.fs.grow(fs, dev).map_err(|e| {
                PoolError::tool(format!("Error growing filesystem on {dev:?}"), e)
            }),
            "xfs" | "btrfs" => self.mount_task(vol, op, |mount_path| {
                self.fs.grow_mounted(fs, mount_path).map_err(|e| {
                    PoolError::tool(format!("Error growing filesystem on {dev:?}"), e)
                })
            }),
            _ => Err(PoolError::NotSupported),
        }
    }

    pub(crate) fn shrink_filesystem(&self, fs: &str, dev: &Path, new_size: u64) -> Result<()> {
        self.fs.shrink(fs, dev, new_size).map_err(|e| {
            PoolError::tool(format!("Error shrinking filesystem on {dev:?}"), e)
        })
    }
}

/// Whether mounting a second copy of this filesystem requires a fresh UUID.
pub(crate) fn regenerate_uuid_needed(fs: &str) -> bool {
    matches!(fs, "xfs" | "btrfs")
}

/// Translate conventional mount option words into mount flags, leaving the
/// remainder as the filesystem data string.
pub(crate) fn resolve_mount_options(options: &str) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();

    for option in options.split(',').filter(|o| !o.is_empty()) {
        match option {
            "defaults" => {}
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => flags &= !MsFlags::MS_RDONLY,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "suid" => flags &= !MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "dev" => flags &= !MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "exec" => flags &= !MsFlags::MS_NOEXEC,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            "async" => flags &= !MsFlags::MS_SYNCHRONOUS,
            "dirsync" => flags |= MsFlags::MS_DIRSYNC,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "atime" => flags &= !MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "diratime" => flags &= !MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "norelatime" => flags &= !MsFlags::MS_RELATIME,
            "strictatime" => flags |= MsFlags::MS_STRICTATIME,
            "nostrictatime" => flags &= !MsFlags::MS_STRICTATIME,
            "remount" => flags |= MsFlags::MS_REMOUNT,
            other => data.push(other),
        }
    }

    (flags, data.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_mount_flag_words() {
        let (flags, data) = resolve_mount_options("discard");
        assert_eq!(flags, MsFlags::empty());
        assert_eq!(data, "discard");

        let (flags, data) = resolve_mount_options("ro,noatime,discard");
        assert!(flags.contains(MsFlags::MS_RDONLY));
        assert!(flags.contains(MsFlags::MS_NOATIME));
        assert_eq!(data, "discard");

        let (flags, data) = resolve_mount_options("");
        assert_eq!(flags, MsFlags::empty());
        assert_eq!(data, "");
    }

    #[test]
    fn uuid_regeneration_is_fs_specific() {
        assert!(regenerate_uuid_needed("xfs"));
        assert!(regenerate_uuid_needed("btrfs"));
        assert!(!regenerate_uuid_needed("ext4"));
    }
}
