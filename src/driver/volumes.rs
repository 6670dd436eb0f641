//! Volume lifecycle operations.
//!
//! Every operation that performs more than one externally visible side effect
//! runs under a [`Reverter`]: each completed effect registers its undo before
//! the next is attempted, and the stack is only disarmed on the final success
//! path, so any failure returns the pool to its pre-call state.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};

use super::{generic, Lvm, PostHook, RevertHook};
use crate::error::{PoolError, Result};
use crate::migration::{MigrationFsType, VolumeSourceArgs, VolumeTargetArgs};
use crate::paths;
use crate::revert::Reverter;
use crate::units;
use crate::volume::{snapshot_volume_name, ContentType, Operation, Volume, VolumeFiller};

impl Lvm {
    /// Create an empty volume, optionally filling it via the supplied filler.
    #[instrument(skip_all, fields(volume = %vol.name))]
    pub fn create_volume(
        &self,
        vol: &Volume,
        filler: Option<&mut VolumeFiller>,
        op: Option<&Operation>,
    ) -> Result<()> {
        let vol_path = vol.mount_path(self.data_dir());
        vol.ensure_mount_path(self.data_dir())?;

        let mut revert = Reverter::new();
        {
            let vol_path = vol_path.clone();
            revert.add(move || {
                let _ = fs::remove_dir_all(&vol_path);
            });
        }

        self.create_logical_volume(vol)?;
        revert.add(move || {
            if let Err(e) = self.delete_volume(vol, op) {
                warn!(volume = %vol.name, error = %e, "Failed to revert volume creation");
            }
        });

        // For VMs, also create the sibling filesystem volume.
        if vol.is_vm_block() {
            let fs_vol = vol.new_vm_block_filesystem_volume();
            self.create_volume(&fs_vol, None, op)?;
            revert.add(move || {
                if let Err(e) = self.delete_volume(&fs_vol, op) {
                    warn!(volume = %fs_vol.name, error = %e, "Failed to revert sibling volume creation");
                }
            });
        }

        if let Some(filler) = filler {
            self.mount_task(vol, op, |mount_path| {
                if vol.content_type == ContentType::Filesystem {
                    debug!(path = %mount_path.display(), "Running filler function");
                    (filler.fill)(mount_path, None)?;
                } else {
                    let dev = self.volume_disk_path(vol)?;
                    debug!(dev = %dev.display(), path = %mount_path.display(), "Running filler function");
                    (filler.fill)(mount_path, Some(&dev))?;
                }

                // Re-assert the mount directory permissions now that the
                // volume's own filesystem root is mounted over it.
                vol.ensure_mount_path(self.data_dir())
            })?;
        }

        revert.success();
        Ok(())
    }

    /// Same-pool volume copy.
    ///
    /// Thinpool-backed pools copy via LVM snapshots; classic pools fall back
    /// to the file-level copy helper.
    pub fn create_volume_from_copy(
        &self,
        vol: &Volume,
        src_vol: &Volume,
        copy_snapshots: bool,
        op: Option<&Operation>,
    ) -> Result<()> {
        let mut src_snapshots = Vec::new();
        if copy_snapshots && !src_vol.is_snapshot() {
            for name in self.volume_snapshots(src_vol, op)? {
                src_snapshots.push(src_vol.new_snapshot(&name)?);
            }
        }

        if self.uses_thinpool() {
            self.copy_thinpool_volume(vol, src_vol, &src_snapshots, false)?;

            // For VMs, also copy the sibling filesystem volume.
            if vol.is_vm_block() {
                let src_fs_vol = src_vol.new_vm_block_filesystem_volume();
                let fs_vol = vol.new_vm_block_filesystem_volume();
                return self.copy_thinpool_volume(&fs_vol, &src_fs_vol, &src_snapshots, false);
            }

            return Ok(());
        }

        generic::copy_volume(self, vol, src_vol, &src_snapshots, false, op)
    }

    /// Create a volume from an incoming migration stream.
    ///
    /// Only filesystem volumes over the rsync transport are supported.
    pub fn create_volume_from_migration<R, W>(
        &self,
        vol: &Volume,
        conn_in: R,
        conn_out: W,
        args: &VolumeTargetArgs,
        filler: Option<&mut VolumeFiller>,
        op: Option<&Operation>,
    ) -> Result<()>
    where
        R: Read + Send,
        W: Write + Send,
    {
        if vol.content_type != ContentType::Filesystem {
            return Err(PoolError::NotSupported);
        }

        if args.fs_type != MigrationFsType::Rsync {
            return Err(PoolError::NotSupported);
        }

        generic::create_volume_from_migration(self, vol, conn_in, conn_out, args, filler, op)
    }

    /// Restore a volume (and optionally snapshots) from an unpacked backup
    /// staging tree, returning the post-unpack and revert hooks.
    pub fn create_volume_from_backup(
        &self,
        vol: &Volume,
        snapshots: &[String],
        staging: &Path,
        op: Option<&Operation>,
    ) -> Result<(Option<PostHook>, RevertHook)> {
        generic::backup_unpack(self, vol, snapshots, staging, op)
    }

    /// Sync a volume (and the given source snapshots) from another volume in
    /// the same pool.
    pub fn refresh_volume(
        &self,
        vol: &Volume,
        src_vol: &Volume,
        src_snapshots: &[Volume],
        op: Option<&Operation>,
    ) -> Result<()> {
        if self.uses_thinpool() {
            return self.copy_thinpool_volume(vol, src_vol, src_snapshots, true);
        }

        generic::copy_volume(self, vol, src_vol, src_snapshots, true, op)
    }

    /// Delete a volume. Fails if any snapshots of the volume remain.
    #[instrument(skip_all, fields(volume = %vol.name))]
    pub fn delete_volume(&self, vol: &Volume, op: Option<&Operation>) -> Result<()> {
        let snapshots = self.volume_snapshots(vol, op)?;
        if !snapshots.is_empty() {
            return Err(PoolError::VolumeHasSnapshots);
        }

        let dev = self.dev_path(vol);
        if self.logical_volume_exists(&dev)? {
            if vol.content_type == ContentType::Filesystem {
                self.unmount_volume(vol, op)?;
            }

            self.remove_logical_volume(&dev)?;
        }

        if vol.content_type == ContentType::Filesystem {
            let mount_path = vol.mount_path(self.data_dir());
            if let Err(e) = fs::remove_dir_all(&mount_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(PoolError::io(&mount_path, e));
                }
            }

            // The snapshot directory should already be gone; clear out the
            // top-level directory in case it was left behind.
            self.delete_parent_snapshot_dir_if_empty(vol.vol_type, &vol.name)?;
        }

        // For VMs, also delete the sibling filesystem volume.
        if vol.is_vm_block() {
            self.delete_volume(&vol.new_vm_block_filesystem_volume(), op)?;
        }

        Ok(())
    }

    /// Whether the volume exists on the storage pool.
    #[must_use]
    pub fn has_volume(&self, vol: &Volume) -> bool {
        self.logical_volume_exists(&self.dev_path(vol)).unwrap_or(false)
    }

    /// Disk space used by the volume.
    pub fn volume_usage(&self, vol: &Volume) -> Result<u64> {
        let mount_path = vol.mount_path(self.data_dir());

        // A mounted filesystem answers directly; a thin block volume can be
        // approximated by its allocation from the thin pool.
        if vol.content_type == ContentType::Filesystem && self.fs.is_mount_point(&mount_path) {
            return self.fs.filesystem_usage(&mount_path).map_err(|e| {
                PoolError::tool(format!("Error querying filesystem usage of {mount_path:?}"), e)
            });
        }

        if vol.content_type == ContentType::Block && self.uses_thinpool() {
            let dev = self.dev_path(vol);
            let usage = self.lvm.thin_pool_usage(&dev).map_err(|e| {
                PoolError::tool(format!("Error querying thin pool usage of {dev:?}"), e)
            })?;
            return Ok(usage.used_bytes);
        }

        Err(PoolError::NotSupported)
    }

    /// Apply a size quota to the volume.
    ///
    /// An empty or `"0"` size is a no-op, as is any change that does not
    /// alter the rounded extent count (LVM would refuse the resize).
    #[instrument(skip_all, fields(volume = %vol.name, size))]
    pub fn set_volume_quota(
        &self,
        vol: &Volume,
        size: &str,
        op: Option<&Operation>,
    ) -> Result<()> {
        if size.is_empty() || size == "0" {
            return Ok(());
        }

        let new_size = self.rounded_size(size)?;
        let dev = self.dev_path(vol);
        let old_size = self.lvm.lv_size(&dev).map_err(|e| {
            PoolError::tool(format!("Error reading size of LVM logical volume {dev:?}"), e)
        })?;

        let extent_size = self.lvm.vg_extent_size(self.vg_name()).map_err(|e| {
            PoolError::tool(
                format!("Error reading extent size of volume group {:?}", self.vg_name()),
                e,
            )
        })?;

        if units::extent_count(new_size, extent_size) == units::extent_count(old_size, extent_size)
        {
            return Ok(());
        }

        match vol.content_type {
            ContentType::Filesystem => {
                let fs = self.volume_filesystem(vol);
                if new_size < old_size {
                    // Shrink the filesystem to the new size first, then the LV.
                    self.shrink_filesystem(&fs, &dev, new_size)?;
                    debug!(dev = %dev.display(), size = new_size, "Logical volume filesystem shrunk");

                    self.resize_logical_volume(&dev, new_size)?;
                } else {
                    // Grow the LV first, then the filesystem to fill it.
                    self.resize_logical_volume(&dev, new_size)?;

                    self.grow_filesystem(&fs, &dev, vol, op)?;
                    debug!(dev = %dev.display(), size = new_size, "Logical volume filesystem grown");
                }
            }
            ContentType::Block => {
                if new_size < old_size {
                    return Err(PoolError::CannotShrinkBlockVolume);
                }

                self.resize_logical_volume(&dev, new_size)?;
            }
        }

        Ok(())
    }

    /// Location of the block device of a VM block volume.
    pub fn volume_disk_path(&self, vol: &Volume) -> Result<PathBuf> {
        if vol.is_vm_block() {
            return Ok(self.dev_path(vol));
        }

        Err(PoolError::NotImplemented)
    }

    /// Mount a volume.
    ///
    /// Returns `true` when this call performed the mount and `false` when the
    /// volume was already mounted; callers pair an unmount only with a `true`
    /// result.
    pub fn mount_volume(&self, vol: &Volume, op: Option<&Operation>) -> Result<bool> {
        let mount_path = vol.mount_path(self.data_dir());

        if vol.content_type == ContentType::Filesystem && !self.fs.is_mount_point(&mount_path) {
            let dev = self.dev_path(vol);
            let fs = self.volume_filesystem(vol);
            let (flags, options) = super::resolve_mount_options(&self.volume_mount_options(vol));
            self.try_mount(&dev, &mount_path, &fs, flags, &options)?;
            debug!(dev = %dev.display(), path = %mount_path.display(), "Mounted logical volume");

            return Ok(true);
        }

        // The block LV of a VM is not itself mountable; mount the sibling
        // filesystem volume instead.
        if vol.is_vm_block() {
            return self.mount_volume(&vol.new_vm_block_filesystem_volume(), op);
        }

        Ok(false)
    }

    /// Unmount a volume. Returns `false` when the volume was not mounted.
    pub fn unmount_volume(&self, vol: &Volume, _op: Option<&Operation>) -> Result<bool> {
        let mount_path = vol.mount_path(self.data_dir());

        if self.fs.is_mount_point(&mount_path) {
            self.try_unmount(&mount_path)?;
            debug!(path = %mount_path.display(), "Unmounted logical volume");

            return Ok(true);
        }

        Ok(false)
    }

    /// Rename a volume along with its snapshots and directories.
    #[instrument(skip_all, fields(volume = %vol.name, new_name = new_vol_name))]
    pub fn rename_volume(
        &self,
        vol: &Volume,
        new_vol_name: &str,
        op: Option<&Operation>,
    ) -> Result<()> {
        self.unmount_task(vol, op, || {
            let snap_names = self.volume_snapshots(vol, op)?;

            let mut revert = Reverter::new();

            // Rename snapshot LVs to use the new parent name.
            for snap_name in &snap_names {
                let old_lv = paths::lv_name(
                    vol.vol_type,
                    vol.content_type,
                    &snapshot_volume_name(&vol.name, snap_name),
                );
                let new_lv = paths::lv_name(
                    vol.vol_type,
                    vol.content_type,
                    &snapshot_volume_name(new_vol_name, snap_name),
                );
                self.rename_logical_volume(&old_lv, &new_lv)?;
                revert.add(move || {
                    if let Err(e) = self.rename_logical_volume(&new_lv, &old_lv) {
                        warn!(error = %e, "Failed to revert snapshot rename");
                    }
                });
            }

            // Move the snapshot directory if present.
            if vol.content_type == ContentType::Filesystem {
                let src_snap_dir = paths::volume_snapshot_dir(
                    self.data_dir(),
                    self.name(),
                    vol.vol_type,
                    &vol.name,
                );
                let dst_snap_dir = paths::volume_snapshot_dir(
                    self.data_dir(),
                    self.name(),
                    vol.vol_type,
                    new_vol_name,
                );
                if src_snap_dir.exists() {
                    fs::rename(&src_snap_dir, &dst_snap_dir)
                        .map_err(|e| PoolError::io(&src_snap_dir, e))?;
                    revert.add(move || {
                        let _ = fs::rename(&dst_snap_dir, &src_snap_dir);
                    });
                }
            }

            // Rename the volume itself.
            let old_lv = self.lv_name_of(vol);
            let new_lv = paths::lv_name(vol.vol_type, vol.content_type, new_vol_name);
            self.rename_logical_volume(&old_lv, &new_lv)?;
            revert.add(move || {
                if let Err(e) = self.rename_logical_volume(&new_lv, &old_lv) {
                    warn!(error = %e, "Failed to revert volume rename");
                }
            });

            // Move the mount directory.
            if vol.content_type == ContentType::Filesystem {
                let src_path = vol.mount_path(self.data_dir());
                let dst_path = paths::volume_mount_path(
                    self.data_dir(),
                    self.name(),
                    vol.vol_type,
                    new_vol_name,
                );
                fs::rename(&src_path, &dst_path).map_err(|e| PoolError::io(&src_path, e))?;
                revert.add(move || {
                    let _ = fs::rename(&dst_path, &src_path);
                });
            }

            // For VMs, also rename the sibling filesystem volume.
            if vol.is_vm_block() {
                self.rename_volume(&vol.new_vm_block_filesystem_volume(), new_vol_name, op)?;
            }

            revert.success();
            Ok(())
        })
    }

    /// Send a volume over a migration connection.
    ///
    /// Only filesystem volumes over the rsync transport are supported.
    pub fn migrate_volume<R, W>(
        &self,
        vol: &Volume,
        conn_in: R,
        conn_out: W,
        args: &VolumeSourceArgs,
        op: Option<&Operation>,
    ) -> Result<()>
    where
        R: Read + Send,
        W: Write + Send,
    {
        if vol.content_type != ContentType::Filesystem {
            return Err(PoolError::NotSupported);
        }

        if args.fs_type != MigrationFsType::Rsync {
            return Err(PoolError::NotSupported);
        }

        generic::migrate_volume(self, vol, conn_in, conn_out, args, op)
    }

    /// Copy a volume (and optionally its snapshots) into a backup staging
    /// directory. This driver has no optimized backup format.
    pub fn backup_volume(
        &self,
        vol: &Volume,
        target_path: &Path,
        _optimized: bool,
        snapshots: bool,
        op: Option<&Operation>,
    ) -> Result<()> {
        generic::backup_volume(self, vol, target_path, snapshots, op)
    }

    pub(crate) fn resize_logical_volume(&self, dev: &Path, size: u64) -> Result<()> {
        self.lvm
            .resize_lv(dev, size)
            .map_err(|e| PoolError::tool(format!("Error resizing LVM logical volume {dev:?}"), e))
    }
}
