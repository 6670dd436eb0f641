//! Snapshot operations.
//!
//! Snapshots are LVM snapshots of the parent LV, mounted read-only. The
//! on-disk snapshot directory is the authoritative enumeration: the origin
//! pointers in LVM metadata are rewritten by restores and must not be
//! consulted. Filesystems that refuse duplicate UUIDs are mounted through a
//! transient writable snapshot-of-the-snapshot so the original is never
//! modified.

use std::fs;
use std::path::PathBuf;

use nix::mount::MsFlags;
use tracing::{debug, instrument, warn};

use super::{generic, regenerate_uuid_needed, resolve_mount_options, Lvm};
use crate::error::{PoolError, Result};
use crate::paths;
use crate::revert::Reverter;
use crate::rsync;
use crate::volume::{snapshot_volume_name, ContentType, Operation, Volume, VolumeType};

impl Lvm {
    /// Create a read-only snapshot of a volume.
    ///
    /// `snap_vol` carries the `parent/snap` name.
    #[instrument(skip_all, fields(snapshot = %snap_vol.name))]
    pub fn create_volume_snapshot(&self, snap_vol: &Volume, _op: Option<&Operation>) -> Result<()> {
        let (parent_name, _) = snap_vol.parent_and_snapshot_name();
        let parent_vol = Volume::new(
            snap_vol.pool.clone(),
            snap_vol.vol_type,
            snap_vol.content_type,
            parent_name,
            snap_vol.config.clone(),
            snap_vol.pool_config.clone(),
        );

        self.create_parent_snapshot_dir_if_missing(snap_vol.vol_type, parent_name)?;

        let mut revert = Reverter::new();

        let snap_path = snap_vol.mount_path(self.data_dir());
        snap_vol.ensure_mount_path(self.data_dir())?;
        {
            let snap_path = snap_path.clone();
            revert.add(move || {
                let _ = fs::remove_dir_all(&snap_path);
            });
        }

        self.create_logical_volume_snapshot(&parent_vol, snap_vol, true)?;

        let dev = self.dev_path(snap_vol);
        revert.add(move || {
            if let Err(e) = self.remove_logical_volume(&dev) {
                warn!(error = %e, "Failed to revert snapshot creation");
            }
        });

        // For VMs, also snapshot the sibling filesystem volume.
        if snap_vol.is_vm_block() {
            let parent_fs_vol = parent_vol.new_vm_block_filesystem_volume();
            let fs_vol = snap_vol.new_vm_block_filesystem_volume();
            self.create_logical_volume_snapshot(&parent_fs_vol, &fs_vol, true)?;
        }

        revert.success();
        Ok(())
    }

    /// Remove a snapshot from the storage pool.
    #[instrument(skip_all, fields(snapshot = %snap_vol.name))]
    pub fn delete_volume_snapshot(&self, snap_vol: &Volume, op: Option<&Operation>) -> Result<()> {
        let dev = self.dev_path(snap_vol);
        if self.logical_volume_exists(&dev)? {
            self.unmount_volume(snap_vol, op)?;
            self.remove_logical_volume(&dev)?;
        }

        // For VMs, also remove the sibling filesystem snapshot.
        if snap_vol.is_vm_block() {
            self.delete_volume_snapshot(&snap_vol.new_vm_block_filesystem_volume(), op)?;
        }

        let snap_path = snap_vol.mount_path(self.data_dir());
        if let Err(e) = fs::remove_dir_all(&snap_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(PoolError::io(&snap_path, e));
            }
        }

        let (parent_name, _) = snap_vol.parent_and_snapshot_name();
        self.delete_parent_snapshot_dir_if_empty(snap_vol.vol_type, parent_name)?;

        Ok(())
    }

    /// Mount a snapshot read-only.
    ///
    /// Filesystems that refuse to mount two volumes sharing a UUID get a
    /// transient writable snapshot of the snapshot with a regenerated UUID,
    /// and that is what gets mounted; the original snapshot is never touched.
    /// The UUID work happens here rather than at snapshot time because
    /// snapshot creation must stay fast, and because a possibly corrupt
    /// snapshot should not be written to.
    pub fn mount_volume_snapshot(
        &self,
        snap_vol: &Volume,
        op: Option<&Operation>,
    ) -> Result<bool> {
        let mount_path = snap_vol.mount_path(self.data_dir());

        if snap_vol.content_type == ContentType::Filesystem
            && !self.fs.is_mount_point(&mount_path)
        {
            let mut revert = Reverter::new();

            let fs_name = self.volume_filesystem(snap_vol);

            // Default to mounting the original snapshot directly.
            let mut mount_vol = snap_vol.clone();

            if regenerate_uuid_needed(&fs_name) {
                let tmp_vol = self.tmp_volume(snap_vol);
                self.create_logical_volume_snapshot(snap_vol, &tmp_vol, false)?;

                let tmp_dev = self.dev_path(&tmp_vol);
                {
                    let tmp_dev = tmp_dev.clone();
                    revert.add(move || {
                        if let Err(e) = self.remove_logical_volume(&tmp_dev) {
                            warn!(error = %e, "Failed to remove temporary snapshot volume");
                        }
                    });
                }

                debug!(dev = %tmp_dev.display(), fs = %fs_name, "Regenerating filesystem UUID");
                self.fs.regenerate_uuid(&fs_name, &tmp_dev).map_err(|e| {
                    PoolError::tool(format!("Error regenerating filesystem UUID on {tmp_dev:?}"), e)
                })?;

                mount_vol = tmp_vol;
            }

            let dev = self.dev_path(&mount_vol);
            let (flags, options) = resolve_mount_options(&self.volume_mount_options(snap_vol));
            self.try_mount(&dev, &mount_path, &fs_name, flags | MsFlags::MS_RDONLY, &options)?;
            debug!(dev = %dev.display(), path = %mount_path.display(), "Mounted logical volume snapshot");

            revert.success();
            return Ok(true);
        }

        // For VMs, mount the sibling filesystem snapshot.
        if snap_vol.is_vm_block() {
            return self.mount_volume_snapshot(&snap_vol.new_vm_block_filesystem_volume(), op);
        }

        Ok(false)
    }

    /// Remove the read-only mount placed on top of a snapshot.
    ///
    /// The transient snapshot LV is probed for by name regardless of whether
    /// the mount was backed by one, and removed when present. If that removal
    /// fails the unmount itself has already completed; the error reports the
    /// leftover LV.
    pub fn unmount_volume_snapshot(
        &self,
        snap_vol: &Volume,
        _op: Option<&Operation>,
    ) -> Result<bool> {
        let mount_path = snap_vol.mount_path(self.data_dir());

        if self.fs.is_mount_point(&mount_path) {
            self.try_unmount(&mount_path)?;
            debug!(path = %mount_path.display(), "Unmounted logical volume snapshot");

            let tmp_dev = self.dev_path(&self.tmp_volume(snap_vol));
            let exists = self.lvm.lv_exists(&tmp_dev).map_err(|e| {
                PoolError::tool(
                    format!("Failed to check existence of temporary snapshot volume {tmp_dev:?}"),
                    e,
                )
            })?;

            if exists {
                self.remove_logical_volume(&tmp_dev)?;
            }

            return Ok(true);
        }

        Ok(false)
    }

    /// List the snapshots of a volume, by bare snapshot name.
    ///
    /// The on-disk snapshot directory is consulted rather than the logical
    /// volumes themselves, because restoring a snapshot rewrites the origin
    /// property of the remaining snapshots.
    pub fn volume_snapshots(&self, vol: &Volume, _op: Option<&Operation>) -> Result<Vec<String>> {
        generic::vfs_volume_snapshots(self, vol)
    }

    /// Restore a volume from one of its snapshots.
    #[instrument(skip_all, fields(volume = %vol.name, snapshot = snapshot_name))]
    pub fn restore_volume(
        &self,
        vol: &Volume,
        snapshot_name: &str,
        op: Option<&Operation>,
    ) -> Result<()> {
        let snap_vol = vol.new_snapshot(snapshot_name)?;

        // Thinpool restore is a rename swap: set the current volume aside
        // under the transient suffix, instantiate a writable snapshot under
        // the original name, and only then drop the set-aside original, so
        // the whole operation can revert up to the final removal.
        if self.uses_thinpool() {
            let mut revert = Reverter::new();

            self.unmount_volume(vol, op)?;

            let tmp_vol = self.tmp_volume(vol);
            let original_lv = self.lv_name_of(vol);
            let tmp_lv = self.lv_name_of(&tmp_vol);

            self.rename_logical_volume(&original_lv, &tmp_lv)?;
            {
                let original_lv = original_lv.clone();
                let tmp_lv = tmp_lv.clone();
                revert.add(move || {
                    if let Err(e) = self.rename_logical_volume(&tmp_lv, &original_lv) {
                        warn!(error = %e, "Failed to restore original volume name");
                    }
                });
            }

            self.create_logical_volume_snapshot(&snap_vol, vol, false)?;

            let dev = self.dev_path(vol);
            {
                let dev = dev.clone();
                revert.add(move || {
                    if let Err(e) = self.remove_logical_volume(&dev) {
                        warn!(error = %e, "Failed to remove restored volume");
                    }
                });
            }

            let fs_name = self.volume_filesystem(vol);
            if vol.content_type == ContentType::Filesystem && regenerate_uuid_needed(&fs_name) {
                debug!(dev = %dev.display(), fs = %fs_name, "Regenerating filesystem UUID");
                self.fs.regenerate_uuid(&fs_name, &dev).map_err(|e| {
                    PoolError::tool(format!("Error regenerating filesystem UUID on {dev:?}"), e)
                })?;
            }

            // Removing the set-aside original must stay the last step; until
            // here the restore can fully revert.
            self.remove_logical_volume(&self.dev_path(&tmp_vol))?;

            revert.success();
            return Ok(());
        }

        // Classic pools sync the snapshot contents back over the volume.
        self.mount_task(vol, op, |mount_path| {
            self.mount_task(&snap_vol, op, |src_path| {
                rsync::local_copy(src_path, mount_path, self.bwlimit(), op)
            })?;

            vol.ensure_mount_path(self.data_dir())
        })
    }

    /// Rename a snapshot, moving its LV and mount directory in lockstep.
    ///
    /// This intentionally does not recurse onto the VM-block sibling; callers
    /// renaming a VM-block snapshot issue one call per content type.
    pub fn rename_volume_snapshot(
        &self,
        snap_vol: &Volume,
        new_snapshot_name: &str,
        _op: Option<&Operation>,
    ) -> Result<()> {
        let (parent_name, _) = snap_vol.parent_and_snapshot_name();
        let new_full_name = snapshot_volume_name(parent_name, new_snapshot_name);

        let old_lv = self.lv_name_of(snap_vol);
        let new_lv = paths::lv_name(snap_vol.vol_type, snap_vol.content_type, &new_full_name);

        let mut revert = Reverter::new();

        self.rename_logical_volume(&old_lv, &new_lv)?;
        {
            let old_lv = old_lv.clone();
            let new_lv = new_lv.clone();
            revert.add(move || {
                if let Err(e) = self.rename_logical_volume(&new_lv, &old_lv) {
                    warn!(error = %e, "Failed to revert snapshot rename");
                }
            });
        }

        let old_path = snap_vol.mount_path(self.data_dir());
        let new_path = paths::volume_mount_path(
            self.data_dir(),
            self.name(),
            snap_vol.vol_type,
            &new_full_name,
        );
        fs::rename(&old_path, &new_path).map_err(|e| PoolError::io(&old_path, e))?;

        revert.success();
        Ok(())
    }

    /// Thinpool copy primitive: materialize `vol` (and the requested source
    /// snapshots) as thin snapshots of `src_vol`, so the copies chain off the
    /// originals without moving data.
    pub(crate) fn copy_thinpool_volume(
        &self,
        vol: &Volume,
        src_vol: &Volume,
        src_snapshots: &[Volume],
        refresh: bool,
    ) -> Result<()> {
        let mut revert = Reverter::new();

        // Volumes set aside during a refresh, removed only once everything
        // else has succeeded.
        let mut remove_devs: Vec<PathBuf> = Vec::new();

        if !src_vol.is_snapshot() {
            for src_snapshot in src_snapshots {
                let (_, Some(snap_name)) = src_snapshot.parent_and_snapshot_name() else {
                    continue;
                };

                let new_full_name = snapshot_volume_name(&vol.name, snap_name);
                let new_snap_vol = Volume { name: new_full_name.clone(), ..vol.clone() };
                if self.has_volume(&new_snap_vol) {
                    return Err(PoolError::VolumeExists { name: new_full_name });
                }

                self.create_parent_snapshot_dir_if_missing(vol.vol_type, &vol.name)?;

                let snap_path = new_snap_vol.mount_path(self.data_dir());
                new_snap_vol.ensure_mount_path(self.data_dir())?;
                {
                    let snap_path = snap_path.clone();
                    revert.add(move || {
                        let _ = fs::remove_dir_all(&snap_path);
                    });
                }

                // Chain the copy off the original snapshot. The new snapshot
                // is left untouched; a filesystem needing a fresh UUID gets
                // one at mount time.
                let src_snap =
                    Volume { content_type: vol.content_type, ..src_snapshot.clone() };
                self.create_logical_volume_snapshot(&src_snap, &new_snap_vol, true)?;

                let dev = self.dev_path(&new_snap_vol);
                revert.add(move || {
                    if let Err(e) = self.remove_logical_volume(&dev) {
                        warn!(error = %e, "Failed to revert snapshot copy");
                    }
                });
            }
        }

        // Handle the head volume.
        if self.has_volume(vol) {
            if !refresh {
                return Err(PoolError::VolumeExists { name: vol.name.clone() });
            }

            let tmp_vol = self.tmp_volume(vol);
            let vol_lv = self.lv_name_of(vol);
            let tmp_lv = self.lv_name_of(&tmp_vol);

            self.rename_logical_volume(&vol_lv, &tmp_lv)?;
            {
                let vol_lv = vol_lv.clone();
                let tmp_lv = tmp_lv.clone();
                revert.add(move || {
                    if let Err(e) = self.rename_logical_volume(&tmp_lv, &vol_lv) {
                        warn!(error = %e, "Failed to restore original volume name");
                    }
                });
            }

            remove_devs.push(self.dev_path(&tmp_vol));
        } else {
            let vol_path = vol.mount_path(self.data_dir());
            vol.ensure_mount_path(self.data_dir())?;
            revert.add(move || {
                let _ = fs::remove_dir_all(&vol_path);
            });
        }

        // Writable snapshot of the source head, named as the target.
        self.create_logical_volume_snapshot(src_vol, vol, false)?;

        let head_dev = self.dev_path(vol);
        {
            let head_dev = head_dev.clone();
            revert.add(move || {
                if let Err(e) = self.remove_logical_volume(&head_dev) {
                    warn!(error = %e, "Failed to revert volume copy");
                }
            });
        }

        if vol.content_type == ContentType::Filesystem {
            let fs_name = self.volume_filesystem(vol);
            if regenerate_uuid_needed(&fs_name) {
                debug!(dev = %head_dev.display(), fs = %fs_name, "Regenerating filesystem UUID");
                self.fs.regenerate_uuid(&fs_name, &head_dev).map_err(|e| {
                    PoolError::tool(
                        format!("Error regenerating filesystem UUID on {head_dev:?}"),
                        e,
                    )
                })?;
            }
        }

        // Removing the set-aside volumes must stay the last step; until here
        // the copy can fully revert.
        for dev in &remove_devs {
            self.remove_logical_volume(dev)?;
        }

        revert.success();
        Ok(())
    }

    /// Derive the transient volume used to set `vol` aside or to mount its
    /// snapshot with a fresh UUID.
    pub(crate) fn tmp_volume(&self, vol: &Volume) -> Volume {
        Volume { name: format!("{}{}", vol.name, paths::TMP_VOLUME_SUFFIX), ..vol.clone() }
    }

    pub(crate) fn create_parent_snapshot_dir_if_missing(
        &self,
        vol_type: VolumeType,
        parent: &str,
    ) -> Result<()> {
        let dir = paths::volume_snapshot_dir(self.data_dir(), self.name(), vol_type, parent);
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| PoolError::io(&dir, e))?;
        }
        Ok(())
    }

    pub(crate) fn delete_parent_snapshot_dir_if_empty(
        &self,
        vol_type: VolumeType,
        parent: &str,
    ) -> Result<()> {
        let dir = paths::volume_snapshot_dir(self.data_dir(), self.name(), vol_type, parent);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(PoolError::io(&dir, e)),
        };

        if entries.count() == 0 {
            fs::remove_dir(&dir).map_err(|e| PoolError::io(&dir, e))?;
        }

        Ok(())
    }
}
