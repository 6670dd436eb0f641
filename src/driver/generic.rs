//! Generic file-level helpers shared by the classic (non-thinpool) paths.
//!
//! These work purely through mounted trees and rsync, so they are usable
//! whenever a volume's contents are reachable as a filesystem: same-pool
//! copy and refresh, migration over a connection, backup staging and backup
//! restore.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use tracing::warn;

use super::Lvm;
use crate::error::{PoolError, Result};
use crate::migration::{VolumeSourceArgs, VolumeTargetArgs};
use crate::paths;
use crate::revert::Reverter;
use crate::rsync;
use crate::volume::{ContentType, Operation, Volume, VolumeFiller};

/// Hook returned from a backup restore, run by the pool manager after it has
/// finished its own post-restore work.
pub type PostHook = Box<dyn FnOnce(&Lvm, &Volume) -> Result<()> + Send>;

/// Hook returned from a backup restore, run by the pool manager to undo the
/// restore if a later step of its own fails.
pub type RevertHook = Box<dyn FnOnce(&Lvm) + Send>;

/// File-level same-pool copy, also used for refresh.
///
/// Requested source snapshots are synced and re-snapshotted on the target
/// first (oldest first), then the head volume. With `refresh` set the target
/// volume is assumed to exist and is diff-synced instead of created.
pub(crate) fn copy_volume(
    d: &Lvm,
    vol: &Volume,
    src_vol: &Volume,
    src_snapshots: &[Volume],
    refresh: bool,
    op: Option<&Operation>,
) -> Result<()> {
    if vol.content_type != ContentType::Filesystem
        || src_vol.content_type != ContentType::Filesystem
    {
        return Err(PoolError::NotSupported);
    }

    let mut revert = Reverter::new();

    if !refresh {
        d.create_volume(vol, None, op)?;
        revert.add(move || {
            if let Err(e) = d.delete_volume(vol, op) {
                warn!(volume = %vol.name, error = %e, "Failed to revert volume copy");
            }
        });
    }

    let bwlimit = d.bwlimit().to_string();

    for src_snapshot in src_snapshots {
        let (_, Some(snap_name)) = src_snapshot.parent_and_snapshot_name() else {
            continue;
        };

        d.mount_task(vol, op, |target_path| {
            d.mount_task(src_snapshot, op, |src_path| {
                rsync::local_copy(src_path, target_path, &bwlimit, op)
            })
        })?;

        let target_snap = vol.new_snapshot(snap_name)?;
        d.create_volume_snapshot(&target_snap, op)?;
        revert.add(move || {
            if let Err(e) = d.delete_volume_snapshot(&target_snap, op) {
                warn!(snapshot = %target_snap.name, error = %e, "Failed to revert snapshot copy");
            }
        });
    }

    // Sync the head volume last so it ends up newer than its snapshots.
    d.mount_task(vol, op, |target_path| {
        d.mount_task(src_vol, op, |src_path| {
            rsync::local_copy(src_path, target_path, &bwlimit, op)
        })?;

        vol.ensure_mount_path(d.data_dir())
    })?;

    revert.success();
    Ok(())
}

/// Enumerate a volume's snapshots from its on-disk snapshot directory.
pub(crate) fn vfs_volume_snapshots(d: &Lvm, vol: &Volume) -> Result<Vec<String>> {
    let dir = paths::volume_snapshot_dir(d.data_dir(), d.name(), vol.vol_type, &vol.name);

    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PoolError::io(&dir, e)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| PoolError::io(&dir, e))?;
        if entry.file_type().map_err(|e| PoolError::io(&dir, e))?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    names.sort();
    Ok(names)
}

/// Send a volume (and the requested snapshots, oldest first) over a
/// migration connection.
pub(crate) fn migrate_volume<R, W>(
    d: &Lvm,
    vol: &Volume,
    mut conn_in: R,
    mut conn_out: W,
    args: &VolumeSourceArgs,
    op: Option<&Operation>,
) -> Result<()>
where
    R: Read + Send,
    W: Write + Send,
{
    let bwlimit = d.bwlimit().to_string();

    for snap_name in &args.snapshots {
        let snap_vol = vol.new_snapshot(snap_name)?;
        d.mount_task(&snap_vol, op, |src_path| {
            rsync::send_dir(src_path, &mut conn_in, &mut conn_out, &bwlimit, op)
        })?;
    }

    d.mount_task(vol, op, |src_path| {
        rsync::send_dir(src_path, &mut conn_in, &mut conn_out, &bwlimit, op)
    })
}

/// Receive a volume (and the announced snapshots, oldest first) from a
/// migration connection.
pub(crate) fn create_volume_from_migration<R, W>(
    d: &Lvm,
    vol: &Volume,
    mut conn_in: R,
    mut conn_out: W,
    args: &VolumeTargetArgs,
    filler: Option<&mut VolumeFiller>,
    op: Option<&Operation>,
) -> Result<()>
where
    R: Read + Send,
    W: Write + Send,
{
    let mut revert = Reverter::new();

    if !args.refresh {
        d.create_volume(vol, filler, op)?;
        revert.add(move || {
            if let Err(e) = d.delete_volume(vol, op) {
                warn!(volume = %vol.name, error = %e, "Failed to revert migrated volume");
            }
        });
    }

    for snap_name in &args.snapshots {
        d.mount_task(vol, op, |target_path| {
            rsync::recv_dir(target_path, &mut conn_in, &mut conn_out, op)
        })?;

        let snap_vol = vol.new_snapshot(snap_name)?;
        d.create_volume_snapshot(&snap_vol, op)?;
        revert.add(move || {
            if let Err(e) = d.delete_volume_snapshot(&snap_vol, op) {
                warn!(snapshot = %snap_vol.name, error = %e, "Failed to revert migrated snapshot");
            }
        });
    }

    d.mount_task(vol, op, |target_path| {
        rsync::recv_dir(target_path, &mut conn_in, &mut conn_out, op)?;

        vol.ensure_mount_path(d.data_dir())
    })?;

    revert.success();
    Ok(())
}

/// Copy a volume's tree (and optionally each snapshot, under
/// `snapshots/<name>`) into a backup staging directory.
pub(crate) fn backup_volume(
    d: &Lvm,
    vol: &Volume,
    target_path: &Path,
    snapshots: bool,
    op: Option<&Operation>,
) -> Result<()> {
    let bwlimit = d.bwlimit().to_string();

    if snapshots {
        for snap_name in d.volume_snapshots(vol, op)? {
            let snap_vol = vol.new_snapshot(&snap_name)?;
            let dst = target_path.join("snapshots").join(&snap_name);
            fs::create_dir_all(&dst).map_err(|e| PoolError::io(&dst, e))?;

            d.mount_task(&snap_vol, op, |src_path| {
                rsync::local_copy(src_path, &dst, &bwlimit, op)
            })?;
        }
    }

    let dst = target_path.join("volume");
    fs::create_dir_all(&dst).map_err(|e| PoolError::io(&dst, e))?;

    d.mount_task(vol, op, |src_path| rsync::local_copy(src_path, &dst, &bwlimit, op))
}

/// Restore a volume and its snapshots from an unpacked backup staging tree
/// laid out as written by [`backup_volume`].
///
/// Returns the post-unpack hook (none for this driver) and a revert hook the
/// caller runs if its own later steps fail.
pub(crate) fn backup_unpack(
    d: &Lvm,
    vol: &Volume,
    snapshots: &[String],
    staging: &Path,
    op: Option<&Operation>,
) -> Result<(Option<PostHook>, RevertHook)> {
    let mut revert = Reverter::new();

    d.create_volume(vol, None, op)?;
    revert.add(move || {
        if let Err(e) = d.delete_volume(vol, op) {
            warn!(volume = %vol.name, error = %e, "Failed to revert backup restore");
        }
    });

    let bwlimit = d.bwlimit().to_string();

    for snap_name in snapshots {
        let src = staging.join("snapshots").join(snap_name);
        d.mount_task(vol, op, |target_path| {
            rsync::local_copy(&src, target_path, &bwlimit, op)
        })?;

        let snap_vol = vol.new_snapshot(snap_name)?;
        d.create_volume_snapshot(&snap_vol, op)?;
        revert.add(move || {
            if let Err(e) = d.delete_volume_snapshot(&snap_vol, op) {
                warn!(snapshot = %snap_vol.name, error = %e, "Failed to revert restored snapshot");
            }
        });
    }

    let src = staging.join("volume");
    d.mount_task(vol, op, |target_path| {
        rsync::local_copy(&src, target_path, &bwlimit, op)?;

        vol.ensure_mount_path(d.data_dir())
    })?;

    revert.success();

    let hook_vol = vol.clone();
    let revert_hook: RevertHook = Box::new(move |driver: &Lvm| {
        if let Err(e) = driver.delete_volume(&hook_vol, None) {
            warn!(volume = %hook_vol.name, error = %e, "Failed to revert backup restore");
        }
    });

    Ok((None, revert_hook))
}
