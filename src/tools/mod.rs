//! External tooling contracts.
//!
//! The driver is written against these traits rather than the tools
//! themselves: `LvmTools` covers the LVM command suite, `FsTools` the
//! filesystem utilities and the mount/statfs syscalls. Production
//! implementations shell out ([`LvmCli`], [`FsCli`]); tests substitute
//! in-memory implementations.

use std::path::Path;

use nix::mount::MsFlags;
use thiserror::Error;

pub mod fs;
pub mod lvm;

pub use fs::FsCli;
pub use lvm::LvmCli;

/// Structured failure from the tool layer.
///
/// Callers branch on the kind: `NotFound` and `AlreadyExists` drive
/// existence probes, `Busy` drives the mount/unmount retry loops.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("not found")]
    NotFound,

    #[error("resource busy")]
    Busy,

    #[error("already exists")]
    AlreadyExists,

    #[error("{program}: {stderr}")]
    Failed { program: String, stderr: String },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Space allocated to a thin volume from its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinPoolUsage {
    /// Virtual size of the thin volume.
    pub total_bytes: u64,
    /// Bytes actually allocated from the thin pool.
    pub used_bytes: u64,
}

/// LVM command suite contract.
///
/// Every operation either succeeds fully or reports failure with no partial
/// on-disk effect the caller must clean up.
pub trait LvmTools: Send + Sync {
    /// Provision a new logical volume.
    ///
    /// With `thin_pool` set the volume is thin-provisioned from that pool and
    /// the stripe settings are ignored; otherwise a classic LV is allocated
    /// with the optional striping.
    fn create_lv(
        &self,
        vg: &str,
        thin_pool: Option<&str>,
        lv_name: &str,
        size_bytes: u64,
        stripes: Option<u32>,
        stripe_size_bytes: Option<u64>,
    ) -> Result<(), ToolError>;

    /// Create a snapshot LV of `src_lv_name`.
    ///
    /// `cow_size_bytes` sizes the copy-on-write area of a classic snapshot
    /// and is ignored for thin snapshots. The `readonly` flag is only
    /// honored for classic snapshots; thin snapshots are made read-only at
    /// mount time instead.
    fn create_lv_snapshot(
        &self,
        vg: &str,
        src_lv_name: &str,
        snap_lv_name: &str,
        cow_size_bytes: u64,
        readonly: bool,
        thin: bool,
    ) -> Result<(), ToolError>;

    /// Remove an LV. Fails with [`ToolError::Busy`] if the LV is still open.
    fn remove_lv(&self, dev_path: &Path) -> Result<(), ToolError>;

    fn rename_lv(&self, vg: &str, old_lv_name: &str, new_lv_name: &str) -> Result<(), ToolError>;

    fn resize_lv(&self, dev_path: &Path, size_bytes: u64) -> Result<(), ToolError>;

    fn lv_exists(&self, dev_path: &Path) -> Result<bool, ToolError>;

    /// Current size of an LV in bytes.
    fn lv_size(&self, dev_path: &Path) -> Result<u64, ToolError>;

    /// Physical extent size of a volume group in bytes.
    fn vg_extent_size(&self, vg: &str) -> Result<u64, ToolError>;

    /// Allocation figures for a thin volume.
    fn thin_pool_usage(&self, dev_path: &Path) -> Result<ThinPoolUsage, ToolError>;
}

/// Filesystem utility and mount syscall contract.
pub trait FsTools: Send + Sync {
    /// Create a filesystem of type `fs` on `dev`.
    fn mkfs(&self, fs: &str, dev: &Path) -> Result<(), ToolError>;

    /// Grow an unmounted filesystem to fill its device.
    fn grow(&self, fs: &str, dev: &Path) -> Result<(), ToolError>;

    /// Grow a mounted filesystem to fill its device, via its mount path.
    fn grow_mounted(&self, fs: &str, mount_path: &Path) -> Result<(), ToolError>;

    /// Shrink an unmounted filesystem to `new_size_bytes`. Filesystems that
    /// cannot shrink report failure.
    fn shrink(&self, fs: &str, dev: &Path, new_size_bytes: u64) -> Result<(), ToolError>;

    /// Give the filesystem on `dev` a new UUID.
    fn regenerate_uuid(&self, fs: &str, dev: &Path) -> Result<(), ToolError>;

    fn mount(
        &self,
        dev: &Path,
        target: &Path,
        fs: &str,
        flags: MsFlags,
        options: &str,
    ) -> Result<(), ToolError>;

    fn unmount(&self, target: &Path) -> Result<(), ToolError>;

    fn is_mount_point(&self, path: &Path) -> bool;

    /// Bytes used on the filesystem mounted at `path`.
    fn filesystem_usage(&self, path: &Path) -> Result<u64, ToolError>;
}
