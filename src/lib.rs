//! LVM-backed storage pool driver.
//!
//! Maps pool-level volume lifecycle operations (create, copy, refresh,
//! snapshot, restore, rename, resize, migrate, backup, delete, mount) onto
//! LVM primitives: volume groups, logical volumes, thinpools and snapshots,
//! coordinated with filesystem tooling and an on-disk mount-point layout.
//!
//! Three properties hold across every operation: a partial failure reverts to
//! the pre-call state via compensating actions, a VM block volume and its
//! sibling filesystem volume stay lifecycle-atomic, and snapshots are
//! mountable read-only without ever being written to, even on filesystems
//! that refuse duplicate UUIDs.

pub mod driver;
pub mod error;
pub mod migration;
pub mod paths;
pub mod revert;
pub mod rsync;
pub mod tools;
pub mod units;
pub mod volume;

// Re-export commonly used items
pub use driver::{Lvm, PostHook, RevertHook, ALLOWED_FILESYSTEMS};
pub use error::{PoolError, Result};
pub use migration::{MigrationFsType, VolumeSourceArgs, VolumeTargetArgs};
pub use revert::Reverter;
pub use tools::{FsCli, FsTools, LvmCli, LvmTools, ThinPoolUsage, ToolError};
pub use volume::{ContentType, Operation, Volume, VolumeFiller, VolumeType};
