//! Volume migration argument types.
//!
//! The driver only moves filesystem volumes with the rsync transport; the
//! negotiation of these parameters happens in the pool manager, which hands
//! the agreed arguments down here.

use serde::{Deserialize, Serialize};

/// Transport used to move volume data during a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationFsType {
    /// File-level transfer of a mounted filesystem.
    Rsync,
    /// Raw block transfer followed by a filesystem sync.
    BlockAndRsync,
}

/// Arguments for the sending side of a migration.
#[derive(Debug, Clone)]
pub struct VolumeSourceArgs {
    pub name: String,
    /// Snapshot names to send before the head volume, oldest first.
    pub snapshots: Vec<String>,
    pub fs_type: MigrationFsType,
}

/// Arguments for the receiving side of a migration.
#[derive(Debug, Clone)]
pub struct VolumeTargetArgs {
    pub name: String,
    /// Snapshot names that will arrive before the head volume, oldest first.
    pub snapshots: Vec<String>,
    pub fs_type: MigrationFsType,
    /// Sync into an existing volume instead of creating a fresh one.
    pub refresh: bool,
}
