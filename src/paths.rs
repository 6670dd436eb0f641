//! Centralized path and name resolution.
//!
//! All on-disk layout and LVM naming decisions go through this module so the
//! driver, its helpers and the tests agree on where things live. The mapping
//! is pure: paths are functions of the data dir, pool name, volume type,
//! content type and volume name only.

use std::path::{Path, PathBuf};

use crate::volume::{ContentType, VolumeType, SNAPSHOT_SEPARATOR};

/// Suffix appended to the LV name of block-content volumes.
pub const BLOCK_VOLUME_SUFFIX: &str = ".block";

/// Reserved LV-name suffix for transient writable snapshots.
///
/// Used to mount snapshots on duplicate-UUID-averse filesystems and to set
/// the original volume aside during a restore. Volume validation rejects user
/// names containing it.
pub const TMP_VOLUME_SUFFIX: &str = ".pooltmp";

/// Hyphens in volume names are escaped so the snapshot separator can be
/// encoded as a single hyphen in LV names.
const ESCAPED_HYPHEN: &str = "--";

/// Get the driver data directory.
///
/// Resolution order:
/// 1. `LVMPOOL_DATA_DIR` environment variable
/// 2. `/var/lib/lvmpool` if it exists (system install)
/// 3. `~/.lvmpool` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("LVMPOOL_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/lvmpool");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".lvmpool")).unwrap_or(system_dir)
}

/// Root directory of a pool beneath `base`.
pub fn pool_dir(base: &Path, pool: &str) -> PathBuf {
    base.join("pools").join(pool)
}

/// Mount-point path for a volume, or for a snapshot when `name` is
/// `parent/snap`.
pub fn volume_mount_path(base: &Path, pool: &str, vol_type: VolumeType, name: &str) -> PathBuf {
    match name.split_once(SNAPSHOT_SEPARATOR) {
        Some((parent, snap)) => volume_snapshot_dir(base, pool, vol_type, parent).join(snap),
        None => pool_dir(base, pool).join(vol_type.dir_name()).join(name),
    }
}

/// Directory holding the snapshot mount-points of `parent`.
///
/// Its listing is the authoritative snapshot enumeration for the driver.
pub fn volume_snapshot_dir(base: &Path, pool: &str, vol_type: VolumeType, parent: &str) -> PathBuf {
    pool_dir(base, pool)
        .join(format!("{}-snapshots", vol_type.dir_name()))
        .join(parent)
}

/// Logical volume name for a volume.
///
/// Hyphens in the volume name are escaped as `--` so the snapshot separator
/// can be mapped to a plain hyphen; the volume type prefixes the name and
/// block-content volumes get a distinguishing suffix so a VM block volume and
/// its sibling filesystem volume never collide.
pub fn lv_name(vol_type: VolumeType, content_type: ContentType, name: &str) -> String {
    let mangled = name.replace('-', ESCAPED_HYPHEN).replace(SNAPSHOT_SEPARATOR, "-");

    let suffix = match content_type {
        ContentType::Block => BLOCK_VOLUME_SUFFIX,
        ContentType::Filesystem => "",
    };

    format!("{}_{}{}", vol_type.as_str(), mangled, suffix)
}

/// Device path of a volume's logical volume.
pub fn lv_dev_path(vg: &str, vol_type: VolumeType, content_type: ContentType, name: &str) -> PathBuf {
    PathBuf::from("/dev").join(vg).join(lv_name(vol_type, content_type, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lv_names_encode_type_content_and_snapshots() {
        assert_eq!(lv_name(VolumeType::Custom, ContentType::Filesystem, "c1"), "custom_c1");
        assert_eq!(
            lv_name(VolumeType::VirtualMachine, ContentType::Block, "v1"),
            "virtual-machine_v1.block"
        );
        assert_eq!(
            lv_name(VolumeType::VirtualMachine, ContentType::Filesystem, "v1"),
            "virtual-machine_v1"
        );
        assert_eq!(
            lv_name(VolumeType::Container, ContentType::Filesystem, "web/snap0"),
            "container_web-snap0"
        );
        // A hyphen in the volume name never collides with the snapshot
        // separator encoding.
        assert_eq!(
            lv_name(VolumeType::Container, ContentType::Filesystem, "web-snap0"),
            "container_web--snap0"
        );
    }

    #[test]
    fn dev_paths_are_rooted_in_the_vg() {
        assert_eq!(
            lv_dev_path("vg0", VolumeType::Custom, ContentType::Filesystem, "c1"),
            PathBuf::from("/dev/vg0/custom_c1")
        );
        assert_eq!(
            lv_dev_path("vg0", VolumeType::VirtualMachine, ContentType::Block, "v1"),
            PathBuf::from("/dev/vg0/virtual-machine_v1.block")
        );
    }

    #[test]
    fn mount_paths_follow_type_layout() {
        let base = Path::new("/var/lib/lvmpool");
        assert_eq!(
            volume_mount_path(base, "pool0", VolumeType::Custom, "c1"),
            PathBuf::from("/var/lib/lvmpool/pools/pool0/custom/c1")
        );
        assert_eq!(
            volume_mount_path(base, "pool0", VolumeType::VirtualMachine, "v1"),
            PathBuf::from("/var/lib/lvmpool/pools/pool0/virtual-machines/v1")
        );
        assert_eq!(
            volume_mount_path(base, "pool0", VolumeType::Custom, "c1/s0"),
            PathBuf::from("/var/lib/lvmpool/pools/pool0/custom-snapshots/c1/s0")
        );
        assert_eq!(
            volume_snapshot_dir(base, "pool0", VolumeType::Custom, "c1"),
            PathBuf::from("/var/lib/lvmpool/pools/pool0/custom-snapshots/c1")
        );
    }
}
