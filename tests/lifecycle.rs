//! Integration tests for the volume lifecycle engine.
//!
//! These exercise the driver's state machine against in-memory tool layers:
//! LVM state lives in a map keyed by LV name, mounts in a set keyed by target
//! path, and the pool's directory tree in a scratch data dir. LV "contents"
//! are modelled as a tag string that snapshots copy, which is enough to
//! observe what restore and copy actually materialize.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nix::mount::MsFlags;
use tempfile::TempDir;

use lvmpool::{
    ContentType, FsTools, Lvm, LvmTools, PoolError, ThinPoolUsage, ToolError, Volume, VolumeType,
};

#[derive(Debug, Clone)]
struct LvRecord {
    size: u64,
    /// Stand-in for the volume's bytes; snapshots copy it.
    content: String,
    readonly: bool,
}

/// In-memory LVM state.
#[derive(Default)]
struct MockLvm {
    lvs: Mutex<BTreeMap<String, LvRecord>>,
    extent_size: u64,
    /// Operations to fail, keyed `"<verb>:<lv name>"`.
    failures: Mutex<HashSet<String>>,
    resize_calls: Mutex<Vec<(String, u64)>>,
}

impl MockLvm {
    fn new(extent_size: u64) -> Self {
        Self { extent_size, ..Self::default() }
    }

    fn fail_on(&self, key: &str) {
        self.failures.lock().unwrap().insert(key.to_string());
    }

    fn should_fail(&self, verb: &str, lv: &str) -> bool {
        self.failures.lock().unwrap().contains(&format!("{verb}:{lv}"))
    }

    fn lv_names(&self) -> Vec<String> {
        self.lvs.lock().unwrap().keys().cloned().collect()
    }

    fn has_lv(&self, lv: &str) -> bool {
        self.lvs.lock().unwrap().contains_key(lv)
    }

    fn content(&self, lv: &str) -> String {
        self.lvs.lock().unwrap()[lv].content.clone()
    }

    fn set_content(&self, lv: &str, content: &str) {
        self.lvs.lock().unwrap().get_mut(lv).unwrap().content = content.to_string();
    }

    fn set_size(&self, lv: &str, size: u64) {
        self.lvs.lock().unwrap().get_mut(lv).unwrap().size = size;
    }
}

fn lv_of(dev_path: &Path) -> String {
    dev_path.file_name().unwrap().to_string_lossy().into_owned()
}

fn failed(program: &str) -> ToolError {
    ToolError::Failed { program: program.to_string(), stderr: "injected failure".to_string() }
}

impl LvmTools for MockLvm {
    fn create_lv(
        &self,
        _vg: &str,
        _thin_pool: Option<&str>,
        lv_name: &str,
        size_bytes: u64,
        _stripes: Option<u32>,
        _stripe_size_bytes: Option<u64>,
    ) -> Result<(), ToolError> {
        if self.should_fail("create", lv_name) {
            return Err(failed("lvcreate"));
        }

        let mut lvs = self.lvs.lock().unwrap();
        if lvs.contains_key(lv_name) {
            return Err(ToolError::AlreadyExists);
        }
        lvs.insert(
            lv_name.to_string(),
            LvRecord { size: size_bytes, content: String::new(), readonly: false },
        );
        Ok(())
    }

    fn create_lv_snapshot(
        &self,
        _vg: &str,
        src_lv_name: &str,
        snap_lv_name: &str,
        _cow_size_bytes: u64,
        readonly: bool,
        _thin: bool,
    ) -> Result<(), ToolError> {
        if self.should_fail("snapshot", snap_lv_name) {
            return Err(failed("lvcreate"));
        }

        let mut lvs = self.lvs.lock().unwrap();
        let Some(src) = lvs.get(src_lv_name).cloned() else {
            return Err(ToolError::NotFound);
        };
        if lvs.contains_key(snap_lv_name) {
            return Err(ToolError::AlreadyExists);
        }
        lvs.insert(
            snap_lv_name.to_string(),
            LvRecord { size: src.size, content: src.content, readonly },
        );
        Ok(())
    }

    fn remove_lv(&self, dev_path: &Path) -> Result<(), ToolError> {
        let lv = lv_of(dev_path);
        if self.should_fail("remove", &lv) {
            return Err(failed("lvremove"));
        }

        match self.lvs.lock().unwrap().remove(&lv) {
            Some(_) => Ok(()),
            None => Err(ToolError::NotFound),
        }
    }

    fn rename_lv(&self, _vg: &str, old_lv_name: &str, new_lv_name: &str) -> Result<(), ToolError> {
        if self.should_fail("rename", old_lv_name) {
            return Err(failed("lvrename"));
        }

        let mut lvs = self.lvs.lock().unwrap();
        if lvs.contains_key(new_lv_name) {
            return Err(ToolError::AlreadyExists);
        }
        match lvs.remove(old_lv_name) {
            Some(record) => {
                lvs.insert(new_lv_name.to_string(), record);
                Ok(())
            }
            None => Err(ToolError::NotFound),
        }
    }

    fn resize_lv(&self, dev_path: &Path, size_bytes: u64) -> Result<(), ToolError> {
        let lv = lv_of(dev_path);
        let mut lvs = self.lvs.lock().unwrap();
        match lvs.get_mut(&lv) {
            Some(record) => {
                record.size = size_bytes;
                self.resize_calls.lock().unwrap().push((lv, size_bytes));
                Ok(())
            }
            None => Err(ToolError::NotFound),
        }
    }

    fn lv_exists(&self, dev_path: &Path) -> Result<bool, ToolError> {
        Ok(self.lvs.lock().unwrap().contains_key(&lv_of(dev_path)))
    }

    fn lv_size(&self, dev_path: &Path) -> Result<u64, ToolError> {
        self.lvs
            .lock()
            .unwrap()
            .get(&lv_of(dev_path))
            .map(|r| r.size)
            .ok_or(ToolError::NotFound)
    }

    fn vg_extent_size(&self, _vg: &str) -> Result<u64, ToolError> {
        Ok(self.extent_size)
    }

    fn thin_pool_usage(&self, dev_path: &Path) -> Result<ThinPoolUsage, ToolError> {
        let size = self.lv_size(dev_path)?;
        Ok(ThinPoolUsage { total_bytes: size, used_bytes: size / 2 })
    }
}

/// In-memory mount table and filesystem tool log.
#[derive(Default)]
struct MockFs {
    /// target -> (device, flags)
    mounts: Mutex<HashMap<PathBuf, (PathBuf, MsFlags)>>,
    formatted: Mutex<HashMap<String, String>>,
    uuids_regenerated: Mutex<Vec<String>>,
}

impl MockFs {
    fn mount_of(&self, target: &Path) -> Option<(PathBuf, MsFlags)> {
        self.mounts.lock().unwrap().get(target).cloned()
    }

    fn regenerated(&self, lv: &str) -> bool {
        self.uuids_regenerated.lock().unwrap().iter().any(|l| l == lv)
    }
}

impl FsTools for MockFs {
    fn mkfs(&self, fs: &str, dev: &Path) -> Result<(), ToolError> {
        self.formatted.lock().unwrap().insert(lv_of(dev), fs.to_string());
        Ok(())
    }

    fn grow(&self, _fs: &str, _dev: &Path) -> Result<(), ToolError> {
        Ok(())
    }

    fn grow_mounted(&self, _fs: &str, _mount_path: &Path) -> Result<(), ToolError> {
        Ok(())
    }

    fn shrink(&self, _fs: &str, _dev: &Path, _new_size_bytes: u64) -> Result<(), ToolError> {
        Ok(())
    }

    fn regenerate_uuid(&self, _fs: &str, dev: &Path) -> Result<(), ToolError> {
        self.uuids_regenerated.lock().unwrap().push(lv_of(dev));
        Ok(())
    }

    fn mount(
        &self,
        dev: &Path,
        target: &Path,
        _fs: &str,
        flags: MsFlags,
        _options: &str,
    ) -> Result<(), ToolError> {
        self.mounts.lock().unwrap().insert(target.to_path_buf(), (dev.to_path_buf(), flags));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), ToolError> {
        match self.mounts.lock().unwrap().remove(target) {
            Some(_) => Ok(()),
            None => Err(ToolError::NotFound),
        }
    }

    fn is_mount_point(&self, path: &Path) -> bool {
        self.mounts.lock().unwrap().contains_key(path)
    }

    fn filesystem_usage(&self, _path: &Path) -> Result<u64, ToolError> {
        Ok(4096)
    }
}

fn new_driver(thin: bool) -> (Lvm, Arc<MockLvm>, Arc<MockFs>, TempDir) {
    let data_dir = TempDir::new().expect("Failed to create temp directory");

    let mut config = HashMap::new();
    config.insert("lvm.vg_name".to_string(), "vg0".to_string());
    if thin {
        config.insert("lvm.thinpool_name".to_string(), "tp".to_string());
    }

    let lvm = Arc::new(MockLvm::new(4 * 1024 * 1024));
    let fs = Arc::new(MockFs::default());
    let driver = Lvm::with_tools(
        "pool0",
        config,
        data_dir.path().to_path_buf(),
        lvm.clone(),
        fs.clone(),
    )
    .expect("Failed to construct driver");

    (driver, lvm, fs, data_dir)
}

fn vol(vol_type: VolumeType, content_type: ContentType, name: &str) -> Volume {
    let mut config = HashMap::new();
    config.insert("size".to_string(), "16MiB".to_string());
    Volume::new("pool0", vol_type, content_type, name, config, HashMap::new())
}

#[test]
fn create_then_delete_filesystem_volume() {
    let (driver, lvm, fs, data_dir) = new_driver(false);

    let c1 = vol(VolumeType::Custom, ContentType::Filesystem, "c1");
    driver.create_volume(&c1, None, None).expect("Failed to create volume");

    assert!(driver.has_volume(&c1));
    assert!(lvm.has_lv("custom_c1"));
    assert_eq!(fs.formatted.lock().unwrap()["custom_c1"], "ext4");

    let mount_path = data_dir.path().join("pools/pool0/custom/c1");
    assert!(mount_path.is_dir());

    driver.delete_volume(&c1, None).expect("Failed to delete volume");
    assert!(!driver.has_volume(&c1));
    assert!(lvm.lv_names().is_empty());
    assert!(!mount_path.exists());
}

#[test]
fn vm_block_create_is_atomic() {
    let (driver, lvm, _fs, _data_dir) = new_driver(false);

    let v1 = vol(VolumeType::VirtualMachine, ContentType::Block, "v1");
    driver.create_volume(&v1, None, None).expect("Failed to create VM volume");

    // Both halves of the pair exist.
    assert!(lvm.has_lv("virtual-machine_v1.block"));
    assert!(lvm.has_lv("virtual-machine_v1"));

    driver.delete_volume(&v1, None).expect("Failed to delete VM volume");
    assert!(lvm.lv_names().is_empty());
}

#[test]
fn vm_block_create_reverts_when_sibling_fails() {
    let (driver, lvm, _fs, data_dir) = new_driver(false);

    // Fail the sibling filesystem LV, after the block LV has been created.
    lvm.fail_on("create:virtual-machine_v1");

    let v1 = vol(VolumeType::VirtualMachine, ContentType::Block, "v1");
    assert!(driver.create_volume(&v1, None, None).is_err());

    // Neither LV nor the mount directory survive.
    assert!(lvm.lv_names().is_empty());
    assert!(!data_dir.path().join("pools/pool0/virtual-machines/v1").exists());
}

#[test]
fn delete_refuses_while_snapshots_remain() {
    let (driver, lvm, _fs, _data_dir) = new_driver(false);

    let c1 = vol(VolumeType::Custom, ContentType::Filesystem, "c1");
    driver.create_volume(&c1, None, None).expect("Failed to create volume");

    let s0 = c1.new_snapshot("s0").expect("Failed to derive snapshot");
    driver.create_volume_snapshot(&s0, None).expect("Failed to create snapshot");

    assert_eq!(driver.volume_snapshots(&c1, None).unwrap(), vec!["s0".to_string()]);

    let err = driver.delete_volume(&c1, None).unwrap_err();
    assert!(matches!(err, PoolError::VolumeHasSnapshots));
    assert!(lvm.has_lv("custom_c1"));

    driver.delete_volume_snapshot(&s0, None).expect("Failed to delete snapshot");
    assert!(driver.volume_snapshots(&c1, None).unwrap().is_empty());

    driver.delete_volume(&c1, None).expect("Failed to delete volume");
    assert!(lvm.lv_names().is_empty());
}

#[test]
fn mount_and_unmount_are_idempotent() {
    let (driver, _lvm, fs, data_dir) = new_driver(false);

    let c1 = vol(VolumeType::Custom, ContentType::Filesystem, "c1");
    driver.create_volume(&c1, None, None).expect("Failed to create volume");

    assert!(driver.mount_volume(&c1, None).unwrap());
    assert!(!driver.mount_volume(&c1, None).unwrap());

    let mount_path = data_dir.path().join("pools/pool0/custom/c1");
    let (dev, _flags) = fs.mount_of(&mount_path).expect("Volume not mounted");
    assert_eq!(dev, PathBuf::from("/dev/vg0/custom_c1"));

    assert!(driver.unmount_volume(&c1, None).unwrap());
    assert!(!driver.unmount_volume(&c1, None).unwrap());
    assert!(fs.mount_of(&mount_path).is_none());
}

#[test]
fn vm_block_mount_targets_the_sibling() {
    let (driver, _lvm, fs, data_dir) = new_driver(false);

    let v1 = vol(VolumeType::VirtualMachine, ContentType::Block, "v1");
    driver.create_volume(&v1, None, None).expect("Failed to create VM volume");

    assert!(driver.mount_volume(&v1, None).unwrap());

    // The mounted device is the filesystem sibling, not the raw block LV.
    let mount_path = data_dir.path().join("pools/pool0/virtual-machines/v1");
    let (dev, _flags) = fs.mount_of(&mount_path).expect("Volume not mounted");
    assert_eq!(dev, PathBuf::from("/dev/vg0/virtual-machine_v1"));

    assert_eq!(
        driver.volume_disk_path(&v1).unwrap(),
        PathBuf::from("/dev/vg0/virtual-machine_v1.block")
    );
    assert!(matches!(
        driver.volume_disk_path(&vol(VolumeType::Custom, ContentType::Filesystem, "c9")),
        Err(PoolError::NotImplemented)
    ));
}

#[test]
fn thin_restore_recovers_snapshot_contents() {
    let (driver, lvm, _fs, _data_dir) = new_driver(true);

    let web = vol(VolumeType::Custom, ContentType::Filesystem, "web");
    driver.create_volume(&web, None, None).expect("Failed to create volume");

    lvm.set_content("custom_web", "A");
    let s0 = web.new_snapshot("s0").unwrap();
    driver.create_volume_snapshot(&s0, None).expect("Failed to create snapshot");
    assert_eq!(lvm.content("custom_web-s0"), "A");

    lvm.set_content("custom_web", "B");

    driver.restore_volume(&web, "s0", None).expect("Failed to restore volume");

    // The restored head carries the snapshot's contents; the pre-restore head
    // is gone and no transient volume is left behind.
    assert_eq!(lvm.content("custom_web"), "A");
    assert!(!lvm.has_lv("custom_web.pooltmp"));
    assert_eq!(lvm.lv_names(), vec!["custom_web".to_string(), "custom_web-s0".to_string()]);
}

#[test]
fn thin_copy_chains_snapshots_off_the_source() {
    let (driver, lvm, _fs, data_dir) = new_driver(true);

    let web = vol(VolumeType::Custom, ContentType::Filesystem, "web");
    driver.create_volume(&web, None, None).expect("Failed to create volume");

    lvm.set_content("custom_web", "A");
    driver
        .create_volume_snapshot(&web.new_snapshot("s0").unwrap(), None)
        .expect("Failed to create snapshot");
    lvm.set_content("custom_web", "B");

    let copy = vol(VolumeType::Custom, ContentType::Filesystem, "copy");
    driver.create_volume_from_copy(&copy, &web, true, None).expect("Failed to copy volume");

    assert_eq!(lvm.content("custom_copy"), "B");
    assert_eq!(lvm.content("custom_copy-s0"), "A");
    assert!(data_dir.path().join("pools/pool0/custom/copy").is_dir());
    assert!(data_dir.path().join("pools/pool0/custom-snapshots/copy/s0").is_dir());

    // Copying over an existing volume is refused outside of refresh.
    let err = driver.create_volume_from_copy(&copy, &web, false, None).unwrap_err();
    assert!(matches!(err, PoolError::VolumeExists { .. }));
}

#[test]
fn rename_moves_volume_snapshots_and_directories() {
    let (driver, lvm, _fs, data_dir) = new_driver(false);

    let web = vol(VolumeType::Custom, ContentType::Filesystem, "web");
    driver.create_volume(&web, None, None).expect("Failed to create volume");
    for snap in ["s0", "s1"] {
        driver
            .create_volume_snapshot(&web.new_snapshot(snap).unwrap(), None)
            .expect("Failed to create snapshot");
    }

    driver.rename_volume(&web, "site", None).expect("Failed to rename volume");

    assert_eq!(
        lvm.lv_names(),
        vec!["custom_site".to_string(), "custom_site-s0".to_string(), "custom_site-s1".to_string()]
    );
    assert!(data_dir.path().join("pools/pool0/custom/site").is_dir());
    assert!(data_dir.path().join("pools/pool0/custom-snapshots/site/s0").is_dir());
    assert!(!data_dir.path().join("pools/pool0/custom/web").exists());
    assert!(!data_dir.path().join("pools/pool0/custom-snapshots/web").exists());

    // Renaming back returns the original observable state.
    let site = vol(VolumeType::Custom, ContentType::Filesystem, "site");
    driver.rename_volume(&site, "web", None).expect("Failed to rename volume back");
    assert_eq!(
        lvm.lv_names(),
        vec!["custom_web".to_string(), "custom_web-s0".to_string(), "custom_web-s1".to_string()]
    );
    assert_eq!(
        driver.volume_snapshots(&web, None).unwrap(),
        vec!["s0".to_string(), "s1".to_string()]
    );
}

#[test]
fn rename_reverts_snapshot_renames_when_parent_fails() {
    let (driver, lvm, _fs, data_dir) = new_driver(false);

    let web = vol(VolumeType::Custom, ContentType::Filesystem, "web");
    driver.create_volume(&web, None, None).expect("Failed to create volume");
    for snap in ["s0", "s1"] {
        driver
            .create_volume_snapshot(&web.new_snapshot(snap).unwrap(), None)
            .expect("Failed to create snapshot");
    }

    // Parent LV rename fails after the snapshots and directories moved.
    lvm.fail_on("rename:custom_web");
    assert!(driver.rename_volume(&web, "site", None).is_err());

    assert_eq!(
        lvm.lv_names(),
        vec!["custom_web".to_string(), "custom_web-s0".to_string(), "custom_web-s1".to_string()]
    );
    assert!(data_dir.path().join("pools/pool0/custom-snapshots/web").is_dir());
    assert!(!data_dir.path().join("pools/pool0/custom-snapshots/site").exists());
    assert!(data_dir.path().join("pools/pool0/custom/web").is_dir());
}

#[test]
fn quota_below_extent_granularity_is_elided() {
    let (driver, lvm, _fs, _data_dir) = new_driver(false);

    let c1 = vol(VolumeType::Custom, ContentType::Filesystem, "c1");
    driver.create_volume(&c1, None, None).expect("Failed to create volume");

    // Volume sized 18MiB was rounded up to 20MiB (five 4MiB extents).
    lvm.set_size("custom_c1", 20 * 1024 * 1024);

    // 17MiB still needs five extents, so no resize happens.
    driver.set_volume_quota(&c1, "17MiB", None).expect("Quota failed");
    assert!(lvm.resize_calls.lock().unwrap().is_empty());

    // Growing to 24MiB resizes once; repeating the same quota is elided.
    driver.set_volume_quota(&c1, "24MiB", None).expect("Quota failed");
    driver.set_volume_quota(&c1, "24MiB", None).expect("Quota failed");
    {
        let calls = lvm.resize_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], ("custom_c1".to_string(), 24 * 1024 * 1024));
    }

    // Empty and zero quotas are no-ops.
    driver.set_volume_quota(&c1, "", None).expect("Quota failed");
    driver.set_volume_quota(&c1, "0", None).expect("Quota failed");
    assert_eq!(lvm.resize_calls.lock().unwrap().len(), 1);
}

#[test]
fn block_volumes_cannot_shrink() {
    let (driver, lvm, _fs, _data_dir) = new_driver(true);

    let v1 = vol(VolumeType::VirtualMachine, ContentType::Block, "v1");
    driver.create_volume(&v1, None, None).expect("Failed to create VM volume");
    lvm.set_size("virtual-machine_v1.block", 32 * 1024 * 1024);

    let err = driver.set_volume_quota(&v1, "16MiB", None).unwrap_err();
    assert!(matches!(err, PoolError::CannotShrinkBlockVolume));

    driver.set_volume_quota(&v1, "64MiB", None).expect("Failed to grow block volume");
    assert_eq!(lvm.lv_size(Path::new("/dev/vg0/virtual-machine_v1.block")).unwrap(), 64 * 1024 * 1024);
}

#[test]
fn duplicate_uuid_filesystem_snapshot_mounts_via_tmp_volume() {
    let (driver, lvm, fs, data_dir) = new_driver(true);

    let mut web = vol(VolumeType::Custom, ContentType::Filesystem, "web");
    web.config.insert("block.filesystem".to_string(), "xfs".to_string());
    driver.create_volume(&web, None, None).expect("Failed to create volume");

    let s0 = web.new_snapshot("s0").unwrap();
    driver.create_volume_snapshot(&s0, None).expect("Failed to create snapshot");

    assert!(driver.mount_volume_snapshot(&s0, None).unwrap());
    assert!(!driver.mount_volume_snapshot(&s0, None).unwrap());

    // A transient writable snapshot with a fresh UUID backs the mount; the
    // original snapshot is untouched.
    assert!(lvm.has_lv("custom_web-s0.pooltmp"));
    assert!(fs.regenerated("custom_web-s0.pooltmp"));
    assert!(!fs.regenerated("custom_web-s0"));
    {
        let lvs = lvm.lvs.lock().unwrap();
        assert!(lvs["custom_web-s0"].readonly);
        assert!(!lvs["custom_web-s0.pooltmp"].readonly);
    }

    let mount_path = data_dir.path().join("pools/pool0/custom-snapshots/web/s0");
    let (dev, flags) = fs.mount_of(&mount_path).expect("Snapshot not mounted");
    assert_eq!(dev, PathBuf::from("/dev/vg0/custom_web-s0.pooltmp"));
    assert!(flags.contains(MsFlags::MS_RDONLY));

    assert!(driver.unmount_volume_snapshot(&s0, None).unwrap());
    assert!(fs.mount_of(&mount_path).is_none());
    assert!(!lvm.has_lv("custom_web-s0.pooltmp"));
    assert!(lvm.has_lv("custom_web-s0"));

    assert!(!driver.unmount_volume_snapshot(&s0, None).unwrap());
}

#[test]
fn vm_block_snapshot_covers_both_siblings() {
    let (driver, lvm, _fs, _data_dir) = new_driver(true);

    let v1 = vol(VolumeType::VirtualMachine, ContentType::Block, "v1");
    driver.create_volume(&v1, None, None).expect("Failed to create VM volume");

    let s0 = v1.new_snapshot("s0").unwrap();
    driver.create_volume_snapshot(&s0, None).expect("Failed to create snapshot");

    assert!(lvm.has_lv("virtual-machine_v1-s0.block"));
    assert!(lvm.has_lv("virtual-machine_v1-s0"));

    driver.delete_volume_snapshot(&s0, None).expect("Failed to delete snapshot");
    assert!(!lvm.has_lv("virtual-machine_v1-s0.block"));
    assert!(!lvm.has_lv("virtual-machine_v1-s0"));
}

#[test]
fn snapshot_rename_moves_lv_and_mount_path() {
    let (driver, lvm, _fs, data_dir) = new_driver(false);

    let web = vol(VolumeType::Custom, ContentType::Filesystem, "web");
    driver.create_volume(&web, None, None).expect("Failed to create volume");
    let s0 = web.new_snapshot("s0").unwrap();
    driver.create_volume_snapshot(&s0, None).expect("Failed to create snapshot");

    driver.rename_volume_snapshot(&s0, "base", None).expect("Failed to rename snapshot");

    assert!(lvm.has_lv("custom_web-base"));
    assert!(!lvm.has_lv("custom_web-s0"));
    assert!(data_dir.path().join("pools/pool0/custom-snapshots/web/base").is_dir());
    assert!(!data_dir.path().join("pools/pool0/custom-snapshots/web/s0").exists());
    assert_eq!(driver.volume_snapshots(&web, None).unwrap(), vec!["base".to_string()]);
}

#[test]
fn volume_usage_sources() {
    let (driver, _lvm, _fs, _data_dir) = new_driver(true);

    let web = vol(VolumeType::Custom, ContentType::Filesystem, "web");
    driver.create_volume(&web, None, None).expect("Failed to create volume");

    // Unmounted filesystem volume has no usage source.
    assert!(matches!(driver.volume_usage(&web), Err(PoolError::NotSupported)));

    driver.mount_volume(&web, None).expect("Failed to mount volume");
    assert_eq!(driver.volume_usage(&web).unwrap(), 4096);

    // Thin block volumes report their pool allocation.
    let blk = vol(VolumeType::Custom, ContentType::Block, "blk");
    driver.create_volume(&blk, None, None).expect("Failed to create block volume");
    assert_eq!(driver.volume_usage(&blk).unwrap(), 8 * 1024 * 1024);
}

#[test]
fn validation_rejects_bad_config_and_reserved_names() {
    let (driver, _lvm, _fs, _data_dir) = new_driver(true);

    let mut web = vol(VolumeType::Custom, ContentType::Filesystem, "web");
    driver.validate_volume(&mut web, false).expect("Valid config rejected");

    let mut bad_fs = vol(VolumeType::Custom, ContentType::Filesystem, "web");
    bad_fs.config.insert("block.filesystem".to_string(), "vfat".to_string());
    assert!(driver.validate_volume(&mut bad_fs, false).is_err());

    // Stripes are a classic-volume setting; thinpools stripe at pool level.
    let mut striped = vol(VolumeType::Custom, ContentType::Filesystem, "web");
    striped.config.insert("lvm.stripes".to_string(), "2".to_string());
    assert!(driver.validate_volume(&mut striped, false).is_err());

    let mut reserved = vol(VolumeType::Custom, ContentType::Filesystem, "web.pooltmp");
    assert!(driver.validate_volume(&mut reserved, false).is_err());

    let mut unknown = vol(VolumeType::Custom, ContentType::Filesystem, "web");
    unknown.config.insert("zfs.compression".to_string(), "on".to_string());
    assert!(driver.validate_volume(&mut unknown, false).is_err());
    driver.validate_volume(&mut unknown, true).expect("removeUnknownKeys failed");
    assert!(!unknown.config.contains_key("zfs.compression"));
}

#[test]
fn filler_runs_with_volume_mounted() {
    let (driver, _lvm, fs, data_dir) = new_driver(false);

    let c1 = vol(VolumeType::Custom, ContentType::Filesystem, "c1");
    let mount_path = data_dir.path().join("pools/pool0/custom/c1");

    let seen = Mutex::new(Vec::new());
    let mut filler = lvmpool::VolumeFiller {
        fill: Box::new(|path: &Path, dev: Option<&Path>| {
            seen.lock().unwrap().push((path.to_path_buf(), dev.map(Path::to_path_buf)));
            Ok(())
        }),
    };

    driver.create_volume(&c1, Some(&mut filler), None).expect("Failed to create volume");

    {
        let entries = seen.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, mount_path);
        assert!(entries[0].1.is_none());
    }
    // The task unmounted again after filling.
    assert!(fs.mount_of(&mount_path).is_none());
}
