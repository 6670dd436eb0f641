//! Filesystem tool and mount syscall layer.
//!
//! Formatting, growing, shrinking and re-UUIDing go through the per-filesystem
//! utilities; mounting and usage queries go straight to the kernel via `nix`.

use std::path::Path;
use std::process::Command;

use nix::errno::Errno;
use nix::mount::MsFlags;
use tracing::debug;

use super::{FsTools, ToolError};

/// Production [`FsTools`] implementation.
#[derive(Debug, Clone, Default)]
pub struct FsCli;

impl FsCli {
    fn run(&self, program: &str, args: &[&str]) -> Result<(), ToolError> {
        self.run_allowing(program, args, &[0])
    }

    /// Run a tool treating any status in `ok_codes` as success. `e2fsck`
    /// exits 1 after successfully correcting errors.
    fn run_allowing(&self, program: &str, args: &[&str], ok_codes: &[i32]) -> Result<(), ToolError> {
        debug!(program, ?args, "Running filesystem command");
        let output = Command::new(program).args(args).output().map_err(|e| ToolError::Spawn {
            program: program.to_string(),
            source: e,
        })?;

        if !output.status.code().is_some_and(|c| ok_codes.contains(&c)) {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ToolError::Failed { program: program.to_string(), stderr });
        }

        Ok(())
    }
}

fn unsupported(program: &str, fs: &str) -> ToolError {
    ToolError::Failed {
        program: program.to_string(),
        stderr: format!("unsupported filesystem {fs:?}"),
    }
}

fn errno_to_tool_error(program: &str, errno: Errno) -> ToolError {
    match errno {
        Errno::EBUSY => ToolError::Busy,
        Errno::ENOENT | Errno::EINVAL => ToolError::NotFound,
        _ => ToolError::Failed { program: program.to_string(), stderr: errno.desc().to_string() },
    }
}

impl FsTools for FsCli {
    fn mkfs(&self, fs: &str, dev: &Path) -> Result<(), ToolError> {
        let dev = dev.to_string_lossy();
        match fs {
            "ext4" => self.run(
                "mkfs.ext4",
                &["-E", "nodiscard,lazy_itable_init=0,lazy_journal_init=0", &dev],
            ),
            "xfs" => self.run("mkfs.xfs", &["-K", &dev]),
            "btrfs" => self.run("mkfs.btrfs", &["-f", &dev]),
            _ => Err(unsupported("mkfs", fs)),
        }
    }

    fn grow(&self, fs: &str, dev: &Path) -> Result<(), ToolError> {
        let dev = dev.to_string_lossy();
        match fs {
            "ext4" => self.run("resize2fs", &[&dev]),
            _ => Err(unsupported("grow", fs)),
        }
    }

    fn grow_mounted(&self, fs: &str, mount_path: &Path) -> Result<(), ToolError> {
        let mount_path = mount_path.to_string_lossy();
        match fs {
            "xfs" => self.run("xfs_growfs", &[&mount_path]),
            "btrfs" => self.run("btrfs", &["filesystem", "resize", "max", &mount_path]),
            _ => Err(unsupported("grow", fs)),
        }
    }

    fn shrink(&self, fs: &str, dev: &Path, new_size_bytes: u64) -> Result<(), ToolError> {
        let dev = dev.to_string_lossy();
        match fs {
            "ext4" => {
                self.run_allowing("e2fsck", &["-f", "-y", &dev], &[0, 1])?;
                let size = format!("{}K", new_size_bytes / 1024);
                self.run("resize2fs", &[&dev, &size])
            }
            _ => Err(ToolError::Failed {
                program: "shrink".to_string(),
                stderr: format!("filesystem {fs:?} cannot be shrunk"),
            }),
        }
    }

    fn regenerate_uuid(&self, fs: &str, dev: &Path) -> Result<(), ToolError> {
        let dev = dev.to_string_lossy();
        match fs {
            "xfs" => self.run("xfs_admin", &["-U", "generate", &dev]),
            "btrfs" => self.run("btrfstune", &["-f", "-u", &dev]),
            // Other filesystems mount fine with a shared UUID.
            _ => Ok(()),
        }
    }

    fn mount(
        &self,
        dev: &Path,
        target: &Path,
        fs: &str,
        flags: MsFlags,
        options: &str,
    ) -> Result<(), ToolError> {
        let data = if options.is_empty() { None } else { Some(options) };
        nix::mount::mount(Some(dev), target, Some(fs), flags, data)
            .map_err(|e| errno_to_tool_error("mount", e))
    }

    fn unmount(&self, target: &Path) -> Result<(), ToolError> {
        nix::mount::umount(target).map_err(|e| errno_to_tool_error("umount", e))
    }

    fn is_mount_point(&self, path: &Path) -> bool {
        let Ok(stat) = nix::sys::stat::stat(path) else {
            return false;
        };
        let Some(parent) = path.parent() else {
            return true;
        };
        let Ok(parent_stat) = nix::sys::stat::stat(parent) else {
            return false;
        };
        stat.st_dev != parent_stat.st_dev
    }

    fn filesystem_usage(&self, path: &Path) -> Result<u64, ToolError> {
        let stat = nix::sys::statfs::statfs(path)
            .map_err(|e| errno_to_tool_error("statfs", e))?;
        let used_blocks = stat.blocks().saturating_sub(stat.blocks_free());
        Ok(used_blocks.saturating_mul(stat.block_size() as u64))
    }
}
