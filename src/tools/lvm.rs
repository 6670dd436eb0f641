//! LVM command-line tool layer.
//!
//! Shells out to the `lvm2` suite. Query commands use
//! `--noheadings --units b --nosuffix` so output parses as plain byte counts.

use std::path::Path;
use std::process::Command;

use tracing::debug;

use super::{LvmTools, ThinPoolUsage, ToolError};

/// Tools probed for at construction time.
const REQUIRED_TOOLS: &[&str] = &["lvcreate", "lvremove", "lvrename", "lvresize", "lvs", "vgs"];

/// Production [`LvmTools`] implementation backed by the LVM CLI.
#[derive(Debug, Clone, Default)]
pub struct LvmCli;

impl LvmCli {
    /// Probe that the LVM tool suite is installed.
    pub fn detect() -> Result<Self, ToolError> {
        for tool in REQUIRED_TOOLS {
            which::which(tool).map_err(|_| ToolError::Failed {
                program: (*tool).to_string(),
                stderr: "not found in PATH".to_string(),
            })?;
        }
        Ok(Self)
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String, ToolError> {
        debug!(program, ?args, "Running LVM command");
        let output = Command::new(program).args(args).output().map_err(|e| ToolError::Spawn {
            program: program.to_string(),
            source: e,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_failure(program, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Map LVM diagnostics onto the structured error kinds.
fn classify_failure(program: &str, stderr: &str) -> ToolError {
    let lower = stderr.to_lowercase();
    if lower.contains("failed to find") || lower.contains("not found") {
        return ToolError::NotFound;
    }
    if lower.contains("in use") || lower.contains("busy") || lower.contains("open") {
        return ToolError::Busy;
    }
    if lower.contains("already exists") {
        return ToolError::AlreadyExists;
    }
    ToolError::Failed { program: program.to_string(), stderr: stderr.to_string() }
}

fn parse_size_field(program: &str, output: &str) -> Result<u64, ToolError> {
    let field = output.trim();
    field.parse().map_err(|_| ToolError::Failed {
        program: program.to_string(),
        stderr: format!("unparseable size output {field:?}"),
    })
}

fn parse_percent_field(program: &str, field: &str) -> Result<f64, ToolError> {
    field.trim().parse().map_err(|_| ToolError::Failed {
        program: program.to_string(),
        stderr: format!("unparseable percentage output {field:?}"),
    })
}

impl LvmTools for LvmCli {
    fn create_lv(
        &self,
        vg: &str,
        thin_pool: Option<&str>,
        lv_name: &str,
        size_bytes: u64,
        stripes: Option<u32>,
        stripe_size_bytes: Option<u64>,
    ) -> Result<(), ToolError> {
        let size = format!("{size_bytes}b");
        let target;
        let stripes_arg;
        let stripe_size_arg;

        let mut args = vec!["--yes", "--wipesignatures", "y", "--name", lv_name];
        if let Some(pool) = thin_pool {
            target = format!("{vg}/{pool}");
            args.extend(["--virtualsize", &size]);
        } else {
            target = vg.to_string();
            args.extend(["--size", &size]);
            if let Some(count) = stripes {
                stripes_arg = count.to_string();
                args.extend(["--stripes", &stripes_arg]);
            }
            if let Some(bytes) = stripe_size_bytes {
                stripe_size_arg = format!("{bytes}b");
                args.extend(["--stripesize", &stripe_size_arg]);
            }
        }
        args.push(&target);

        self.run("lvcreate", &args)?;
        Ok(())
    }

    fn create_lv_snapshot(
        &self,
        vg: &str,
        src_lv_name: &str,
        snap_lv_name: &str,
        cow_size_bytes: u64,
        readonly: bool,
        thin: bool,
    ) -> Result<(), ToolError> {
        let source = format!("{vg}/{src_lv_name}");
        let size;

        let mut args = vec!["--snapshot", "--name", snap_lv_name];
        if thin {
            // Thin snapshots share the pool; keep them activatable so they
            // can be mounted without extra lvchange calls.
            args.extend(["--setactivationskip", "n"]);
        } else {
            size = format!("{cow_size_bytes}b");
            args.extend(["--size", &size]);
            args.extend(["--permission", if readonly { "r" } else { "rw" }]);
        }
        args.push(&source);

        self.run("lvcreate", &args)?;
        Ok(())
    }

    fn remove_lv(&self, dev_path: &Path) -> Result<(), ToolError> {
        let dev = dev_path.to_string_lossy();
        self.run("lvremove", &["-f", &dev])?;
        Ok(())
    }

    fn rename_lv(&self, vg: &str, old_lv_name: &str, new_lv_name: &str) -> Result<(), ToolError> {
        self.run("lvrename", &[vg, old_lv_name, new_lv_name])?;
        Ok(())
    }

    fn resize_lv(&self, dev_path: &Path, size_bytes: u64) -> Result<(), ToolError> {
        let dev = dev_path.to_string_lossy();
        let size = format!("{size_bytes}b");
        self.run("lvresize", &["-f", "-L", &size, &dev])?;
        Ok(())
    }

    fn lv_exists(&self, dev_path: &Path) -> Result<bool, ToolError> {
        let dev = dev_path.to_string_lossy();
        match self.run("lvs", &["--noheadings", "-o", "lv_name", &dev]) {
            Ok(_) => Ok(true),
            Err(ToolError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn lv_size(&self, dev_path: &Path) -> Result<u64, ToolError> {
        let dev = dev_path.to_string_lossy();
        let output = self.run(
            "lvs",
            &["--noheadings", "--units", "b", "--nosuffix", "-o", "lv_size", &dev],
        )?;
        parse_size_field("lvs", &output)
    }

    fn vg_extent_size(&self, vg: &str) -> Result<u64, ToolError> {
        let output = self.run(
            "vgs",
            &["--noheadings", "--units", "b", "--nosuffix", "-o", "vg_extent_size", vg],
        )?;
        parse_size_field("vgs", &output)
    }

    fn thin_pool_usage(&self, dev_path: &Path) -> Result<ThinPoolUsage, ToolError> {
        let dev = dev_path.to_string_lossy();
        let output = self.run(
            "lvs",
            &[
                "--noheadings",
                "--units",
                "b",
                "--nosuffix",
                "--separator",
                ",",
                "-o",
                "lv_size,data_percent",
                &dev,
            ],
        )?;
        parse_thin_usage(&output)
    }
}

fn parse_thin_usage(output: &str) -> Result<ThinPoolUsage, ToolError> {
    let line = output.trim();
    let (size, percent) = line.split_once(',').ok_or_else(|| ToolError::Failed {
        program: "lvs".to_string(),
        stderr: format!("unparseable thin usage output {line:?}"),
    })?;

    let total_bytes = parse_size_field("lvs", size)?;
    // data_percent is empty for volumes that are not thin.
    let percent = percent.trim();
    if percent.is_empty() {
        return Err(ToolError::Failed {
            program: "lvs".to_string(),
            stderr: "volume has no thin pool allocation data".to_string(),
        });
    }
    let used = (total_bytes as f64 * parse_percent_field("lvs", percent)? / 100.0) as u64;

    Ok(ThinPoolUsage { total_bytes, used_bytes: used })
}
