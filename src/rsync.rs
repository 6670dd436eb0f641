//! rsync helpers for file-level copy, migration and backup.
//!
//! `local_copy` synchronizes two local trees. The `send_dir`/`recv_dir` pair
//! drives `rsync --server` over an arbitrary byte stream by shuttling the
//! child's stdio through copy threads, which is how volume migration moves a
//! tree across a connection the caller owns.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::anyhow;
use tracing::debug;

use crate::error::{PoolError, Result};
use crate::tools::ToolError;
use crate::volume::Operation;

/// Flags shared by all transfer modes: archive semantics, hard links, ACLs,
/// xattrs, sparse files and stable numeric ownership.
const BASE_ARGS: &[&str] = &["-a", "-HAX", "--sparse", "--devices", "--numeric-ids"];

fn check_cancelled(op: Option<&Operation>) -> Result<()> {
    if op.is_some_and(Operation::is_cancelled) {
        return Err(PoolError::Cancelled);
    }
    Ok(())
}

/// Source path with a trailing slash, so rsync copies contents rather than
/// the directory itself.
fn contents_of(path: &Path) -> String {
    format!("{}/", path.display())
}

/// Synchronize the contents of `src` into `dst`.
///
/// `bwlimit` is passed through to rsync when non-empty. Deletes extraneous
/// files in `dst`, making this usable for both initial copies and refreshes.
pub fn local_copy(src: &Path, dst: &Path, bwlimit: &str, op: Option<&Operation>) -> Result<()> {
    check_cancelled(op)?;

    let mut args: Vec<String> = BASE_ARGS.iter().map(|a| (*a).to_string()).collect();
    args.push("--delete".to_string());
    args.push("--checksum".to_string());
    if !bwlimit.is_empty() {
        args.push(format!("--bwlimit={bwlimit}"));
    }
    args.push(contents_of(src));
    args.push(dst.display().to_string());

    debug!(src = %src.display(), dst = %dst.display(), "Running local rsync");
    let output = Command::new("rsync").args(&args).output().map_err(|e| {
        PoolError::tool(
            format!("Error rsyncing {:?} to {:?}", src, dst),
            ToolError::Spawn { program: "rsync".to_string(), source: e },
        )
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(PoolError::tool(
            format!("Error rsyncing {:?} to {:?}", src, dst),
            ToolError::Failed { program: "rsync".to_string(), stderr },
        ));
    }

    Ok(())
}

/// Send the contents of `src` over a connection, to a peer running
/// [`recv_dir`].
pub fn send_dir<R, W>(
    src: &Path,
    conn_in: R,
    conn_out: W,
    bwlimit: &str,
    op: Option<&Operation>,
) -> Result<()>
where
    R: Read + Send,
    W: Write + Send,
{
    check_cancelled(op)?;

    let mut args: Vec<String> =
        vec!["--server".to_string(), "--sender".to_string(), "-vlogDtpre.iLsfx".to_string()];
    args.extend(BASE_ARGS.iter().skip(1).map(|a| (*a).to_string()));
    if !bwlimit.is_empty() {
        args.push(format!("--bwlimit={bwlimit}"));
    }
    args.push(".".to_string());
    args.push(contents_of(src));

    run_server(&args, conn_in, conn_out, src)
}

/// Receive a tree over a connection into `dst`, from a peer running
/// [`send_dir`].
pub fn recv_dir<R, W>(
    dst: &Path,
    conn_in: R,
    conn_out: W,
    op: Option<&Operation>,
) -> Result<()>
where
    R: Read + Send,
    W: Write + Send,
{
    check_cancelled(op)?;

    let mut args: Vec<String> =
        vec!["--server".to_string(), "-vlogDtpre.iLsfx".to_string(), "--delete".to_string()];
    args.extend(BASE_ARGS.iter().skip(1).map(|a| (*a).to_string()));
    args.push("--partial".to_string());
    args.push(".".to_string());
    args.push(dst.display().to_string());

    run_server(&args, conn_in, conn_out, dst)
}

fn run_server<R, W>(args: &[String], mut conn_in: R, mut conn_out: W, path: &Path) -> Result<()>
where
    R: Read + Send,
    W: Write + Send,
{
    debug!(?args, "Running rsync server");
    let mut child = Command::new("rsync")
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            PoolError::tool(
                format!("Error rsyncing {path:?}"),
                ToolError::Spawn { program: "rsync".to_string(), source: e },
            )
        })?;

    let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("rsync stdin not captured"))?;
    let mut stdout = child.stdout.take().ok_or_else(|| anyhow!("rsync stdout not captured"))?;
    let mut stderr = child.stderr.take().ok_or_else(|| anyhow!("rsync stderr not captured"))?;

    let mut diagnostics = String::new();
    std::thread::scope(|s| {
        // Both copies end when rsync exits: the stdout pipe reports EOF and
        // writes into the closed stdin pipe fail.
        s.spawn(|| {
            let _ = std::io::copy(&mut conn_in, &mut stdin);
        });
        s.spawn(|| {
            let _ = std::io::copy(&mut stdout, &mut conn_out);
        });
        let _ = stderr.read_to_string(&mut diagnostics);
    });

    let status = child.wait().map_err(|e| {
        PoolError::tool(
            format!("Error rsyncing {path:?}"),
            ToolError::Spawn { program: "rsync".to_string(), source: e },
        )
    })?;

    if !status.success() {
        return Err(PoolError::tool(
            format!("Error rsyncing {path:?}"),
            ToolError::Failed { program: "rsync".to_string(), stderr: diagnostics.trim().to_string() },
        ));
    }

    Ok(())
}
