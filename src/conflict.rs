//! Pre-flight local port conflict resolution.
//!
//! Runs before any supervisor starts. A prior moray instance holding a
//! configured port is sent SIGTERM; a foreign process holding one is a
//! fatal startup error. The evicted peer is not waited on; the supervisor
//! retry loop absorbs the window where the socket is still held.

use anyhow::{Context, Result, bail};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::Config;

pub const PROGRAM_NAME: &str = "moray";

pub async fn resolve_conflicts(config: &Config) -> Result<()> {
    let mut ports: Vec<u16> = config
        .clusters
        .iter()
        .flat_map(|cluster| cluster.forwards.iter().map(|forward| forward.local_port))
        .collect();
    ports.sort_unstable();
    ports.dedup();

    for port in ports {
        check_port(port)
            .await
            .with_context(|| format!("failed to resolve port conflict for {port}"))?;
    }

    Ok(())
}

async fn check_port(port: u16) -> Result<()> {
    let Some(pid) = find_listener_pid(port).await else {
        return Ok(());
    };
    if pid == std::process::id() {
        return Ok(());
    }

    let name = process_name(pid).unwrap_or_else(|| "unknown".to_string());
    if !name.contains(PROGRAM_NAME) {
        bail!("port {port} is in use by non-{PROGRAM_NAME} process: {name} (PID: {pid})");
    }

    info!(port, pid, process = %name, "found conflicting instance, sending SIGTERM");
    terminate(pid)?;
    Ok(())
}

/// The PID listening on the port, if any. Tries lsof first, then ss; when
/// neither yields a PID the port is treated as free.
async fn find_listener_pid(port: u16) -> Option<u32> {
    if let Some(pid) = find_with_lsof(port).await {
        return Some(pid);
    }
    find_with_ss(port).await
}

async fn find_with_lsof(port: u16) -> Option<u32> {
    // lsof exits non-zero when nothing matches; that just means free.
    let output = Command::new("lsof")
        .arg(format!("-iTCP:{port}"))
        .args(["-sTCP:LISTEN", "-t"])
        .output()
        .await
        .ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout.lines().next()?.trim().parse().ok()
}

async fn find_with_ss(port: u16) -> Option<u32> {
    let output = Command::new("ss")
        .arg("-ltnp")
        .arg(format!("sport = :{port}"))
        .output()
        .await
        .ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ss_pid(&stdout, port)
}

fn parse_ss_pid(output: &str, port: u16) -> Option<u32> {
    let needle = format!(":{port}");
    for line in output.lines() {
        if !line.contains(&needle) {
            continue;
        }
        let Some(start) = line.find("pid=") else {
            continue;
        };
        let rest = &line[start + 4..];
        let end = rest.find([',', ')']).unwrap_or(rest.len());
        if let Ok(pid) = rest[..end].parse() {
            return Some(pid);
        }
    }
    None
}

fn process_name(pid: u32) -> Option<String> {
    let cmdline = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    binary_name(&cmdline)
}

/// The last path component of the first NUL-separated cmdline argument.
fn binary_name(cmdline: &[u8]) -> Option<String> {
    let first = cmdline.split(|&byte| byte == 0).next()?;
    if first.is_empty() {
        return None;
    }
    let path = String::from_utf8_lossy(first).into_owned();
    Some(
        Path::new(&path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or(path),
    )
}

fn terminate(pid: u32) -> Result<()> {
    // SAFETY: kill(2) with a valid signal constant has no memory-safety
    // concerns; the worst outcome is an errno.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("failed to signal PID {pid}"));
    }
    debug!(pid, "sent SIGTERM");
    Ok(())
}
