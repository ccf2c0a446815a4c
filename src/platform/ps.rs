#![cfg_attr(target_os = "linux", allow(dead_code))]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::ProcessEntry;
use crate::platform::run_command;

pub(super) fn processes(timeout: Duration) -> Result<Vec<ProcessEntry>> {
    let output = run_command("ps", &["-axo", "pid=,ppid=,comm="], timeout)?;
    if output.exit_code != 0 {
        return Err(anyhow!(
            "ps failed (exit_code={}): {}",
            output.exit_code,
            output.first_stderr_line().unwrap_or("")
        ));
    }
    Ok(parse_ps_output(&output.stdout))
}

pub(super) fn terminate(pid: u32) -> Result<()> {
    let pid = libc::pid_t::try_from(pid).map_err(|_| anyhow!("pid out of range: {pid}"))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn parse_ps_output(stdout: &str) -> Vec<ProcessEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse::<u32>().ok()?;
            let ppid = fields.next()?.parse::<u32>().ok()?;
            let comm = fields.collect::<Vec<_>>().join(" ");
            if comm.is_empty() {
                return None;
            }
            let path = Path::new(&comm);
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| comm.clone());
            let executable_path = path.is_absolute().then(|| PathBuf::from(&comm));
            Some(ProcessEntry {
                pid,
                parent_pid: Some(ppid).filter(|p| *p != 0),
                name,
                executable_path,
                command_line: None,
            })
        })
        .collect()
}
