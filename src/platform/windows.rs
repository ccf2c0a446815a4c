#![cfg_attr(not(windows), allow(dead_code))]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::core::ProcessEntry;
use crate::platform::run_command;

const PROCESS_QUERY: &str = "Get-CimInstance Win32_Process | Select-Object ProcessId,ParentProcessId,Name,ExecutablePath,CommandLine | ConvertTo-Json -Compress";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CimProcess {
    process_id: u32,
    parent_process_id: Option<u32>,
    name: Option<String>,
    executable_path: Option<String>,
    command_line: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CimOutput {
    Many(Vec<CimProcess>),
    One(CimProcess),
}

pub(super) fn processes(timeout: Duration) -> Result<Vec<ProcessEntry>> {
    let output = run_command(
        "powershell",
        &["-NoProfile", "-NonInteractive", "-Command", PROCESS_QUERY],
        timeout,
    )?;
    if output.exit_code != 0 {
        return Err(anyhow!(
            "Get-CimInstance Win32_Process failed (exit_code={}): {}",
            output.exit_code,
            output.first_stderr_line().unwrap_or("")
        ));
    }
    parse_cim_processes(&output.stdout)
}

pub(super) fn terminate(pid: u32, timeout: Duration) -> Result<()> {
    let pid_s = pid.to_string();
    let output = run_command("taskkill", &["/F", "/PID", pid_s.as_str()], timeout)?;
    if output.exit_code != 0 {
        let detail = output
            .first_stderr_line()
            .or_else(|| output.stdout.lines().map(str::trim).find(|l| !l.is_empty()))
            .unwrap_or("");
        return Err(anyhow!(
            "taskkill failed (exit_code={}): {detail}",
            output.exit_code
        ));
    }
    Ok(())
}

fn parse_cim_processes(stdout: &str) -> Result<Vec<ProcessEntry>> {
    let stdout = stdout.trim().trim_start_matches('\u{feff}');
    if stdout.is_empty() {
        return Ok(vec![]);
    }

    let parsed: CimOutput =
        serde_json::from_str(stdout).context("failed to parse Win32_Process JSON")?;
    let items = match parsed {
        CimOutput::Many(items) => items,
        CimOutput::One(item) => vec![item],
    };

    Ok(items
        .into_iter()
        .map(|p| ProcessEntry {
            pid: p.process_id,
            parent_pid: p.parent_process_id.filter(|ppid| *ppid != 0),
            name: p.name.unwrap_or_default(),
            executable_path: p
                .executable_path
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            command_line: p.command_line,
        })
        .collect())
}
