use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::ProcessEntry;

pub(super) fn processes() -> Result<Vec<ProcessEntry>> {
    let proc_dir = Path::new("/proc");
    let entries = std::fs::read_dir(proc_dir).context("failed to read /proc")?;

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Processes can exit mid-scan; skip what disappeared.
        if let Some(process) = read_process(&entry.path(), pid) {
            out.push(process);
        }
    }
    Ok(out)
}

fn read_process(dir: &Path, pid: u32) -> Option<ProcessEntry> {
    let stat = std::fs::read_to_string(dir.join("stat")).ok()?;
    let (comm, parent_pid) = parse_stat(&stat)?;

    let executable_path = std::fs::read_link(dir.join("exe")).ok().map(strip_deleted);
    let argv: Vec<String> = std::fs::read(dir.join("cmdline"))
        .map(|raw| {
            raw.split(|b| *b == 0)
                .filter(|part| !part.is_empty())
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect()
        })
        .unwrap_or_default();
    let name = process_name(executable_path.as_deref(), argv.first().map(String::as_str), comm);
    let command_line = (!argv.is_empty()).then(|| argv.join(" "));

    Some(ProcessEntry {
        pid,
        parent_pid: Some(parent_pid).filter(|p| *p != 0),
        name,
        executable_path,
        command_line,
    })
}

/// `exe` is unreadable for other users' processes and `comm` is cut at 15
/// bytes, so argv[0] comes before `comm`.
fn process_name(exe: Option<&Path>, argv0: Option<&str>, comm: String) -> String {
    if let Some(name) = exe.and_then(Path::file_name) {
        return name.to_string_lossy().into_owned();
    }
    argv0
        .and_then(|arg| arg.rsplit(['/', '\\']).next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or(comm)
}

/// `pid (comm) state ppid ...`; comm may itself contain spaces and parentheses.
fn parse_stat(stat: &str) -> Option<(String, u32)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    if close < open {
        return None;
    }
    let comm = stat[open + 1..close].to_string();
    let mut rest = stat[close + 1..].split_whitespace();
    let _state = rest.next()?;
    let ppid = rest.next()?.parse::<u32>().ok()?;
    Some((comm, ppid))
}

fn strip_deleted(path: PathBuf) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_suffix(" (deleted)") {
        Some(stripped) => PathBuf::from(stripped),
        None => path,
    }
}
