use std::collections::HashMap;
use std::path::PathBuf;

/// One row of the host's process table, as the platform reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub name: String,
    pub executable_path: Option<PathBuf>,
    pub command_line: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentProcess {
    pub pid: u32,
    pub name: String,
    pub executable_path: Option<PathBuf>,
}

/// A process joined with its parent. `parent` is `None` when the parent
/// exited between enumeration and lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessObservation {
    pub pid: u32,
    pub name: String,
    pub executable_path: Option<PathBuf>,
    pub parent_pid: Option<u32>,
    pub parent: Option<ParentProcess>,
}

impl ProcessObservation {
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn parent_is_named(&self, name: &str) -> bool {
        self.parent
            .as_ref()
            .is_some_and(|p| p.name.eq_ignore_ascii_case(name))
    }
}

pub fn observe(entries: &[ProcessEntry]) -> Vec<ProcessObservation> {
    let by_pid: HashMap<u32, &ProcessEntry> = entries.iter().map(|e| (e.pid, e)).collect();

    entries
        .iter()
        .map(|entry| {
            let parent = entry
                .parent_pid
                .filter(|ppid| *ppid != entry.pid)
                .and_then(|ppid| by_pid.get(&ppid))
                .map(|p| ParentProcess {
                    pid: p.pid,
                    name: p.name.clone(),
                    executable_path: p.executable_path.clone(),
                });
            ProcessObservation {
                pid: entry.pid,
                name: entry.name.clone(),
                executable_path: entry.executable_path.clone(),
                parent_pid: entry.parent_pid,
                parent,
            }
        })
        .collect()
}
