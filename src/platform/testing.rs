use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::ProcessEntry;
use crate::platform::NodeHost;

/// In-memory node for decision-engine tests.
#[derive(Debug, Default)]
pub(crate) struct FakeHost {
    state: Mutex<FakeState>,
}

#[derive(Debug, Default)]
struct FakeState {
    processes: Vec<ProcessEntry>,
    files: BTreeSet<PathBuf>,
    dirs: BTreeMap<PathBuf, Vec<String>>,
    terminated: Vec<u32>,
    renames: Vec<(PathBuf, PathBuf)>,
    settles: Vec<Duration>,
    fail_process_query: bool,
    fail_terminate: bool,
    fail_rename: Option<std::io::ErrorKind>,
    rename_is_noop: bool,
    process_query_delay: Duration,
}

impl FakeHost {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_process(
        self,
        pid: u32,
        parent_pid: Option<u32>,
        name: &str,
        executable_path: Option<&str>,
    ) -> Self {
        self.lock().processes.push(ProcessEntry {
            pid,
            parent_pid,
            name: name.to_string(),
            executable_path: executable_path.map(PathBuf::from),
            command_line: None,
        });
        self
    }

    pub(crate) fn with_file(self, path: impl Into<PathBuf>) -> Self {
        self.lock().files.insert(path.into());
        self
    }

    pub(crate) fn with_subdirectories(self, dir: impl Into<PathBuf>, names: &[&str]) -> Self {
        self.lock()
            .dirs
            .insert(dir.into(), names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub(crate) fn failing_process_query(self) -> Self {
        self.lock().fail_process_query = true;
        self
    }

    pub(crate) fn failing_terminate(self) -> Self {
        self.lock().fail_terminate = true;
        self
    }

    pub(crate) fn failing_rename(self, kind: std::io::ErrorKind) -> Self {
        self.lock().fail_rename = Some(kind);
        self
    }

    pub(crate) fn rename_without_effect(self) -> Self {
        self.lock().rename_is_noop = true;
        self
    }

    pub(crate) fn slow_process_query(self, delay: Duration) -> Self {
        self.lock().process_query_delay = delay;
        self
    }

    pub(crate) fn terminated(&self) -> Vec<u32> {
        self.lock().terminated.clone()
    }

    pub(crate) fn renames(&self) -> Vec<(PathBuf, PathBuf)> {
        self.lock().renames.clone()
    }

    pub(crate) fn settles(&self) -> Vec<Duration> {
        self.lock().settles.clone()
    }

    pub(crate) fn has_file(&self, path: impl AsRef<Path>) -> bool {
        self.lock().files.contains(path.as_ref())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake host lock")
    }
}

impl NodeHost for FakeHost {
    fn processes(&self) -> Result<Vec<ProcessEntry>> {
        let delay = self.lock().process_query_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let state = self.lock();
        if state.fail_process_query {
            return Err(anyhow!("access denied"));
        }
        Ok(state.processes.clone())
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        let mut state = self.lock();
        if state.fail_terminate {
            return Err(anyhow!("Access is denied."));
        }
        state.terminated.push(pid);
        state.processes.retain(|p| p.pid != pid);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        let state = self.lock();
        state.files.contains(path) || state.dirs.contains_key(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        let mut state = self.lock();
        state.renames.push((from.to_path_buf(), to.to_path_buf()));
        if let Some(kind) = state.fail_rename {
            return Err(std::io::Error::new(kind, "The process cannot access the file"));
        }
        if state.rename_is_noop {
            return Ok(());
        }
        if !state.files.remove(from) {
            return Err(std::io::Error::from(std::io::ErrorKind::NotFound));
        }
        state.files.insert(to.to_path_buf());
        Ok(())
    }

    fn list_subdirectories(&self, dir: &Path) -> Result<Option<Vec<String>>> {
        Ok(self.lock().dirs.get(dir).cloned())
    }

    fn settle(&self, delay: Duration) {
        self.lock().settles.push(delay);
    }
}
