use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use wait_timeout::ChildExt;
use walkdir::WalkDir;

use crate::core::ProcessEntry;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(unix)]
mod ps;
mod windows;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn first_stderr_line(&self) -> Option<&str> {
        self.stderr.lines().map(str::trim).find(|l| !l.is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to start {cmd}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed while waiting for {cmd}: {source}")]
    Wait {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {timeout:?}: {cmd}")]
    Timeout { cmd: String, timeout: Duration },
    #[error("cancelled: {cmd}")]
    Cancelled { cmd: String },
}

/// Shared flag that asks in-flight work to stop. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandRunOptions {
    pub env: Vec<(String, String)>,
    pub cancel: Option<CancelToken>,
}

pub fn run_command(cmd: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput, CommandError> {
    run_command_with_options(cmd, args, timeout, &CommandRunOptions::default())
}

pub fn run_command_with_options(
    cmd: &str,
    args: &[&str],
    timeout: Duration,
    options: &CommandRunOptions,
) -> Result<CommandOutput, CommandError> {
    let mut command = Command::new(cmd);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    for (k, v) in &options.env {
        command.env(k, v);
    }

    let mut child = command.spawn().map_err(|source| CommandError::Spawn {
        cmd: cmd.to_string(),
        source,
    })?;

    // Drain both pipes while waiting so a chatty child cannot block on a full pipe.
    let stdout_reader = drain(child.stdout.take());
    let stderr_reader = drain(child.stderr.take());

    let status = match wait_until(&mut child, timeout, options.cancel.as_ref()) {
        Ok(WaitResult::Exited(status)) => status,
        Ok(WaitResult::TimedOut) => {
            kill_and_reap(&mut child);
            return Err(CommandError::Timeout {
                cmd: cmd.to_string(),
                timeout,
            });
        }
        Ok(WaitResult::Cancelled) => {
            kill_and_reap(&mut child);
            return Err(CommandError::Cancelled {
                cmd: cmd.to_string(),
            });
        }
        Err(source) => {
            kill_and_reap(&mut child);
            return Err(CommandError::Wait {
                cmd: cmd.to_string(),
                source,
            });
        }
    };

    Ok(CommandOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: join_reader(stdout_reader),
        stderr: join_reader(stderr_reader),
    })
}

enum WaitResult {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

fn wait_until(
    child: &mut Child,
    timeout: Duration,
    cancel: Option<&CancelToken>,
) -> std::io::Result<WaitResult> {
    let Some(cancel) = cancel else {
        return Ok(match child.wait_timeout(timeout)? {
            Some(status) => WaitResult::Exited(status),
            None => WaitResult::TimedOut,
        });
    };

    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return Ok(WaitResult::Cancelled);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(WaitResult::TimedOut);
        }
        if let Some(status) = child.wait_timeout(remaining.min(CANCEL_POLL_INTERVAL))? {
            return Ok(WaitResult::Exited(status));
        }
    }
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    let mut pipe = pipe?;
    Some(std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }))
}

fn join_reader(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

pub fn effective_home_dir() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("neither HOME nor USERPROFILE is set"))
}

/// Node names that always refer to the machine running amafix.
pub const LOCAL_ALIASES: [&str; 4] = ["localhost", ".", "127.0.0.1", "::1"];

pub fn host_name() -> Option<String> {
    system_host_name()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
}

/// Case-insensitive; a short name matches a fully qualified one.
pub fn names_this_host(node: &str, host_name: Option<&str>) -> bool {
    let node = node.trim().to_ascii_lowercase();
    if LOCAL_ALIASES.contains(&node.as_str()) {
        return true;
    }
    let Some(host) = host_name else {
        return false;
    };
    let host = host.trim().to_ascii_lowercase();
    if node == host {
        return true;
    }
    let short = |n: &str| n.split('.').next().unwrap_or_default().to_string();
    // Only compare short names when one side is unqualified.
    (!node.contains('.') || !host.contains('.')) && short(&node) == short(&host)
}

#[cfg(unix)]
fn system_host_name() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for writes of buf.len() bytes.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    Some(String::from_utf8_lossy(&buf[..len]).into_owned())
}

#[cfg(windows)]
fn system_host_name() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

#[cfg(not(any(unix, windows)))]
fn system_host_name() -> Option<String> {
    None
}

/// The local OS view the decision engine needs on a node.
pub trait NodeHost {
    fn processes(&self) -> Result<Vec<ProcessEntry>>;

    /// Forcefully terminates `pid`.
    fn terminate(&self, pid: u32) -> Result<()>;

    fn exists(&self, path: &Path) -> bool;

    fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()>;

    /// Immediate subdirectory names of `dir`, or `None` when `dir` is absent.
    fn list_subdirectories(&self, dir: &Path) -> Result<Option<Vec<String>>>;

    fn settle(&self, delay: Duration);
}

#[derive(Debug, Clone)]
pub struct LocalHost {
    command_timeout: Duration,
}

impl LocalHost {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }
}

impl Default for LocalHost {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl NodeHost for LocalHost {
    fn processes(&self) -> Result<Vec<ProcessEntry>> {
        enumerate_processes(self.command_timeout)
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        terminate_process(pid, self.command_timeout)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        std::fs::rename(from, to)
    }

    fn list_subdirectories(&self, dir: &Path) -> Result<Option<Vec<String>>> {
        if !dir.is_dir() {
            return Ok(None);
        }

        let mut names = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry =
                entry.with_context(|| format!("failed to list directory: {}", dir.display()))?;
            if entry.file_type().is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(Some(names))
    }

    fn settle(&self, delay: Duration) {
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

#[cfg(windows)]
fn enumerate_processes(timeout: Duration) -> Result<Vec<ProcessEntry>> {
    windows::processes(timeout)
}

#[cfg(target_os = "linux")]
fn enumerate_processes(_timeout: Duration) -> Result<Vec<ProcessEntry>> {
    linux::processes()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn enumerate_processes(timeout: Duration) -> Result<Vec<ProcessEntry>> {
    ps::processes(timeout)
}

#[cfg(not(any(unix, windows)))]
fn enumerate_processes(_timeout: Duration) -> Result<Vec<ProcessEntry>> {
    Err(anyhow!("process enumeration is not supported on this platform"))
}

#[cfg(windows)]
fn terminate_process(pid: u32, timeout: Duration) -> Result<()> {
    windows::terminate(pid, timeout)
}

#[cfg(unix)]
fn terminate_process(pid: u32, _timeout: Duration) -> Result<()> {
    ps::terminate(pid)
}

#[cfg(not(any(unix, windows)))]
fn terminate_process(pid: u32, _timeout: Duration) -> Result<()> {
    Err(anyhow!(
        "process termination is not supported on this platform (pid {pid})"
    ))
}

#[cfg(test)]
pub(crate) mod testing;

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn run_command_captures_output_and_exit_code() {
        let out = run_command("sh", &["-c", "echo out; echo err >&2; exit 3"], Duration::from_secs(5))
            .expect("run sh");
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.first_stderr_line(), Some("err"));
    }

    #[test]
    fn run_command_kills_on_timeout() {
        let started = Instant::now();
        let err = run_command("sh", &["-c", "sleep 5"], Duration::from_millis(200))
            .expect_err("should time out");
        assert!(matches!(err, CommandError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn run_command_honours_cancellation() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = run_command_with_options(
            "sh",
            &["-c", "sleep 5"],
            Duration::from_secs(10),
            &CommandRunOptions {
                env: vec![],
                cancel: Some(cancel),
            },
        )
        .expect_err("should be cancelled");
        assert!(matches!(err, CommandError::Cancelled { .. }));
    }

    #[test]
    fn run_command_reports_missing_program() {
        let err = run_command("amafix-no-such-program", &[], Duration::from_secs(1))
            .expect_err("should fail to spawn");
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[test]
    fn run_command_does_not_stall_on_large_output() {
        let out = run_command(
            "sh",
            &["-c", "i=0; while [ $i -lt 4000 ]; do echo 0123456789012345678901234567890123456789; i=$((i+1)); done"],
            Duration::from_secs(20),
        )
        .expect("run sh");
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.lines().count(), 4000);
    }

    #[test]
    fn list_subdirectories_reports_absent_root() {
        let host = LocalHost::default();
        let missing = std::env::temp_dir().join(format!("amafix-missing-{}", std::process::id()));
        assert_eq!(host.list_subdirectories(&missing).expect("list"), None);
    }

    #[test]
    fn list_subdirectories_returns_only_directories() {
        let root = std::env::temp_dir().join(format!("amafix-list-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(root.join("1.39.0.0")).unwrap();
        std::fs::create_dir_all(root.join("1.41.0.0")).unwrap();
        std::fs::write(root.join("HandlerManifest.json"), b"{}").unwrap();

        let mut names = LocalHost::default()
            .list_subdirectories(&root)
            .expect("list")
            .expect("present");
        names.sort();
        assert_eq!(names, vec!["1.39.0.0".to_string(), "1.41.0.0".to_string()]);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn local_aliases_and_own_name_match_this_host() {
        assert!(names_this_host("localhost", None));
        assert!(names_this_host("LOCALHOST", None));
        assert!(names_this_host(".", None));
        assert!(names_this_host("HV-NODE-01", Some("hv-node-01")));
        assert!(names_this_host("hv-node-01.corp.example", Some("HV-NODE-01")));
        assert!(names_this_host("hv-node-01", Some("hv-node-01.corp.example")));
    }

    #[test]
    fn other_node_names_do_not_match() {
        assert!(!names_this_host("n2", None));
        assert!(!names_this_host("hv-node-02", Some("hv-node-01")));
        assert!(!names_this_host("hv-node-01.other.example", Some("hv-node-01.corp.example")));
    }

    #[test]
    fn host_name_is_reported() {
        let name = host_name().expect("host name");
        assert!(names_this_host(&name, Some(&name)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn local_processes_include_the_current_process() {
        let entries = LocalHost::default().processes().expect("enumerate");
        let me = std::process::id();
        assert!(entries.iter().any(|e| e.pid == me));
    }
}
