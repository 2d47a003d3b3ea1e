//! Gateway to the external programs the coordinator drives.
//!
//! Every call terminates with stdout/stderr on success or one of the typed
//! [`ToolError`] variants. Process creation sits behind [`CommandRunner`] so
//! tests can substitute recorded fakes.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::debug;

use crate::config::EmulatorType;

pub type ToolResult<T> = Result<T, ToolError>;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("required tool '{tool}' not found in PATH")]
    Missing { tool: &'static str },
    #[error("{tool} exited with status {code:?}: {stderr}")]
    NonZeroExit {
        tool: &'static str,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{tool} timed out after {after:?}")]
    Timeout {
        tool: &'static str,
        after: Duration,
    },
    #[error("failed to run {tool}: {source}")]
    Io {
        tool: &'static str,
        source: std::io::Error,
    },
    #[error("{tool} produced unexpected output: {detail}")]
    UnexpectedOutput { tool: &'static str, detail: String },
}

const PERMISSION_MARKERS: [&str; 4] = [
    "Operation not permitted",
    "a password is required",
    "Permission denied",
    "must be root",
];

impl ToolError {
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ToolError::NonZeroExit { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        match self {
            ToolError::NonZeroExit { stderr, .. } => PERMISSION_MARKERS
                .iter()
                .any(|marker| stderr.contains(marker)),
            ToolError::Io { source, .. } => {
                source.kind() == std::io::ErrorKind::PermissionDenied
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolKind {
    Tc,
    Ip,
    Modprobe,
    Adb,
    Ffmpeg,
    Ffprobe,
    Emulator,
    Avdmanager,
    Gmtool,
    Scrcpy,
    Xdotool,
}

impl ToolKind {
    pub const ALL: [ToolKind; 11] = [
        ToolKind::Tc,
        ToolKind::Ip,
        ToolKind::Modprobe,
        ToolKind::Adb,
        ToolKind::Ffmpeg,
        ToolKind::Ffprobe,
        ToolKind::Emulator,
        ToolKind::Avdmanager,
        ToolKind::Gmtool,
        ToolKind::Scrcpy,
        ToolKind::Xdotool,
    ];

    pub fn binary(self) -> &'static str {
        match self {
            ToolKind::Tc => "tc",
            ToolKind::Ip => "ip",
            ToolKind::Modprobe => "modprobe",
            ToolKind::Adb => "adb",
            ToolKind::Ffmpeg => "ffmpeg",
            ToolKind::Ffprobe => "ffprobe",
            ToolKind::Emulator => "emulator",
            ToolKind::Avdmanager => "avdmanager",
            ToolKind::Gmtool => "gmtool",
            ToolKind::Scrcpy => "scrcpy",
            ToolKind::Xdotool => "xdotool",
        }
    }

    /// Kernel-facing tools that run through `sudo -n` when enabled.
    pub fn privileged(self) -> bool {
        matches!(self, ToolKind::Tc | ToolKind::Ip | ToolKind::Modprobe)
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

/// The tool set a run needs for a given device backend.
pub fn required_tools(emulator_type: EmulatorType) -> Vec<ToolKind> {
    let mut tools = vec![
        ToolKind::Tc,
        ToolKind::Ip,
        ToolKind::Modprobe,
        ToolKind::Adb,
        ToolKind::Ffmpeg,
        ToolKind::Ffprobe,
        ToolKind::Xdotool,
    ];
    match emulator_type {
        EmulatorType::Emulator => tools.extend([ToolKind::Emulator, ToolKind::Avdmanager]),
        EmulatorType::Genymotion => tools.push(ToolKind::Gmtool),
        EmulatorType::RealDevice => tools.push(ToolKind::Scrcpy),
        EmulatorType::None => {}
    }
    tools
}

pub fn argv<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A long-running child such as a screen mirror or an emulator instance.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn id(&self) -> Option<u32>;
    async fn stop(&mut self) -> std::io::Result<()>;
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs to completion. A timeout surfaces as `ErrorKind::TimedOut`.
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        limit: Duration,
    ) -> std::io::Result<ProcessOutput>;

    async fn spawn(&self, program: &Path, args: &[String])
        -> std::io::Result<Box<dyn ProcessHandle>>;
}

#[derive(Debug, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        limit: Duration,
    ) -> std::io::Result<ProcessOutput> {
        let mut command = Command::new(program);
        command
            .args(args)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        match timeout(limit, command.output()).await {
            Ok(Ok(output)) => Ok(ProcessOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{} exceeded {limit:?}", program.display()),
            )),
        }
    }

    async fn spawn(
        &self,
        program: &Path,
        args: &[String],
    ) -> std::io::Result<Box<dyn ProcessHandle>> {
        let child = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Box::new(ChildHandle { child }))
    }
}

struct ChildHandle {
    child: Child,
}

#[async_trait]
impl ProcessHandle for ChildHandle {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn stop(&mut self) -> std::io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.child.start_kill()?;
        self.child.wait().await.map(|_| ())
    }
}

/// Resolved tool paths plus the runner that executes them.
pub struct ToolGateway {
    paths: HashMap<ToolKind, PathBuf>,
    sudo: Option<PathBuf>,
    runner: Arc<dyn CommandRunner>,
    default_timeout: Duration,
}

impl fmt::Debug for ToolGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolGateway")
            .field("paths", &self.paths)
            .field("sudo", &self.sudo)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl ToolGateway {
    /// Locates every tool of `required` in `PATH`, failing on the first missing one.
    pub fn locate(required: &[ToolKind], use_sudo: bool) -> ToolResult<Self> {
        let search_path = std::env::var_os("PATH").unwrap_or_default();
        Self::locate_in(
            &search_path,
            required,
            use_sudo,
            Arc::new(SystemCommandRunner),
        )
    }

    pub fn locate_in(
        search_path: &OsStr,
        required: &[ToolKind],
        use_sudo: bool,
        runner: Arc<dyn CommandRunner>,
    ) -> ToolResult<Self> {
        let mut paths = HashMap::new();
        for kind in required {
            let path = find_executable(search_path, kind.binary())
                .ok_or(ToolError::Missing { tool: kind.binary() })?;
            debug!(tool = kind.binary(), path = %path.display(), "located tool");
            paths.insert(*kind, path);
        }
        let sudo = if use_sudo && required.iter().any(|kind| kind.privileged()) {
            Some(find_executable(search_path, "sudo").ok_or(ToolError::Missing { tool: "sudo" })?)
        } else {
            None
        };
        Ok(Self {
            paths,
            sudo,
            runner,
            default_timeout: Duration::from_secs(60),
        })
    }

    /// Resolves every tool by bare name without consulting `PATH`.
    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        let paths = ToolKind::ALL
            .into_iter()
            .map(|kind| (kind, PathBuf::from(kind.binary())))
            .collect();
        Self {
            paths,
            sudo: None,
            runner,
            default_timeout: Duration::from_secs(60),
        }
    }

    pub fn has(&self, kind: ToolKind) -> bool {
        self.paths.contains_key(&kind)
    }

    fn command_line(&self, kind: ToolKind, args: &[String]) -> ToolResult<(PathBuf, Vec<String>)> {
        let path = self
            .paths
            .get(&kind)
            .ok_or(ToolError::Missing { tool: kind.binary() })?;
        match (&self.sudo, kind.privileged()) {
            (Some(sudo), true) => {
                let mut full = vec!["-n".to_string(), path.to_string_lossy().to_string()];
                full.extend(args.iter().cloned());
                Ok((sudo.clone(), full))
            }
            _ => Ok((path.clone(), args.to_vec())),
        }
    }

    pub async fn run(&self, kind: ToolKind, args: &[String]) -> ToolResult<ToolOutput> {
        self.run_with_timeout(kind, args, self.default_timeout).await
    }

    pub async fn run_with_timeout(
        &self,
        kind: ToolKind,
        args: &[String],
        limit: Duration,
    ) -> ToolResult<ToolOutput> {
        let tool = kind.binary();
        let (program, full_args) = self.command_line(kind, args)?;
        debug!(tool, args = %args.join(" "), "running external tool");
        let output = self
            .runner
            .run(&program, &full_args, limit)
            .await
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::NotFound => ToolError::Missing { tool },
                std::io::ErrorKind::TimedOut => ToolError::Timeout { tool, after: limit },
                _ => ToolError::Io { tool, source },
            })?;
        if output.code != Some(0) {
            return Err(ToolError::NonZeroExit {
                tool,
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(ToolOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    pub async fn spawn(
        &self,
        kind: ToolKind,
        args: &[String],
    ) -> ToolResult<Box<dyn ProcessHandle>> {
        let tool = kind.binary();
        let (program, full_args) = self.command_line(kind, args)?;
        debug!(tool, args = %args.join(" "), "spawning external tool");
        self.runner
            .spawn(&program, &full_args)
            .await
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::NotFound => ToolError::Missing { tool },
                _ => ToolError::Io { tool, source },
            })
    }
}

fn find_executable(search_path: &OsStr, name: &str) -> Option<PathBuf> {
    std::env::split_paths(search_path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Calls = Arc<Mutex<Vec<(PathBuf, Vec<String>)>>>;

    struct ScriptedRunner {
        calls: Calls,
        reply: Box<dyn Fn() -> std::io::Result<ProcessOutput> + Send + Sync>,
    }

    struct NoopHandle;

    #[async_trait]
    impl ProcessHandle for NoopHandle {
        fn id(&self) -> Option<u32> {
            None
        }

        async fn stop(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            program: &Path,
            args: &[String],
            _limit: Duration,
        ) -> std::io::Result<ProcessOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_path_buf(), args.to_vec()));
            (self.reply)()
        }

        async fn spawn(
            &self,
            program: &Path,
            args: &[String],
        ) -> std::io::Result<Box<dyn ProcessHandle>> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_path_buf(), args.to_vec()));
            Ok(Box::new(NoopHandle))
        }
    }

    fn scripted<F>(reply: F) -> (ToolGateway, Calls)
    where
        F: Fn() -> std::io::Result<ProcessOutput> + Send + Sync + 'static,
    {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let runner = Arc::new(ScriptedRunner {
            calls: Arc::clone(&calls),
            reply: Box::new(reply),
        });
        (ToolGateway::with_runner(runner), calls)
    }

    #[tokio::test]
    async fn successful_run_returns_output() {
        let (gateway, calls) = scripted(|| {
            Ok(ProcessOutput {
                code: Some(0),
                stdout: "device\n".into(),
                stderr: String::new(),
            })
        });
        let output = gateway
            .run(ToolKind::Adb, &argv(["devices"]))
            .await
            .unwrap();
        assert_eq!(output.stdout, "device\n");
        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].0, PathBuf::from("adb"));
        assert_eq!(calls[0].1, vec!["devices".to_string()]);
    }

    #[tokio::test]
    async fn maps_failures_to_typed_errors() {
        let (gateway, _) = scripted(|| {
            Ok(ProcessOutput {
                code: Some(2),
                stdout: String::new(),
                stderr: "RTNETLINK answers: Operation not permitted\n".into(),
            })
        });
        let err = gateway
            .run(ToolKind::Tc, &argv(["qdisc", "show"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NonZeroExit { code: Some(2), .. }));
        assert!(err.is_permission_denied());

        let (gateway, _) = scripted(|| Err(std::io::ErrorKind::NotFound.into()));
        let err = gateway.run(ToolKind::Ffmpeg, &[]).await.unwrap_err();
        assert!(matches!(err, ToolError::Missing { tool: "ffmpeg" }));

        let (gateway, _) = scripted(|| Err(std::io::ErrorKind::TimedOut.into()));
        let err = gateway
            .run_with_timeout(ToolKind::Ffprobe, &[], Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { tool: "ffprobe", .. }));
    }

    #[cfg(unix)]
    #[test]
    fn locate_fails_fast_on_missing_tool() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        for name in ["tc", "ip", "sudo"] {
            let path = dir.path().join(name);
            std::fs::write(&path, "#!/bin/sh\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let search = std::env::join_paths([dir.path()]).unwrap();

        let found = ToolGateway::locate_in(
            &search,
            &[ToolKind::Tc, ToolKind::Ip],
            true,
            Arc::new(SystemCommandRunner),
        )
        .unwrap();
        assert!(found.has(ToolKind::Tc));
        let (program, args) = found.command_line(ToolKind::Tc, &argv(["qdisc"])).unwrap();
        assert_eq!(program, dir.path().join("sudo"));
        assert_eq!(args[0], "-n");
        assert_eq!(args[2], "qdisc");

        let err = ToolGateway::locate_in(
            &search,
            &[ToolKind::Tc, ToolKind::Adb],
            false,
            Arc::new(SystemCommandRunner),
        )
        .unwrap_err();
        assert!(matches!(err, ToolError::Missing { tool: "adb" }));
    }

    #[test]
    fn backend_controller_is_required() {
        assert!(required_tools(EmulatorType::Genymotion).contains(&ToolKind::Gmtool));
        assert!(required_tools(EmulatorType::RealDevice).contains(&ToolKind::Scrcpy));
        assert!(!required_tools(EmulatorType::None).contains(&ToolKind::Emulator));
    }
}
