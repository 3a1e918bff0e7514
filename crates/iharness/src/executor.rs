//! Executor module for running external commands.
//!
//! Key responsibilities:
//! - Spawn commands under a prepared environment (inherited + overlay, or a
//!   full replacement)
//! - Capture stdout, stderr and exit status; a nonzero exit is a normal result
//! - Hand out non-blocking [`CommandHandle`]s for commands that are polled
//!   and terminated while they run
//!
//! The executor holds no state across calls.

use iharness_core::CommandResult;
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Timeout for draining stdout/stderr once a process has ended.
pub(crate) const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 8192;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("empty command")]
    EmptyCommand,
    #[error("could not tokenize command line: {0}")]
    Tokenize(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExecError>;

/// A command to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    /// Explicit argument vector.
    Argv(Vec<String>),
    /// Command line split with shell-aware tokenization, run without a shell.
    Line(String),
    /// Command line run through `sh -c`.
    Shell(String),
}

impl CommandSpec {
    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Argv(args.into_iter().map(Into::into).collect())
    }

    pub fn line(line: impl Into<String>) -> Self {
        Self::Line(line.into())
    }

    pub fn shell(script: impl Into<String>) -> Self {
        Self::Shell(script.into())
    }

    /// Leading token of the command (the program name).
    pub fn program_name(&self) -> Option<String> {
        match self {
            Self::Argv(args) => args.first().cloned(),
            Self::Line(line) | Self::Shell(line) => {
                shlex::split(line).and_then(|tokens| tokens.into_iter().next())
            }
        }
    }

    /// Argument vector that will be executed.
    pub fn to_argv(&self) -> Result<Vec<String>> {
        let argv = match self {
            Self::Argv(args) => args.clone(),
            Self::Line(line) => {
                shlex::split(line).ok_or_else(|| ExecError::Tokenize(line.clone()))?
            }
            Self::Shell(script) => vec!["sh".to_string(), "-c".to_string(), script.clone()],
        };
        if argv.is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        Ok(argv)
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Argv(args) => f.write_str(&args.join(" ")),
            Self::Line(line) | Self::Shell(line) => f.write_str(line),
        }
    }
}

impl From<&str> for CommandSpec {
    fn from(line: &str) -> Self {
        Self::Line(line.to_string())
    }
}

impl From<String> for CommandSpec {
    fn from(line: String) -> Self {
        Self::Line(line)
    }
}

impl From<Vec<String>> for CommandSpec {
    fn from(args: Vec<String>) -> Self {
        Self::Argv(args)
    }
}

impl From<Vec<&str>> for CommandSpec {
    fn from(args: Vec<&str>) -> Self {
        Self::argv(args)
    }
}

impl<const N: usize> From<[&str; N]> for CommandSpec {
    fn from(args: [&str; N]) -> Self {
        Self::argv(args)
    }
}

/// Environment for a spawned command.
///
/// Starts from the current process environment unless a full replacement is
/// given. Overlay variables are layered on top; nothing else is removed.
#[derive(Debug, Clone, Default)]
pub struct CommandEnv {
    replacement: Option<HashMap<String, String>>,
    overlay: BTreeMap<String, String>,
    search_dir: Option<PathBuf>,
    cwd: Option<PathBuf>,
}

impl CommandEnv {
    /// Inherit the current process environment.
    pub fn inherit() -> Self {
        Self::default()
    }

    /// Use exactly `vars` as the base environment.
    pub fn replace<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            replacement: Some(
                vars.into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.overlay.insert(key.into(), value.into());
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Search `dir` for programs before the rest of `PATH`.
    pub fn with_search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_dir = Some(dir.into());
        self
    }

    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Value the child will see for `key`, ignoring `PATH` adjustments.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.overlay.get(key) {
            return Some(value.clone());
        }
        match &self.replacement {
            Some(vars) => vars.get(key).cloned(),
            None => std::env::var(key).ok(),
        }
    }

    fn search_path(&self, dir: &Path) -> OsString {
        let current = self
            .overlay
            .get("PATH")
            .map(OsString::from)
            .or_else(|| match &self.replacement {
                Some(vars) => vars.get("PATH").map(OsString::from),
                None => std::env::var_os("PATH"),
            })
            .unwrap_or_default();
        let mut dirs = vec![dir.to_path_buf()];
        dirs.extend(std::env::split_paths(&current));
        std::env::join_paths(dirs).unwrap_or(current)
    }

    fn apply(&self, cmd: &mut Command) {
        if let Some(vars) = &self.replacement {
            cmd.env_clear();
            cmd.envs(vars);
        }
        cmd.envs(&self.overlay);
        if let Some(dir) = &self.search_dir {
            cmd.env("PATH", self.search_path(dir));
        }
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
    }
}

fn build_command(argv: &[String], env: &CommandEnv) -> Command {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    env.apply(&mut cmd);
    cmd
}

fn spawn_error(program: &str) -> impl FnOnce(std::io::Error) -> ExecError + '_ {
    move |source| ExecError::Spawn {
        program: program.to_string(),
        source,
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Run a command to completion and capture its output.
///
/// Blocks the calling task until the child exits; there is no internal
/// timeout.
pub async fn run(command: &CommandSpec, env: &CommandEnv, stdin: Option<&str>) -> Result<CommandResult> {
    let argv = command.to_argv()?;
    debug!(command = %command, env = "HIDDEN", "running command");

    let mut cmd = build_command(&argv, env);
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(spawn_error(&argv[0]))?;

    let writer = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => {
            let input = input.to_owned();
            Some(tokio::spawn(async move {
                // The child may exit without reading its input.
                if let Err(err) = pipe.write_all(input.as_bytes()).await {
                    debug!(error = %err, "stdin write failed");
                }
            }))
        }
        _ => None,
    };

    let output = child.wait_with_output().await?;
    if let Some(writer) = writer {
        let _ = writer.await;
    }

    let result = CommandResult {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: exit_code(output.status),
    };
    debug!(
        command = %command,
        exit_code = result.exit_code,
        stdout_bytes = result.stdout.len(),
        stderr_bytes = result.stderr.len(),
        "command finished"
    );
    Ok(result)
}

/// Spawn a command without waiting for it.
///
/// The command leads its own process group, so [`CommandHandle::terminate`]
/// reaches everything it started.
pub fn spawn(command: &CommandSpec, env: &CommandEnv) -> Result<CommandHandle> {
    let argv = command.to_argv()?;
    debug!(command = %command, env = "HIDDEN", "spawning command");

    let mut cmd = build_command(&argv, env);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(spawn_error(&argv[0]))?;
    let stdout = pump(child.stdout.take());
    let stderr = pump(child.stderr.take());
    let group = child.id().and_then(|pid| i32::try_from(pid).ok());

    Ok(CommandHandle {
        command: command.clone(),
        child,
        group,
        stdout,
        stderr,
        terminate_requested: false,
        final_state: None,
    })
}

/// Forward everything read from `reader` into a channel.
fn pump<R>(reader: Option<R>) -> mpsc::UnboundedReceiver<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(mut reader) = reader {
        tokio::spawn(async move {
            let mut chunk = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(chunk[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "pipe read failed");
                        break;
                    }
                }
            }
        });
    }
    rx
}

fn drain_available(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
    let mut buf = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        buf.extend_from_slice(&chunk);
    }
    buf
}

async fn drain_to_close(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, buf: &mut Vec<u8>) {
    while let Some(chunk) = rx.recv().await {
        buf.extend_from_slice(&chunk);
    }
}

/// Observable state of a spawned command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exited on its own with this code.
    Exited(i32),
    /// Ended by a signal or after a terminate request.
    Terminated,
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Handle to a running command.
///
/// The command's process group is killed if the handle is dropped while the
/// command is still running.
#[derive(Debug)]
pub struct CommandHandle {
    command: CommandSpec,
    child: Child,
    /// Process group id, equal to the child's pid.
    group: Option<i32>,
    stdout: mpsc::UnboundedReceiver<Vec<u8>>,
    stderr: mpsc::UnboundedReceiver<Vec<u8>>,
    terminate_requested: bool,
    final_state: Option<ProcessState>,
}

impl CommandHandle {
    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Current state, without blocking.
    pub fn poll(&mut self) -> Result<ProcessState> {
        if let Some(state) = self.final_state {
            return Ok(state);
        }
        match self.child.try_wait()? {
            Some(status) => Ok(self.record_exit(status)),
            None => Ok(ProcessState::Running),
        }
    }

    /// Wait up to `timeout` for the command to end.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Result<ProcessState> {
        if let Some(state) = self.final_state {
            return Ok(state);
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => Ok(self.record_exit(status?)),
            Err(_) => Ok(ProcessState::Running),
        }
    }

    pub async fn wait(&mut self) -> Result<ProcessState> {
        if let Some(state) = self.final_state {
            return Ok(state);
        }
        let status = self.child.wait().await?;
        Ok(self.record_exit(status))
    }

    /// Ask the command and everything it started to stop, killing the group
    /// if the command is still running after `grace`.
    ///
    /// Processes left in the group once the command has ended are killed
    /// before this returns.
    pub async fn terminate(&mut self, grace: Duration) -> Result<ProcessState> {
        let state = self.poll()?;
        if !state.is_running() {
            return Ok(state);
        }
        self.terminate_requested = true;
        signal_group(self.group, &mut self.child, StopSignal::Terminate)?;

        let mut state = self.wait_timeout(grace).await?;
        if state.is_running() {
            warn!(
                command = %self.command,
                grace_ms = grace.as_millis() as u64,
                "process ignored terminate; killing"
            );
            signal_group(self.group, &mut self.child, StopSignal::Kill)?;
            let status = self.child.wait().await?;
            state = self.record_exit(status);
        }
        // Stragglers that survived the terminate signal.
        signal_group(self.group, &mut self.child, StopSignal::Kill)?;
        Ok(state)
    }

    /// Stdout bytes received since the last call. Never blocks.
    pub fn try_read_stdout(&mut self) -> Vec<u8> {
        drain_available(&mut self.stdout)
    }

    /// Stderr bytes received since the last call. Never blocks.
    pub fn try_read_stderr(&mut self) -> Vec<u8> {
        drain_available(&mut self.stderr)
    }

    /// Collect whatever output is still buffered or in flight, waiting at
    /// most a few seconds for the pipes to close.
    pub async fn collect_remaining(&mut self) -> (Vec<u8>, Vec<u8>) {
        self.collect_remaining_within(IO_CAPTURE_TIMEOUT).await
    }

    /// Like [`Self::collect_remaining`], but gives up on open pipes after
    /// `limit` and returns what was buffered by then.
    pub async fn collect_remaining_within(&mut self, limit: Duration) -> (Vec<u8>, Vec<u8>) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let drained = tokio::time::timeout(limit, async {
            drain_to_close(&mut self.stdout, &mut stdout).await;
            drain_to_close(&mut self.stderr, &mut stderr).await;
        })
        .await;
        if drained.is_err() {
            warn!(command = %self.command, "output capture timed out");
            stdout.extend(drain_available(&mut self.stdout));
            stderr.extend(drain_available(&mut self.stderr));
        }
        (stdout, stderr)
    }

    fn record_exit(&mut self, status: ExitStatus) -> ProcessState {
        let state = match status.code() {
            Some(code) if !self.terminate_requested => ProcessState::Exited(code),
            _ => ProcessState::Terminated,
        };
        self.final_state = Some(state);
        state
    }
}

impl Drop for CommandHandle {
    fn drop(&mut self) {
        if self.final_state.is_none() {
            if let Err(err) = signal_group(self.group, &mut self.child, StopSignal::Kill) {
                debug!(command = %self.command, error = %err, "could not kill process group on drop");
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StopSignal {
    Terminate,
    Kill,
}

/// Signal every process in `group`. A group that is already gone is not an
/// error.
#[cfg(unix)]
fn signal_group(group: Option<i32>, _child: &mut Child, signal: StopSignal) -> std::io::Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(group) = group else {
        return Ok(());
    };
    let signal = match signal {
        StopSignal::Terminate => Signal::SIGTERM,
        StopSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(group), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(errno) => Err(errno.into()),
    }
}

#[cfg(not(unix))]
fn signal_group(_group: Option<i32>, child: &mut Child, _signal: StopSignal) -> std::io::Result<()> {
    match child.start_kill() {
        Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    #[tokio::test]
    async fn run_captures_output_and_exit_code() {
        let result = run(
            &CommandSpec::shell("echo out; echo err >&2; exit 3"),
            &CommandEnv::inherit(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let err = run(
            &CommandSpec::argv(["definitely-not-a-real-binary-xyz"]),
            &CommandEnv::inherit(),
            None,
        )
        .await
        .unwrap_err();

        match err {
            ExecError::Spawn { program, .. } => {
                assert_eq!(program, "definitely-not-a-real-binary-xyz");
            }
            e => panic!("expected Spawn error, got {e:?}"),
        }
    }

    #[tokio::test]
    async fn stdin_is_fed_to_the_command() {
        let result = run(
            &CommandSpec::argv(["cat"]),
            &CommandEnv::inherit(),
            Some("hello\nworld\n"),
        )
        .await
        .unwrap();
        assert_eq!(result.stdout, "hello\nworld\n");
        assert!(result.success());
    }

    #[tokio::test]
    async fn command_lines_are_split_like_a_shell() {
        let result = run(
            &CommandSpec::line("printf '%s|' 'a b' c"),
            &CommandEnv::inherit(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(result.stdout, "a b|c|");
    }

    #[test]
    fn program_name_uses_shell_tokenization() {
        assert_eq!(
            CommandSpec::line("iput -f 'my file' /zone/home").program_name(),
            Some("iput".to_string())
        );
        assert_eq!(
            CommandSpec::shell("'ils' -l | head").program_name(),
            Some("ils".to_string())
        );
        assert_eq!(
            CommandSpec::argv(["imeta", "ls"]).program_name(),
            Some("imeta".to_string())
        );
        assert_eq!(CommandSpec::line("").program_name(), None);
    }

    #[test]
    fn empty_and_unbalanced_lines_are_rejected() {
        assert!(matches!(
            CommandSpec::line("   ").to_argv(),
            Err(ExecError::EmptyCommand)
        ));
        assert!(matches!(
            CommandSpec::line("ils 'unterminated").to_argv(),
            Err(ExecError::Tokenize(_))
        ));
    }

    #[tokio::test]
    async fn overlay_keeps_inherited_variables() {
        let env = CommandEnv::inherit().with_var("IHARNESS_TEST_VAR", "injected");
        let result = run(
            &CommandSpec::shell(r#"printf '%s|' "$IHARNESS_TEST_VAR"; [ -n "$PATH" ] && printf 'path'"#),
            &env,
            None,
        )
        .await
        .unwrap();
        assert_eq!(result.stdout, "injected|path");
    }

    #[tokio::test]
    async fn replacement_environment_drops_everything_else() {
        let env = CommandEnv::replace([("ONLY", "1")]);
        let result = run(
            &CommandSpec::argv(["/bin/sh", "-c", r#"printf '%s|%s' "${ONLY:-}" "${HOME:-unset}""#]),
            &env,
            None,
        )
        .await
        .unwrap();
        assert_eq!(result.stdout, "1|unset");
    }

    #[tokio::test]
    async fn search_dir_is_tried_first() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("iharness-fake-tool");
        std::fs::write(&script, "#!/bin/sh\necho from-search-dir\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script, perms).unwrap();
        }

        let env = CommandEnv::inherit().with_search_dir(dir.path());
        let result = run(&CommandSpec::argv(["iharness-fake-tool"]), &env, None)
            .await
            .unwrap();
        assert_eq!(result.stdout, "from-search-dir\n");
    }

    #[tokio::test]
    async fn handle_reports_running_then_terminated() {
        let mut handle = spawn(
            &CommandSpec::shell("echo first; sleep 5"),
            &CommandEnv::inherit(),
        )
        .unwrap();
        assert_eq!(handle.poll().unwrap(), ProcessState::Running);

        let deadline = Instant::now() + Duration::from_secs(3);
        let mut seen = Vec::new();
        while !seen.ends_with(b"first\n") && Instant::now() < deadline {
            seen.extend(handle.try_read_stdout());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen, b"first\n");
        assert!(handle.try_read_stdout().is_empty());

        let state = handle.terminate(Duration::from_secs(2)).await.unwrap();
        assert_eq!(state, ProcessState::Terminated);
        assert_eq!(handle.poll().unwrap(), ProcessState::Terminated);
    }

    #[tokio::test]
    async fn handle_reports_normal_exit_code() {
        let mut handle = spawn(&CommandSpec::shell("echo bye >&2; exit 7"), &CommandEnv::inherit())
            .unwrap();
        let state = handle.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(state, ProcessState::Exited(7));

        let (stdout, stderr) = handle.collect_remaining().await;
        assert!(stdout.is_empty());
        assert_eq!(stderr, b"bye\n");
    }

    #[tokio::test]
    async fn wait_timeout_returns_running_for_slow_commands() {
        let mut handle = spawn(&CommandSpec::argv(["sleep", "5"]), &CommandEnv::inherit()).unwrap();
        let state = handle
            .wait_timeout(Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(state, ProcessState::Running);
        handle.terminate(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn terminate_falls_back_to_kill() {
        let mut handle = spawn(
            &CommandSpec::shell("trap '' TERM; sleep 5"),
            &CommandEnv::inherit(),
        )
        .unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        let state = handle.terminate(Duration::from_millis(200)).await.unwrap();

        assert_eq!(state, ProcessState::Terminated);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn terminate_stops_background_children() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("survived");
        let mut handle = spawn(
            &CommandSpec::shell(format!(
                "(sleep 1; touch '{}') & echo started; sleep 6; true",
                marker.display()
            )),
            &CommandEnv::inherit(),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        let state = handle.terminate(Duration::from_millis(200)).await.unwrap();
        let (stdout, _) = handle.collect_remaining().await;

        assert_eq!(state, ProcessState::Terminated);
        assert_eq!(stdout, b"started\n");
        assert!(started.elapsed() < Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_up_front() {
        let err = spawn(
            &CommandSpec::argv(["definitely-not-a-real-binary-xyz"]),
            &CommandEnv::inherit(),
        )
        .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
