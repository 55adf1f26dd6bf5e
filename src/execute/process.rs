//! Launching minion processes and talking to them from the engine.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::ExecutionError;
use super::protocol::{MinionMessage, ParentMessage, ProtocolError, read_frame_async, write_frame_async};
use crate::mutation::DetectionStatus;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const EXIT_GRACE: Duration = Duration::from_secs(5);
const SIGKILL: i32 = 9;

/// What a minion is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinionRole {
    /// Run tests against mutants.
    Mutation,
    /// Run tests under coverage.
    Coverage,
}

impl MinionRole {
    /// CLI subcommand that enters this role.
    pub fn subcommand(self) -> &'static str {
        match self {
            Self::Mutation => "minion",
            Self::Coverage => "coverage-minion",
        }
    }
}

/// Builds the command that starts a minion connecting back to `port`.
pub trait WorkerLauncher: Send + Sync {
    fn command(&self, role: MinionRole, port: u16) -> Command;
}

/// Starts minions by re-executing a `cargo-mutascope` binary.
#[derive(Debug, Clone)]
pub struct SelfExecLauncher {
    program: PathBuf,
    project_dir: PathBuf,
    verbose: bool,
}

impl SelfExecLauncher {
    /// Launch minions from `program`, running tests in `project_dir`.
    pub fn new(program: impl Into<PathBuf>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            project_dir: project_dir.into(),
            verbose: false,
        }
    }

    /// Launch minions from the running executable.
    pub fn current(project_dir: impl Into<PathBuf>) -> Result<Self, ExecutionError> {
        let program = std::env::current_exe().map_err(ExecutionError::Spawn)?;
        Ok(Self::new(program, project_dir))
    }

    /// Pass `--verbose` through to minions.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

impl WorkerLauncher for SelfExecLauncher {
    fn command(&self, role: MinionRole, port: u16) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg(role.subcommand())
            .arg("--port")
            .arg(port.to_string())
            .arg("--project")
            .arg(&self.project_dir);
        if self.verbose {
            command.arg("--verbose");
        }
        command
    }
}

/// A running minion and its connection.
///
/// The minion leads its own process group, so the tests it starts die with
/// it. Dropping it kills the whole group.
pub struct MinionProcess {
    child: Child,
    stream: TcpStream,
    group: Option<u32>,
    killed: bool,
}

impl MinionProcess {
    /// Start a minion and wait for it to connect.
    pub async fn spawn(
        launcher: &dyn WorkerLauncher,
        role: MinionRole,
    ) -> Result<Self, ExecutionError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(ExecutionError::Spawn)?;
        let port = listener.local_addr().map_err(ExecutionError::Spawn)?.port();

        let mut command = launcher.command(role, port);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn().map_err(ExecutionError::Spawn)?;
        let group = child.id();

        let accepted = tokio::select! {
            accepted = tokio::time::timeout(CONNECT_TIMEOUT, listener.accept()) => accepted,
            status = child.wait() => {
                kill_group(group);
                let status = status.map_err(ExecutionError::Spawn)?;
                return Err(ExecutionError::MinionExited(status));
            }
        };
        let stream = match accepted {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(err)) => {
                kill_group(group);
                return Err(ExecutionError::Spawn(err));
            }
            Err(_) => {
                kill_group(group);
                let _ = child.start_kill();
                return Err(ExecutionError::ConnectTimeout(CONNECT_TIMEOUT));
            }
        };
        stream.set_nodelay(true).map_err(ExecutionError::Spawn)?;
        debug!(?role, port, pid = group, "minion connected");

        Ok(Self {
            child,
            stream,
            group,
            killed: false,
        })
    }

    pub async fn send(&mut self, message: &ParentMessage) -> Result<(), ProtocolError> {
        write_frame_async(&mut self.stream, message).await
    }

    /// Next message, or `None` once the minion closed its end.
    pub async fn recv(&mut self) -> Result<Option<MinionMessage>, ProtocolError> {
        read_frame_async(&mut self.stream).await
    }

    /// Hard-kill the process and every test it started, then reap it.
    pub async fn kill(&mut self) {
        self.killed = true;
        kill_group(self.group);
        if let Err(err) = self.child.kill().await {
            warn!(%err, "failed to kill minion");
        }
    }

    /// Wait for the process to exit, killing it if it lingers.
    ///
    /// Tests the minion left running when it died are killed either way.
    pub async fn finish(&mut self) -> Option<ExitStatus> {
        match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                kill_group(self.group);
                Some(status)
            }
            Ok(Err(err)) => {
                warn!(%err, "failed to reap minion");
                kill_group(self.group);
                None
            }
            Err(_) => {
                warn!("minion did not exit after finishing, killing it");
                self.kill().await;
                None
            }
        }
    }

    /// Verdict for the mutant a crashed minion was running.
    pub fn crash_status(&self, status: Option<ExitStatus>) -> DetectionStatus {
        status
            .and_then(|status| classify_exit(status, self.killed))
            .unwrap_or(DetectionStatus::RunError)
    }
}

impl Drop for MinionProcess {
    fn drop(&mut self) {
        kill_group(self.group);
    }
}

/// SIGKILL every process in the group led by `leader`.
fn kill_group(leader: Option<u32>) {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let Some(pgid) = leader.and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!(%err, pgid, "failed to kill minion process group"),
        }
    }
    #[cfg(not(unix))]
    let _ = leader;
}

/// Status implied by a minion's exit. `None` for a clean exit.
///
/// A SIGKILL the engine did not send is taken to be the kernel's
/// out-of-memory killer.
pub fn classify_exit(status: ExitStatus, killed_by_engine: bool) -> Option<DetectionStatus> {
    if status.success() {
        return None;
    }
    if let Some(code) = status.code() {
        return Some(
            super::ExitCode::from_code(code)
                .and_then(super::ExitCode::status)
                .unwrap_or(DetectionStatus::RunError),
        );
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if status.signal() == Some(SIGKILL) && !killed_by_engine {
            return Some(DetectionStatus::MemoryError);
        }
    }
    #[cfg(not(unix))]
    let _ = (killed_by_engine, SIGKILL);
    Some(DetectionStatus::RunError)
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use super::*;

    #[test]
    fn exit_codes_and_signals_classify() {
        assert_eq!(classify_exit(ExitStatus::from_raw(0), false), None);
        assert_eq!(
            classify_exit(ExitStatus::from_raw(11 << 8), false),
            Some(DetectionStatus::MemoryError)
        );
        assert_eq!(
            classify_exit(ExitStatus::from_raw(14 << 8), false),
            Some(DetectionStatus::TimedOut)
        );
        assert_eq!(
            classify_exit(ExitStatus::from_raw(1 << 8), false),
            Some(DetectionStatus::RunError)
        );
        assert_eq!(
            classify_exit(ExitStatus::from_raw(SIGKILL), false),
            Some(DetectionStatus::MemoryError)
        );
        assert_eq!(
            classify_exit(ExitStatus::from_raw(SIGKILL), true),
            Some(DetectionStatus::RunError)
        );
        assert_eq!(
            classify_exit(ExitStatus::from_raw(15), false),
            Some(DetectionStatus::RunError)
        );
    }

    #[test]
    fn self_exec_launcher_builds_minion_command() {
        let launcher = SelfExecLauncher::new("/bin/cargo-mutascope", "/tmp/project").with_verbose(true);
        let command = launcher.command(MinionRole::Coverage, 4242);
        let std_command = command.as_std();
        let args: Vec<String> = std_command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec!["coverage-minion", "--port", "4242", "--project", "/tmp/project", "--verbose"]
        );
    }
}
