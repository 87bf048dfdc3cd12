//! Runs the forwarding program inside the router's context.
//!
//! The program is opaque: it is started detached with both output streams redirected to a log
//! file, and nothing here interprets what it does. Its exit is observable through
//! [`ProcessHandle::poll`], which also notes the exit status in the log.

use std::{
    fmt::{self, Display},
    fs::{File, OpenOptions},
    io::{self, Write as _},
    path::{Path, PathBuf},
    process::{Child, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};

use crate::{
    command::Runner,
    session::Session,
    substrate,
    topology::NodeKind,
};

/// How long [`stop`] waits after `SIGTERM` before sending `SIGKILL`, when used by teardown.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("node {0} is not a realized router")]
    NotARouter(String),
    #[error("empty forwarding command")]
    EmptyCommand,
    #[error("failed to spawn forwarding program: {0}")]
    Substrate(#[from] substrate::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to signal process: {0}")]
    Signal(#[from] Errno),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The forwarding program and its arguments. The program takes no required arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ForwardingCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone()).chain(self.args.iter().cloned()).collect()
    }
}

impl Display for ForwardingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv().join(" "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(ExitStatus),
}

/// A started forwarding program. Owns the child process and knows where its output goes.
#[derive(Debug)]
pub struct ProcessHandle {
    node: String,
    command: ForwardingCommand,
    child: Child,
    log_path: PathBuf,
    exit: Option<ExitStatus>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// The node the program runs in.
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn command(&self) -> &ForwardingCommand {
        &self.command
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Check whether the program has exited, without blocking. The first time an exit is
    /// observed, a line with the exit status is appended to the log.
    pub fn poll(&mut self) -> io::Result<ProcessStatus> {
        if let Some(status) = self.exit {
            return Ok(ProcessStatus::Exited(status));
        }

        match self.child.try_wait()? {
            Some(status) => {
                self.record_exit(status);
                Ok(ProcessStatus::Exited(status))
            }
            None => Ok(ProcessStatus::Running),
        }
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.poll(), Ok(ProcessStatus::Running))
    }

    /// The exit status, once observed.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    fn record_exit(&mut self, status: ExitStatus) {
        self.exit = Some(status);
        tracing::info!(
            pid = self.pid(),
            %status,
            command = %self.command,
            "forwarding process exited"
        );

        let note = format!("forwarding process {} ({}) exited: {status}", self.pid(), self.command);
        append_note(&self.log_path, &note);
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        let pid = Pid::from_raw(self.pid() as i32);
        match signal::kill(pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            // The child may be a privileged wrapper (sudo) we cannot signal directly.
            Err(Errno::EPERM) => {
                let pid = self.pid().to_string();
                let name = sig.as_str().trim_start_matches("SIG");
                Runner::by_args(&["sudo", "-n", "kill", "-s", name, pid.as_str()]).map_err(|e| {
                    Error::Io(io::Error::new(io::ErrorKind::PermissionDenied, e.to_string()))
                })?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Append a `[rlab]` line to the log sink of the forwarding program.
fn append_note(log_path: &Path, note: &str) {
    let appended = OpenOptions::new()
        .append(true)
        .open(log_path)
        .and_then(|mut f| f.write_all(format!("[rlab] {note}\n").as_bytes()));
    if let Err(e) = appended {
        tracing::warn!(?e, log = %log_path.display(), "failed to write note to log");
    }
}

/// Start `command` detached inside `router`'s context, truncating `log_path` and sending both
/// stdout and stderr there. A program that cannot be spawned is noted in the log as well.
pub fn start(
    session: &Session,
    router: &str,
    command: &ForwardingCommand,
    log_path: &Path,
) -> Result<ProcessHandle> {
    match session.node(router) {
        Some(node) if node.kind == NodeKind::Router => {}
        _ => return Err(Error::NotARouter(router.to_string())),
    }
    if command.program.is_empty() {
        return Err(Error::EmptyCommand);
    }

    let log = File::create(log_path)?;
    let stdout = Stdio::from(log.try_clone()?);
    let stderr = Stdio::from(log);

    let child = match session.substrate().spawn(router, &command.argv(), stdout, stderr) {
        Ok(child) => child,
        Err(e) => {
            append_note(log_path, &format!("failed to start {command}: {e}"));
            return Err(e.into());
        }
    };
    tracing::info!(
        pid = child.id(),
        %router,
        %command,
        log = %log_path.display(),
        "started forwarding process"
    );

    Ok(ProcessHandle {
        node: router.to_string(),
        command: command.clone(),
        child,
        log_path: log_path.to_path_buf(),
        exit: None,
    })
}

/// Stop the program: `SIGTERM`, then `SIGKILL` if it is still alive after `grace`. A program
/// that already exited is not an error.
pub fn stop(handle: &mut ProcessHandle, grace: Duration) -> Result<ExitStatus> {
    if let ProcessStatus::Exited(status) = handle.poll()? {
        return Ok(status);
    }

    tracing::debug!(pid = handle.pid(), "sending SIGTERM to forwarding process");
    handle.signal(Signal::SIGTERM)?;

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let ProcessStatus::Exited(status) = handle.poll()? {
            return Ok(status);
        }
        thread::sleep(POLL_INTERVAL);
    }

    tracing::warn!(pid = handle.pid(), ?grace, "forwarding process ignored SIGTERM, killing it");
    handle.signal(Signal::SIGKILL)?;

    let status = handle.child.wait()?;
    handle.record_exit(status);
    Ok(status)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        realize::{realize, RealizeOptions, StopSignal},
        test_util::FakeSubstrate,
        topology::{Addressing, LinkOptions, Topology},
    };

    fn router_session() -> Session {
        let mut topo = Topology::new();
        topo.add_router("r0", Addressing::ip("10.0.1.1/24".parse().unwrap())).unwrap();
        topo.add_host("h1", Addressing::ip("10.0.1.10/24".parse().unwrap())).unwrap();
        topo.add_link("r0", "h1", LinkOptions::default()).unwrap();

        let substrate = Arc::new(FakeSubstrate::new());
        realize(substrate, &topo, &RealizeOptions::default(), &StopSignal::new()).unwrap()
    }

    fn log_file(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rlab-supervisor-{}-{name}.log", std::process::id()))
    }

    #[test]
    fn only_routers_run_the_forwarding_program() {
        let session = router_session();
        let command = ForwardingCommand::new("true");
        let err = start(&session, "h1", &command, &log_file("host")).unwrap_err();
        assert!(matches!(err, Error::NotARouter(n) if n == "h1"));

        let err = start(&session, "r9", &command, &log_file("missing")).unwrap_err();
        assert!(matches!(err, Error::NotARouter(_)));
    }

    #[test]
    fn output_and_exit_go_to_the_log() {
        let session = router_session();
        let log = log_file("exit");
        let cmd =
            ForwardingCommand::new("sh").arg("-c").arg("echo forwarding; echo broken >&2; exit 7");

        let mut handle = start(&session, "r0", &cmd, &log).unwrap();
        let status = loop {
            if let ProcessStatus::Exited(status) = handle.poll().unwrap() {
                break status;
            }
            thread::sleep(POLL_INTERVAL);
        };
        assert_eq!(status.code(), Some(7));
        assert!(!handle.is_running());

        let contents = std::fs::read_to_string(&log).unwrap();
        assert!(contents.contains("forwarding"));
        assert!(contents.contains("broken"));
        assert_eq!(contents.matches("exited").count(), 1);

        let _ = std::fs::remove_file(log);
    }

    #[test]
    fn stop_terminates_a_running_program() {
        let session = router_session();
        let log = log_file("stop");

        let sleeper = ForwardingCommand::new("sleep").arg("30");
        let mut handle = start(&session, "r0", &sleeper, &log).unwrap();
        assert!(handle.is_running());

        let status = stop(&mut handle, Duration::from_secs(5)).unwrap();
        assert!(!status.success());
        // Stopping again is not an error.
        assert_eq!(stop(&mut handle, Duration::ZERO).unwrap(), status);

        let _ = std::fs::remove_file(log);
    }
}
