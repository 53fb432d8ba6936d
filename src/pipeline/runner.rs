//! External tool invocation.
//!
//! Tools are always started from an argument vector, never a shell string.
//! [`ProcessRunner`] streams the child's stdout/stderr into `tracing` events,
//! keeps the last lines for error reports, enforces an optional timeout and
//! honours a [`CancelFlag`] set from Ctrl-C.

use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::AutotrackError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_TAIL_LINES: usize = 40;

/// A program plus its arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Short tool name for logs and errors (`colmap`, `ffmpeg`, ...).
    pub fn tool_name(&self) -> String {
        tool_name(&self.program)
    }

    /// Value following `flag`, if present.
    pub fn flag_value(&self, flag: &str) -> Option<&OsStr> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|idx| self.args.get(idx + 1))
            .map(OsString::as_os_str)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{arg}\"")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

fn tool_name(program: &Path) -> String {
    program
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string())
}

/// What a successful run produced.
#[derive(Clone, Debug, Default)]
pub struct ToolOutput {
    /// Lines read from stdout and stderr.
    pub lines: usize,
    /// Last lines of output, oldest first.
    pub tail: String,
    pub elapsed: Duration,
}

/// Runs external tools on behalf of the pipeline.
pub trait ToolRunner {
    /// Run to completion. A nonzero exit is `CollaboratorExit`, a program
    /// that cannot be started is `MissingCollaborator`.
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput, AutotrackError>;

    /// Check that `program` can be started, without running it.
    fn probe(&self, program: &Path) -> Result<(), AutotrackError>;
}

/// Shared cancellation request, set from a Ctrl-C handler.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Route Ctrl-C (and SIGTERM) to this flag. Can only be installed once
    /// per process.
    pub fn install_ctrlc(&self) -> Result<(), AutotrackError> {
        ctrlc::set_handler({
            let flag = self.clone();
            move || {
                tracing::warn!("interrupt received; terminating the running tool");
                flag.cancel();
            }
        })
        .map_err(|err| AutotrackError::Io(std::io::Error::other(err)))
    }
}

/// Bounded buffer of the most recent output lines.
#[derive(Debug)]
struct TailBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    total: usize,
}

impl TailBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
        }
    }

    fn push(&mut self, line: String) {
        self.total += 1;
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn joined(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Runs tools as child processes.
#[derive(Clone, Debug)]
pub struct ProcessRunner {
    pub timeout: Option<Duration>,
    pub cancel: CancelFlag,
    pub tail_lines: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            timeout: None,
            cancel: CancelFlag::new(),
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }
}

enum Finish {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

impl ProcessRunner {
    pub fn new(timeout: Option<Duration>, cancel: CancelFlag) -> Self {
        Self {
            timeout,
            cancel,
            ..Self::default()
        }
    }

    fn wait(&self, child: &mut Child, started: Instant) -> std::io::Result<Finish> {
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Finish::Exited(status));
            }
            if self.cancel.is_cancelled() {
                kill(child);
                return Ok(Finish::Cancelled);
            }
            if self.timeout.is_some_and(|limit| started.elapsed() >= limit) {
                kill(child);
                return Ok(Finish::TimedOut);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Kill the child and everything it started, then reap it.
fn kill(child: &mut Child) {
    kill_process_group(child);
    if let Err(err) = child.kill() {
        tracing::debug!(error = %err, "kill failed; process already exited");
    }
    if let Err(err) = child.wait() {
        tracing::debug!(error = %err, "could not reap the killed process");
    }
}

/// The child leads its own process group (see [`ToolRunner::run`]), so
/// helpers it forked are killed with it.
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers; a negative pid addresses the group.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
        tracing::debug!(
            error = %std::io::Error::last_os_error(),
            "process group kill failed; group already exited"
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

/// Drain one stream line by line. `\r`-separated progress updates count as
/// separate lines.
fn spawn_reader<R>(
    stream: R,
    tool: String,
    stream_name: &'static str,
    tail: Arc<Mutex<TailBuffer>>,
) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let text = String::from_utf8_lossy(&buf);
            for line in text.split(['\r', '\n']).map(str::trim_end) {
                if line.is_empty() {
                    continue;
                }
                tracing::debug!(tool = %tool, stream = stream_name, "{line}");
                tail.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(line.to_string());
            }
        }
    })
}

impl ToolRunner for ProcessRunner {
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput, AutotrackError> {
        let tool = invocation.tool_name();
        tracing::debug!(command = %invocation, "starting tool");

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => AutotrackError::MissingCollaborator {
                    program: tool.clone(),
                    hint: format!("{} could not be started", invocation.program.display()),
                },
                _ => AutotrackError::Io(err),
            })?;

        let tail = Arc::new(Mutex::new(TailBuffer::new(self.tail_lines)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, tool.clone(), "stdout", tail.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, tool.clone(), "stderr", tail.clone()));
        }

        let started = Instant::now();
        let finish = self.wait(&mut child, started)?;
        if matches!(finish, Finish::Exited(_)) {
            for reader in readers {
                if reader.join().is_err() {
                    tracing::debug!(tool = %tool, "output reader panicked");
                }
            }
        } else {
            // A process that escaped the group may still hold the pipes open;
            // the readers finish on their own once it exits.
            drop(readers);
        }

        let (lines, diagnostic) = {
            let tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
            (tail.total, tail.joined())
        };

        match finish {
            Finish::Exited(status) if status.success() => Ok(ToolOutput {
                lines,
                tail: diagnostic,
                elapsed: started.elapsed(),
            }),
            Finish::Exited(status) => Err(AutotrackError::CollaboratorExit {
                program: tool,
                status: status.to_string(),
                diagnostic,
            }),
            Finish::TimedOut => Err(AutotrackError::CollaboratorTimeout {
                program: tool,
                timeout: self.timeout.unwrap_or_default(),
                diagnostic,
            }),
            Finish::Cancelled => Err(AutotrackError::Cancelled { program: tool }),
        }
    }

    fn probe(&self, program: &Path) -> Result<(), AutotrackError> {
        match find_program(program) {
            Some(found) => {
                tracing::debug!(program = %found.display(), "found tool");
                Ok(())
            }
            None => Err(AutotrackError::MissingCollaborator {
                program: tool_name(program),
                hint: if program.components().count() > 1 {
                    format!("{} does not exist", program.display())
                } else {
                    "not found on PATH".to_string()
                },
            }),
        }
    }
}

/// Resolve a program the way the OS would: explicit paths are checked
/// directly, bare names are searched on `PATH`.
pub fn find_program(program: &Path) -> Option<PathBuf> {
    let candidates = |base: PathBuf| {
        let mut out = vec![base.clone()];
        if cfg!(windows) && base.extension().is_none() {
            out.push(base.with_extension("exe"));
        }
        out
    };

    if program.components().count() > 1 {
        return candidates(program.to_path_buf())
            .into_iter()
            .find(|p| p.is_file());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .flat_map(|dir| candidates(dir.join(program)))
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_display_quotes_spaces() {
        let inv = Invocation::new("colmap")
            .arg("feature_extractor")
            .args(["--image_path", "/data/my clip/images"]);
        assert_eq!(
            inv.to_string(),
            "colmap feature_extractor --image_path \"/data/my clip/images\""
        );
        assert_eq!(
            inv.flag_value("--image_path"),
            Some(OsStr::new("/data/my clip/images"))
        );
    }

    #[test]
    fn tail_buffer_keeps_last_lines() {
        let mut tail = TailBuffer::new(2);
        for line in ["a", "b", "c"] {
            tail.push(line.to_string());
        }
        assert_eq!(tail.joined(), "b\nc");
        assert_eq!(tail.total, 3);
    }

    #[test]
    fn tool_name_drops_directory_and_extension() {
        let inv = Invocation::new("/opt/hfs/bin/hython.exe");
        assert_eq!(inv.tool_name(), "hython");
    }

    #[test]
    fn missing_program_is_reported() {
        let runner = ProcessRunner::default();
        let err = runner
            .probe(Path::new("definitely-not-a-real-tool-autotrack"))
            .unwrap_err();
        assert!(matches!(err, AutotrackError::MissingCollaborator { .. }));

        let err = runner
            .run(&Invocation::new("definitely-not-a-real-tool-autotrack"))
            .unwrap_err();
        assert!(matches!(err, AutotrackError::MissingCollaborator { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_carries_output_tail() {
        let runner = ProcessRunner::default();
        let inv = Invocation::new("sh").args(["-c", "echo first; echo oops >&2; exit 3"]);
        let err = runner.run(&inv).unwrap_err();
        match err {
            AutotrackError::CollaboratorExit {
                program,
                diagnostic,
                ..
            } => {
                assert_eq!(program, "sh");
                assert!(diagnostic.contains("oops"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_the_child() {
        let runner = ProcessRunner::new(Some(Duration::from_millis(200)), CancelFlag::new());
        let err = runner
            .run(&Invocation::new("sh").args(["-c", "sleep 5"]))
            .unwrap_err();
        assert!(matches!(err, AutotrackError::CollaboratorTimeout { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn timeout_is_enforced_when_the_tool_forks() {
        let runner = ProcessRunner::new(Some(Duration::from_millis(300)), CancelFlag::new());
        let started = Instant::now();
        let err = runner
            .run(&Invocation::new("sh").args(["-c", "sleep 4 & sleep 4"]))
            .unwrap_err();
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_secs(2), "returned after {elapsed:?}");
        match err {
            AutotrackError::CollaboratorTimeout { timeout, .. } => {
                assert_eq!(timeout, Duration::from_millis(300));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn cancel_is_enforced_when_the_tool_forks() {
        let cancel = CancelFlag::new();
        let runner = ProcessRunner::new(None, cancel.clone());
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            cancel.cancel();
        });
        let started = Instant::now();
        let err = runner
            .run(&Invocation::new("sh").args(["-c", "sleep 4 & sleep 4"]))
            .unwrap_err();
        trigger.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(err, AutotrackError::Cancelled { .. }));
    }

    #[test]
    fn sub_second_timeout_is_reported_exactly() {
        let err = AutotrackError::CollaboratorTimeout {
            program: "glomap".to_string(),
            timeout: Duration::from_millis(300),
            diagnostic: String::new(),
        };
        assert_eq!(
            err.to_string(),
            "'glomap' did not finish within 300ms and was terminated"
        );
    }

    #[cfg(unix)]
    #[test]
    fn cancelled_flag_stops_the_child() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let runner = ProcessRunner::new(None, cancel);
        let err = runner
            .run(&Invocation::new("sh").args(["-c", "sleep 5"]))
            .unwrap_err();
        assert!(matches!(err, AutotrackError::Cancelled { .. }));
    }
}
