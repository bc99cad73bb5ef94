//! Child process supervision with log relay.
//!
//! The child's stdout and stderr are merged onto one socket. Every line
//! starting with a severity tag (`FATAL:`, `ERROR:`, `WARNING:`, `INFO:`,
//! `DEBUG:`) is relayed at that severity, untagged lines are ignored.
//! A `FATAL:` line or the end of output ends supervision and reaps the child.

use std::{
    ffi::OsStr,
    io::{BufRead, BufReader, ErrorKind},
    os::unix::net::UnixStream,
    process::{Child, Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, warn, Level};
use nix::unistd::Pid;

use crate::{
    lock,
    process::{self, TERMINATE_GRACE},
};

/// Read timeout of the relay. Bounds [ExecRemote::finish] latency
const RELAY_POLL: Duration = Duration::from_millis(100);

/// Severity tag of a child log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildLevel {
    Fatal,
    Error,
    Warning,
    Info,
    Debug,
}

impl ChildLevel {
    const TAGS: [(&'static str, ChildLevel); 5] = [
        ("FATAL:", ChildLevel::Fatal),
        ("ERROR:", ChildLevel::Error),
        ("WARNING:", ChildLevel::Warning),
        ("INFO:", ChildLevel::Info),
        ("DEBUG:", ChildLevel::Debug),
    ];

    pub fn log_level(&self) -> Level {
        match self {
            ChildLevel::Fatal | ChildLevel::Error => Level::Error,
            ChildLevel::Warning => Level::Warn,
            ChildLevel::Info => Level::Info,
            ChildLevel::Debug => Level::Debug,
        }
    }
}

/// Split a tagged line into its severity and text
pub fn parse_log_line(line: &str) -> Option<(ChildLevel, &str)> {
    ChildLevel::TAGS.iter().find_map(|(tag, level)| {
        line.strip_prefix(tag)
            .map(|text| (*level, text.trim()))
    })
}

struct ChildState {
    child: Child,
    exit_code: Option<i32>,
}

impl ChildState {
    /// Non-blocking reap. Returns `true` if the child is gone
    fn reap(&mut self) -> bool {
        if self.exit_code.is_some() {
            return true;
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = Some(exit_code(status));
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Failed to wait for child {}: {e}", self.child.id());
                self.exit_code = Some(-1);
                true
            }
        }
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

/// Supervised child process
pub struct ExecRemote {
    name: String,
    pid: Pid,
    state: Arc<Mutex<ChildState>>,
    stop: Arc<AtomicBool>,
    relay: Option<JoinHandle<()>>,
}

impl ExecRemote {
    /// Launch `program` relaying its tagged output into the `log` facade,
    /// with the program name as the log target
    pub fn spawn<I, S>(program: &str, args: I) -> crate::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let target = program.to_owned();

        Self::spawn_with_sink(program, args, move |level, text| {
            log::log!(target: target.as_str(), level.log_level(), "{text}");
        })
    }

    /// Launch `program` passing every tagged line to `sink`
    pub fn spawn_with_sink<I, S, F>(program: &str, args: I, sink: F) -> crate::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
        F: FnMut(ChildLevel, &str) + Send + 'static,
    {
        let io_error = |e: std::io::Error| crate::Error::SpawnFailed(format!("{program}: {e}"));

        let (output, input) = UnixStream::pair().map_err(io_error)?;
        let stderr = input.try_clone().map_err(io_error)?;

        output
            .set_read_timeout(Some(RELAY_POLL))
            .map_err(io_error)?;

        let child = {
            let mut command = Command::new(program);
            command
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::from(std::os::fd::OwnedFd::from(input)))
                .stderr(Stdio::from(std::os::fd::OwnedFd::from(stderr)));

            // Parent copies of the write end are closed with the command
            command.spawn().map_err(io_error)?
        };

        let pid = Pid::from_raw(i32::try_from(child.id()).map_err(|e| {
            crate::Error::InternalError(format!("Invalid pid {}: {e}", child.id()))
        })?);

        let state = Arc::new(Mutex::new(ChildState {
            child,
            exit_code: None,
        }));
        let stop = Arc::new(AtomicBool::new(false));

        let relay = {
            let name = program.to_owned();
            let state = state.clone();
            let stop = stop.clone();

            thread::Builder::new()
                .name(format!("{program}-relay"))
                .spawn(move || relay(name, pid, output, state, stop, sink))
                .map_err(|e| crate::Error::SpawnFailed(e.to_string()))?
        };

        info!("Spawned `{program}` with pid {pid}");

        Ok(Self {
            name: program.into(),
            pid,
            state,
            stop,
            relay: Some(relay),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_raw().unsigned_abs()
    }

    /// The child is running
    pub fn alive(&self) -> bool {
        !lock(&self.state).reap()
    }

    /// Exit code once the child is reaped. Signals are negative signal numbers
    pub fn exit_code(&self) -> Option<i32> {
        lock(&self.state).exit_code
    }

    /// Terminate the child, reap it and stop the relay
    pub fn finish(&mut self) {
        self.stop.store(true, Ordering::Release);

        let state = self.state.clone();
        process::terminate(self.pid, TERMINATE_GRACE, move || lock(&state).reap());

        if let Some(relay) = self.relay.take() {
            if relay.join().is_err() {
                error!("Relay of `{}` panicked", self.name);
            }
        }

        debug!("`{}` finished with {:?}", self.name, self.exit_code());
    }
}

impl Drop for ExecRemote {
    fn drop(&mut self) {
        self.finish()
    }
}

fn relay<F>(
    name: String,
    pid: Pid,
    output: UnixStream,
    state: Arc<Mutex<ChildState>>,
    stop: Arc<AtomicBool>,
    mut sink: F,
) where
    F: FnMut(ChildLevel, &str),
{
    let mut reader = BufReader::new(output);
    let mut line = Vec::new();
    let mut fatal = false;

    while !stop.load(Ordering::Acquire) {
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => {
                debug!("`{name}` closed its output");
                break;
            }
            Ok(_) => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Failed to read `{name}` output: {e}");
                break;
            }
        }

        // Partial line at EOF
        if line.last() != Some(&b'\n') && !line.is_empty() {
            continue;
        }

        let text = String::from_utf8_lossy(&line);

        if let Some((level, message)) = parse_log_line(text.trim_end()) {
            sink(level, message);
            fatal = level == ChildLevel::Fatal;
        }

        line.clear();

        if fatal {
            warn!("`{name}` reported a fatal error");
            break;
        }
    }

    if let Some((level, message)) = parse_log_line(String::from_utf8_lossy(&line).trim_end()) {
        sink(level, message);
    }

    if stop.load(Ordering::Acquire) {
        return;
    }

    let mut reap = || lock(&state).reap();

    if fatal || !process::wait_reaped(TERMINATE_GRACE, &mut reap) {
        process::terminate(pid, TERMINATE_GRACE, reap);
    }

    debug!("Stopped supervising `{name}`");
}
