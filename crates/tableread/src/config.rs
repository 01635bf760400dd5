//! Supervisor configuration and worker launch description.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// Name of the interpreter used for script-based workers.
#[cfg(windows)]
const PYTHON: &str = "python";
#[cfg(not(windows))]
const PYTHON: &str = "python3";

/// How to launch the render worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Working directory for the child; `None` inherits the host's.
    pub working_dir: Option<PathBuf>,
    /// Path checked for existence before spawning.
    pub entry_point: PathBuf,
    /// Extra environment for the child. `PORT` is always set by the
    /// supervisor after these, so it cannot be overridden here.
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    /// Worker launched directly as an executable.
    pub fn executable(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        Self {
            entry_point: program.clone(),
            program,
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    /// Worker launched as an unbuffered Python script, with the script's
    /// directory as its working directory.
    pub fn python_script(script: impl Into<PathBuf>) -> Self {
        let script = script.into();
        // A bare file name has an empty parent, which is not a usable cwd.
        let working_dir = script
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(PathBuf::from);
        Self {
            program: PathBuf::from(PYTHON),
            args: vec![OsString::from("-u"), script.clone().into_os_string()],
            working_dir,
            entry_point: script,
            env: Vec::new(),
        }
    }

    /// The worker shipped alongside the host binary: `worker/main.py` next to
    /// the executable, independent of where the host was launched from.
    pub fn bundled() -> std::io::Result<Self> {
        let exe = std::env::current_exe()?;
        let install_dir = exe.parent().map(PathBuf::from).unwrap_or_default();
        Ok(Self::python_script(install_dir.join("worker").join("main.py")))
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Tuning for the supervisor's readiness polling and request handling.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub worker: WorkerCommand,
    /// Health probes attempted before `start()` gives up.
    pub readiness_attempts: u32,
    /// Delay between probes; also the per-probe request timeout.
    pub readiness_interval: Duration,
    /// Timeout for pass-through requests. Renders can run long, so this is
    /// deliberately generous; probes do not use it.
    pub request_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new(worker: WorkerCommand) -> Self {
        Self {
            worker,
            readiness_attempts: 10,
            readiness_interval: Duration::from_millis(500),
            request_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_readiness_attempts(mut self, attempts: u32) -> Self {
        self.readiness_attempts = attempts;
        self
    }

    pub fn with_readiness_interval(mut self, interval: Duration) -> Self {
        self.readiness_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
