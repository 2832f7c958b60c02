//! Execution wrapper for external programs.
//!
//! Interactive programs inherit the terminal so pass-phrase prompts reach the
//! operator. Captured and silent programs get their output piped and drained
//! on reader threads.

use keydrive_core::error::{KeydriveError, KeydriveResult};
use log::debug;
use std::ffi::{OsStr, OsString};
use std::io::{ErrorKind, Read};
use std::process::{Command, Stdio};
use std::thread;

const SUDO: &str = "sudo";

/// One invocation of an external program.
#[derive(Debug, Clone)]
pub(crate) struct ExternalCommand {
    program: String,
    args: Vec<OsString>,
    capture: bool,
    check: bool,
    silent: bool,
    elevate: bool,
}

/// What a finished program left behind.
#[derive(Debug, Clone, Default)]
pub(crate) struct CommandOutput {
    pub(crate) status: Option<i32>,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
}

impl CommandOutput {
    pub(crate) fn success(&self) -> bool {
        self.status == Some(0)
    }
}

impl ExternalCommand {
    pub(crate) fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            capture: false,
            check: true,
            silent: false,
            elevate: false,
        }
    }

    pub(crate) fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub(crate) fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));
        self
    }

    /// Collect standard output instead of passing it through.
    pub(crate) fn capture(mut self) -> Self {
        self.capture = true;
        self
    }

    /// Report a non-zero exit through [`CommandOutput::status`] instead of an error.
    pub(crate) fn unchecked(mut self) -> Self {
        self.check = false;
        self
    }

    /// Keep the program's chatter off the terminal and out of the info log.
    pub(crate) fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Run through `sudo` when `elevate` is set.
    pub(crate) fn elevated(mut self, elevate: bool) -> Self {
        self.elevate = elevate;
        self
    }

    /// Shell-like rendering used in logs and error messages.
    pub(crate) fn render(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 2);
        if self.elevate {
            words.push(SUDO.to_string());
        }
        words.push(self.program.clone());
        words.extend(self.args.iter().map(|arg| arg.to_string_lossy().into_owned()));
        words.join(" ")
    }

    pub(crate) fn run(&self) -> KeydriveResult<CommandOutput> {
        let rendered = self.render();
        debug!("executing external command: {rendered}");

        let mut command = if self.elevate {
            let mut command = Command::new(SUDO);
            command.arg(&self.program);
            command
        } else {
            Command::new(&self.program)
        };
        command.args(&self.args);
        command.stdin(Stdio::inherit());
        command.stdout(if self.capture || self.silent {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });
        command.stderr(if self.capture || self.silent {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });

        let mut child = command.spawn().map_err(|source| KeydriveError::CommandSpawn {
            program: if self.elevate {
                SUDO.to_string()
            } else {
                self.program.clone()
            },
            source,
        })?;

        let stdout_handle = spawn_output_reader(child.stdout.take());
        let stderr_handle = spawn_output_reader(child.stderr.take());
        let status = child.wait()?;
        let stdout = join_reader(stdout_handle, "stdout")?;
        let stderr = join_reader(stderr_handle, "stderr")?;

        let output = CommandOutput {
            status: status.code(),
            stdout: stdout.trim().to_string(),
            stderr: stderr.trim().to_string(),
        };

        if self.check && !output.success() {
            return Err(KeydriveError::CommandFailed {
                command: rendered,
                status: describe_failure(&status.to_string(), &output),
            });
        }
        Ok(output)
    }
}

fn describe_failure(status: &str, output: &CommandOutput) -> String {
    let diagnostic = if output.stderr.is_empty() {
        output.stdout.as_str()
    } else {
        output.stderr.as_str()
    };
    let lower = diagnostic.to_ascii_lowercase();

    if diagnostic.is_empty() {
        status.to_string()
    } else if lower.contains("permission denied") || lower.contains("operation not permitted") {
        format!("{status}: {diagnostic}; this usually requires root privileges")
    } else {
        format!("{status}: {diagnostic}")
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<std::io::Result<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut reader) = pipe {
            reader.read_to_end(&mut buf)?;
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    })
}

fn join_reader(
    handle: thread::JoinHandle<std::io::Result<String>>,
    stream: &str,
) -> KeydriveResult<String> {
    handle
        .join()
        .map_err(|_| {
            KeydriveError::Io(std::io::Error::new(
                ErrorKind::Other,
                format!("{stream} reader thread panicked"),
            ))
        })?
        .map_err(KeydriveError::from)
}
