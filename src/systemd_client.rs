use std::{borrow::Cow, io::ErrorKind, process::Stdio, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    process::{ChildStdin, Command},
};
use tracing::debug;

use crate::domain::target::{RecoverAction, RemoteEndpoint, Secret};

pub const SYSTEMCTL: &str = "systemctl";
pub const SUDO: &str = "sudo";
pub const SU: &str = "su";
pub const SSH: &str = "ssh";

/// One external command, executed by argument vector without a local shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Secret>,
    pub timeout: Duration,
}

impl Invocation {
    fn from_argv(argv: Vec<String>, timeout: Duration) -> Self {
        let mut argv = argv.into_iter();
        let program = argv.next().unwrap_or_default();
        Self {
            program,
            args: argv.collect(),
            stdin: None,
            timeout,
        }
    }

    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("`{program}` timed out after {}s", .timeout.as_secs())]
    Timeout { program: String, timeout: Duration },
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error while running `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError>;
}

/// Runs invocations as child processes of this monitor.
#[derive(Debug, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        let program = invocation.program.clone();
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;

        let stdin = child.stdin.take();
        let exchange = async move {
            if let (Some(secret), Some(stdin)) = (invocation.stdin.as_ref(), stdin) {
                match feed_secret(stdin, secret).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                        debug!(program = %invocation.program, "child closed stdin before reading it");
                    }
                    Err(err) => return Err(err),
                }
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(invocation.timeout, exchange)
            .await
            .map_err(|_| CommandError::Timeout {
                program: program.clone(),
                timeout: invocation.timeout,
            })?
            .map_err(|source| CommandError::Io {
                program: program.clone(),
                source,
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Writes the secret line and closes the pipe by dropping it.
async fn feed_secret(mut stdin: ChildStdin, secret: &Secret) -> std::io::Result<()> {
    stdin.write_all(secret.expose().as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

pub fn is_active_argv(service: &str) -> Vec<String> {
    vec![
        SYSTEMCTL.to_string(),
        "is-active".to_string(),
        "--".to_string(),
        service.to_string(),
    ]
}

pub fn action_argv(action: RecoverAction, service: &str) -> Vec<String> {
    vec![
        SYSTEMCTL.to_string(),
        action.as_str().to_string(),
        "--".to_string(),
        service.to_string(),
    ]
}

/// Non-interactive sudo: fails instead of prompting when a password would be needed.
pub fn with_sudo(argv: Vec<String>) -> Vec<String> {
    [SUDO.to_string(), "-n".to_string()]
        .into_iter()
        .chain(argv)
        .collect()
}

pub fn local(argv: Vec<String>, timeout: Duration) -> Invocation {
    Invocation::from_argv(argv, timeout)
}

/// Runs `argv` as `user` through `su`; the secret is fed on stdin.
pub fn switch_user(argv: &[String], user: &str, secret: &Secret, timeout: Duration) -> Invocation {
    Invocation {
        program: SU.to_string(),
        args: vec![
            "-c".to_string(),
            quote_words(argv),
            "--".to_string(),
            user.to_string(),
        ],
        stdin: Some(secret.clone()),
        timeout,
    }
}

/// Wraps `argv` in a batch-mode ssh session. The remote side hands the command
/// string to a shell, so every word is quoted individually.
pub fn over_ssh(remote: &RemoteEndpoint, argv: &[String], timeout: Duration) -> Invocation {
    let connect_timeout = timeout.as_secs().max(1);
    Invocation {
        program: SSH.to_string(),
        args: vec![
            "-p".to_string(),
            remote.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={connect_timeout}"),
            "--".to_string(),
            remote.destination(),
            quote_words(argv),
        ],
        stdin: None,
        timeout,
    }
}

pub fn quote_words(argv: &[String]) -> String {
    argv.iter()
        .map(|word| shell_quote(word))
        .collect::<Vec<_>>()
        .join(" ")
}

/// POSIX shell quoting. Words made only of safe characters pass through;
/// everything else is wrapped in single quotes with embedded quotes escaped.
pub fn shell_quote(word: &str) -> Cow<'_, str> {
    let safe = !word.is_empty()
        && word.chars().all(|character| {
            character.is_ascii_alphanumeric()
                || matches!(character, '-' | '_' | '.' | '/' | '@' | ':' | '=' | '+' | ',')
        });

    if safe {
        Cow::Borrowed(word)
    } else {
        Cow::Owned(format!("'{}'", word.replace('\'', r"'\''")))
    }
}
