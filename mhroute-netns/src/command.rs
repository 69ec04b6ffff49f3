//! Utilities for [`tokio::process::Command`].

use std::{fmt, io, process::Stdio};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("empty command provided")]
    Empty,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("`{argv}` returned non-zero status {}: {}", .output.status, .output.stderr.trim())]
    NonZero { argv: Argv, output: Output },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The result of a command that ran to completion, successful or not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    /// The exit code. Processes terminated by a signal report `-1`.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    /// A successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self { status: 0, stdout: stdout.into(), stderr: String::new() }
    }

    /// A failed output with the given exit code and stderr.
    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self { status, stdout: String::new(), stderr: stderr.into() }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turn a non-zero exit into [`Error::NonZero`], keeping the argv for diagnostics.
    pub fn check(self, argv: &Argv) -> Result<Self> {
        if !self.success() {
            return Err(Error::NonZero { argv: argv.clone(), output: self });
        }

        Ok(self)
    }
}

impl From<std::process::Output> for Output {
    fn from(value: std::process::Output) -> Self {
        Self {
            status: value.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

/// An argument vector, printed space-separated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Argv(pub Vec<String>);

impl Argv {
    /// Split a command line on ASCII whitespace. No quoting is supported.
    pub fn from_str_ws(cmd: &str) -> Self {
        Self(cmd.split_ascii_whitespace().map(str::to_owned).collect())
    }

    pub fn push(&mut self, arg: impl Into<String>) -> &mut Self {
        self.0.push(arg.into());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for Argv {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for Argv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// Builds an [`Argv`] from a list of displayable values.
#[macro_export]
macro_rules! argv {
    ($($arg:expr),* $(,)?) => {
        $crate::command::Argv(vec![$($arg.to_string()),*])
    };
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Runner;

impl Runner {
    /// Runs the command provided as a string, separating args with whitespaces.
    pub async fn by_str(cmd: &str) -> Result<Output> {
        Self::run(&Argv::from_str_ws(cmd)).await
    }

    /// Runs the command and returns its output, whatever the exit status. Only a failure to
    /// spawn or wait on the process is an error.
    pub async fn run(argv: &Argv) -> Result<Output> {
        let (program, args) = argv.as_slice().split_first().ok_or(Error::Empty)?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args).stdin(Stdio::null()).stderr(Stdio::piped()).stdout(Stdio::piped());

        tracing::debug!(%argv, "running command");

        let output: Output = cmd.output().await?.into();

        if !output.success() {
            tracing::debug!(?output.stderr, output.status, %argv, "command returned non-zero status");
        }

        Ok(output)
    }

    /// Like [`Runner::run`], but a non-zero exit status is an error.
    pub async fn run_checked(argv: &Argv) -> Result<Output> {
        Self::run(argv).await?.check(argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_display_joins_with_spaces() {
        let argv = argv!["ip", "rule", "add", "from", "11.0.0.2/32", "table", 100];
        assert_eq!(argv.to_string(), "ip rule add from 11.0.0.2/32 table 100");
    }

    #[test]
    fn argv_from_str_ignores_repeated_whitespace() {
        let argv = Argv::from_str_ws("  tc qdisc   show dev\teth0 ");
        assert_eq!(argv.as_slice(), ["tc", "qdisc", "show", "dev", "eth0"]);
    }

    #[test]
    fn check_keeps_argv_and_stderr() {
        let argv = argv!["ip", "route", "add", "default"];
        let err = Output::failed(2, "RTNETLINK answers: File exists\n").check(&argv).unwrap_err();

        match &err {
            Error::NonZero { argv: failed, output } => {
                assert_eq!(failed, &argv);
                assert_eq!(output.status, 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(
            err.to_string(),
            "`ip route add default` returned non-zero status 2: RTNETLINK answers: File exists"
        );
    }

    #[tokio::test]
    async fn runner_rejects_empty_command() {
        assert!(matches!(Runner::run(&Argv::default()).await, Err(Error::Empty)));
    }

    #[tokio::test]
    async fn runner_reports_exit_status() {
        assert!(Runner::by_str("true").await.unwrap().success());

        let output = Runner::run(&argv!["sh", "-c", "echo out; echo err >&2; exit 3"]).await.unwrap();
        assert_eq!(output.status, 3);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }
}
