//! Running commands inside the network namespace of an emulated node.
//!
//! The emulation substrate owns the namespaces; this module only needs a way to run an argv
//! inside one. [`NamespaceExec`] is that seam. [`NetnsExecutor`] implements it with
//! `ip netns exec`, [`DryRunExecutor`] only logs what would run.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::command::{self, Argv, Output, Runner};

/// Default prefix prepended to a node name to obtain its namespace name.
pub const NAMESPACE_PREFIX: &str = "";

/// Executes an argv inside the network namespace of `node`.
///
/// Implementations return the [`Output`] of any command that ran, including non-zero exits:
/// checking the status is the caller's job. An `Err` means the command could not run at all.
/// Cancellation and timeouts belong to the implementation.
#[async_trait]
pub trait NamespaceExec: Debug + Send + Sync {
    async fn exec(&self, node: &str, argv: &Argv) -> command::Result<Output>;

    /// Like [`NamespaceExec::exec`], but a non-zero exit status is an error.
    async fn exec_checked(&self, node: &str, argv: &Argv) -> command::Result<Output> {
        self.exec(node, argv).await?.check(argv)
    }
}

/// Return the `ip netns exec <namespace>` prefix used to run other commands.
pub fn prefix_command(namespace: &str, sudo: bool) -> Argv {
    let mut argv = Argv::default();
    if sudo {
        argv.push("sudo");
    }
    argv.args(["ip", "netns", "exec", namespace]);
    argv
}

/// Runs commands with `ip netns exec`, mapping node `n` to namespace `{prefix}{n}`.
#[derive(Debug, Clone)]
pub struct NetnsExecutor {
    namespace_prefix: String,
    sudo: bool,
}

impl Default for NetnsExecutor {
    fn default() -> Self {
        Self { namespace_prefix: NAMESPACE_PREFIX.to_owned(), sudo: true }
    }
}

impl NetnsExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether to prefix commands with `sudo`. Enabled by default.
    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    /// Set the prefix used to derive namespace names from node names.
    pub fn with_namespace_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.namespace_prefix = prefix.into();
        self
    }

    /// The namespace name for the given node.
    ///
    /// NOTE: a namespace name can be at most 255 bytes long.
    pub fn namespace_name(&self, node: &str) -> String {
        format!("{}{node}", self.namespace_prefix)
    }

    /// The full argv that runs `argv` inside the namespace of `node`.
    pub fn wrap(&self, node: &str, argv: &Argv) -> Argv {
        let mut full = prefix_command(&self.namespace_name(node), self.sudo);
        full.args(argv.as_slice().iter().cloned());
        full
    }
}

#[async_trait]
impl NamespaceExec for NetnsExecutor {
    async fn exec(&self, node: &str, argv: &Argv) -> command::Result<Output> {
        if argv.is_empty() {
            return Err(command::Error::Empty);
        }

        Runner::run(&self.wrap(node, argv)).await
    }
}

/// Logs every command and reports success without running anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunExecutor;

#[async_trait]
impl NamespaceExec for DryRunExecutor {
    async fn exec(&self, node: &str, argv: &Argv) -> command::Result<Output> {
        if argv.is_empty() {
            return Err(command::Error::Empty);
        }

        tracing::info!(node, %argv, "dry run");
        Ok(Output::ok(""))
    }
}
