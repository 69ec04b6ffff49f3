//! IP forwarding lifecycle of router nodes.
//!
//! A router forwards packets between its interfaces only while `net.ipv4.ip_forward` is set in
//! its namespace. [`ForwardingController`] is a two-state machine driven by the node's start
//! and stop events:
//!
//! ```text
//!             start (sysctl =1)
//!  Disabled ───────────────────► Enabled
//!     ▲  │ stop: no-op               │ │ start: no-op
//!     │  └──┘                        │ └──┘
//!     └──────────────────────────────┘
//!             stop (sysctl =0)
//! ```
//!
//! A failed write leaves the state where it was.

use std::fmt;

use mhroute_netns::{
    command,
    sysctl::{self, Ip, Protocol},
    NamespaceExec,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ForwardingState {
    #[default]
    Disabled,
    Enabled,
}

impl ForwardingState {
    fn sysctl_value(self) -> &'static str {
        match self {
            Self::Disabled => "0",
            Self::Enabled => "1",
        }
    }
}

impl fmt::Display for ForwardingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::Enabled => f.write_str("enabled"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{node}: setting forwarding {target} failed: {source}")]
pub struct ForwardingToggleError {
    pub node: String,
    pub target: ForwardingState,
    pub source: command::Error,
}

/// Forwarding state of one router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingController {
    node: String,
    state: ForwardingState,
}

impl ForwardingController {
    /// A controller for `node`, assumed to start with forwarding disabled.
    pub fn new(node: impl Into<String>) -> Self {
        Self { node: node.into(), state: ForwardingState::Disabled }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn state(&self) -> ForwardingState {
        self.state
    }

    /// Enables forwarding, if not already enabled.
    pub async fn start(&mut self, exec: &dyn NamespaceExec) -> Result<(), ForwardingToggleError> {
        self.transition(exec, ForwardingState::Enabled).await
    }

    /// Disables forwarding, if not already disabled.
    pub async fn stop(&mut self, exec: &dyn NamespaceExec) -> Result<(), ForwardingToggleError> {
        self.transition(exec, ForwardingState::Disabled).await
    }

    #[tracing::instrument(skip_all, fields(node = %self.node, to = %target))]
    async fn transition(
        &mut self,
        exec: &dyn NamespaceExec,
        target: ForwardingState,
    ) -> Result<(), ForwardingToggleError> {
        if self.state == target {
            tracing::debug!("forwarding already {target}");
            return Ok(());
        }

        let argv = sysctl::write_argv(Ip::Forwarding, Protocol::V4, target.sysctl_value());
        exec.exec_checked(&self.node, &argv).await.map_err(|source| ForwardingToggleError {
            node: self.node.clone(),
            target,
            source,
        })?;

        tracing::info!(from = %self.state, "forwarding {target}");
        self.state = target;
        Ok(())
    }

    /// Reads the node's current forwarding sysctl and adopts it as the controller state.
    ///
    /// Useful when attaching to a namespace that was configured by an earlier run.
    pub async fn sync(&mut self, exec: &dyn NamespaceExec) -> command::Result<ForwardingState> {
        let argv = sysctl::read_argv(Ip::Forwarding, Protocol::V4);
        let output = exec.exec_checked(&self.node, &argv).await?;

        self.state = match output.stdout.trim() {
            "0" => ForwardingState::Disabled,
            _ => ForwardingState::Enabled,
        };
        Ok(self.state)
    }
}
