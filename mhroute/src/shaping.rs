//! Egress traffic shaping with `netem`.
//!
//! Every shaped interface carries exactly one root qdisc. Installing a policy always goes
//! through `tc qdisc replace`, so shaping an interface twice leaves only the second policy:
//! stacking a second rate limiter under the first would silently halve the emulated bandwidth.

use std::time::Duration;

use mhroute_netns::{
    argv,
    command::{self, Argv},
    NamespaceExec,
};

use crate::topology::{Endpoint, Link, Topology};

#[derive(Debug, thiserror::Error)]
pub enum ShapingError {
    #[error("{0} does not exist")]
    UnknownInterface(Endpoint),
    #[error("{0}: rate must be positive")]
    InvalidRate(Endpoint),
    #[error("shaping {endpoint} failed: {source}")]
    Command {
        endpoint: Endpoint,
        #[source]
        source: command::Error,
    },
}

pub type Result<T> = std::result::Result<T, ShapingError>;

/// A rate limit, with an optional added delay, applied to an interface's egress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapingPolicy {
    pub rate_kbit: u64,
    pub latency: Option<Duration>,
}

impl ShapingPolicy {
    pub fn new(rate_kbit: u64) -> Self {
        Self { rate_kbit, latency: None }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// The shaping policy a link declares, if it declares a bandwidth.
    pub fn for_link(link: &Link) -> Option<Self> {
        link.bandwidth_kbit.map(|rate_kbit| Self { rate_kbit, latency: link.latency() })
    }

    /// The `tc` command installing this policy as the root qdisc of `interface`.
    pub fn replace_argv(&self, interface: &str) -> Argv {
        let mut argv = argv![
            "tc", "qdisc", "replace", "dev", interface, "root", "netem", "rate", format!("{}kbit", self.rate_kbit)
        ];
        if let Some(delay) = self.latency.filter(|d| !d.is_zero()) {
            argv.args(["delay".to_owned(), format_delay(delay)]);
        }
        argv
    }
}

/// `tc` time syntax. Whole milliseconds are printed as such, anything finer in microseconds,
/// rounded up so a non-zero delay never renders as zero.
fn format_delay(delay: Duration) -> String {
    if delay.subsec_nanos() % 1_000_000 == 0 {
        format!("{}ms", delay.as_millis())
    } else {
        format!("{}us", delay.as_nanos().div_ceil(1_000))
    }
}

/// Installs shaping policies on the interfaces of a topology.
#[derive(Debug, Clone, Copy)]
pub struct Shaper<'a> {
    exec: &'a dyn NamespaceExec,
    topology: &'a Topology,
}

impl<'a> Shaper<'a> {
    pub fn new(exec: &'a dyn NamespaceExec, topology: &'a Topology) -> Self {
        Self { exec, topology }
    }

    /// Installs `policy` on `endpoint`, replacing whatever policy was active there.
    #[tracing::instrument(skip_all, fields(endpoint = %endpoint, rate_kbit = policy.rate_kbit))]
    pub async fn shape(&self, endpoint: &Endpoint, policy: ShapingPolicy) -> Result<()> {
        let known = self
            .topology
            .get(&endpoint.node)
            .is_some_and(|node| node.has_interface(&endpoint.interface));
        if !known {
            return Err(ShapingError::UnknownInterface(endpoint.clone()));
        }
        if policy.rate_kbit == 0 {
            return Err(ShapingError::InvalidRate(endpoint.clone()));
        }

        let argv = policy.replace_argv(&endpoint.interface);
        tracing::debug!(%argv, "installing shaping policy");
        self.exec
            .exec_checked(&endpoint.node, &argv)
            .await
            .map_err(|source| ShapingError::Command { endpoint: endpoint.clone(), source })?;

        Ok(())
    }

    /// Shapes the host-side endpoints of `link`, and its router-side endpoints too if the link
    /// asks for it. Links without a bandwidth are left alone.
    pub async fn shape_link(&self, link: &Link) -> Result<()> {
        let Some(policy) = ShapingPolicy::for_link(link) else {
            return Ok(());
        };

        for endpoint in link.endpoints() {
            let on_router = self.topology.get(&endpoint.node).is_some_and(|n| n.is_router());
            if on_router && !link.shape_router_side {
                continue;
            }
            self.shape(endpoint, policy).await?;
        }

        Ok(())
    }
}
