//! Naming of the network sysctl parameters touched by mhroute.
//!
//! Parameters are **per-namespace**: writing `net.ipv4.ip_forward` inside a node's namespace
//! only affects that node. Writes go through the `sysctl` binary so they can be issued with
//! [`NamespaceExec`](crate::namespace::NamespaceExec) like every other command.
//!
//! ```
//! use mhroute_netns::sysctl::{self, Ip, Protocol};
//!
//! let argv = sysctl::write_argv(Ip::Forwarding, Protocol::V4, "1");
//! assert_eq!(argv.to_string(), "sysctl -w net.ipv4.ip_forward=1");
//! ```

use crate::command::Argv;

/// IP protocol version for sysctl keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    /// IPv4 (`net.ipv4.*`)
    #[default]
    V4,
    /// IPv6 (`net.ipv6.*`)
    V6,
}

/// Trait for sysctl parameters that can be read/written.
pub trait SysctlParam {
    /// Returns the dotted sysctl key for the given protocol, e.g. `net.ipv4.ip_forward`.
    fn key(&self, protocol: Protocol) -> &'static str;

    /// Returns the full `/proc/sys` path for the given protocol.
    fn path(&self, protocol: Protocol) -> String {
        format!("/proc/sys/{}", self.key(protocol).replace('.', "/"))
    }
}

/// General IP parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Ip {
    /// Enable IP forwarding (0/1).
    ///
    /// - IPv4: `net.ipv4.ip_forward`
    /// - IPv6: `net.ipv6.conf.all.forwarding`
    ///
    /// Default: 0 (disabled)
    Forwarding,
}

impl SysctlParam for Ip {
    fn key(&self, protocol: Protocol) -> &'static str {
        match (self, protocol) {
            (Self::Forwarding, Protocol::V4) => "net.ipv4.ip_forward",
            (Self::Forwarding, Protocol::V6) => "net.ipv6.conf.all.forwarding",
        }
    }
}

/// The argv writing `value` to `param`.
pub fn write_argv<P: SysctlParam>(param: P, protocol: Protocol, value: &str) -> Argv {
    crate::argv!["sysctl", "-w", format!("{}={value}", param.key(protocol))]
}

/// The argv printing the value of `param` only, without the key.
pub fn read_argv<P: SysctlParam>(param: P, protocol: Protocol) -> Argv {
    crate::argv!["sysctl", "-n", param.key(protocol)]
}
