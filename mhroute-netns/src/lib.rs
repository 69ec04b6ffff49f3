#![doc(issue_tracker_base_url = "https://github.com/chainbound/mhroute/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Command execution inside the network namespaces of emulated nodes.

pub mod command;
#[cfg(any(test, feature = "test-utils"))]
pub mod fake;
pub mod namespace;
pub mod sysctl;

pub use command::{Argv, Output};
pub use namespace::{DryRunExecutor, NamespaceExec, NetnsExecutor};
