#![doc(issue_tracker_base_url = "https://github.com/chainbound/mhroute/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Policy routing, traffic shaping and forwarding setup for emulated multi-homed networks.
//!
//! A node with several interfaces on different subnets answers every packet through its single
//! default route, whatever interface the request arrived on. mhroute plans one routing table
//! per interface and installs the rules that make replies leave through the interface they
//! belong to. It also shapes links with `netem` and toggles forwarding on routers.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mhroute::{network::Network, topology::Topology};
//! use mhroute_netns::NetnsExecutor;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let topology = Topology::from_path("topology.json")?;
//! let mut network = Network::new(topology, Arc::new(NetnsExecutor::new()))?;
//! network.setup().await.into_result()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod forwarding;
pub mod ip;
pub mod network;
pub mod plan;
pub mod routing;
pub mod shaping;
pub mod topology;

pub use config::ConfigError;
pub use network::{Network, SetupReport};
pub use plan::{plan, AddressScheme, RoutingPlanEntry, TableId, TableRegistry};
pub use topology::{Link, Node, Topology};
