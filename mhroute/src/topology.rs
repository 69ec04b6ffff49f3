//! Static description of an emulated topology: nodes, their ordered interfaces, and the links
//! between them.
//!
//! The substrate creates the namespaces and veths this describes; mhroute only reads it to
//! derive addresses, routing tables and shaping policies.
//!
//! ```
//! use mhroute::{plan::AddressScheme, topology::{Link, Node, Topology}};
//!
//! let topology = Topology::new()
//!     .node(Node::router("router", 2))
//!     .node(Node::host("server", 1, AddressScheme::new(10, 24)))
//!     .node(Node::host("client", 1, AddressScheme::new(11, 24)))
//!     .link(Link::new(("server", "server-eth0"), ("router", "router-eth0")).bandwidth_kbit(5_000))
//!     .link(Link::new(("client", "client-eth0"), ("router", "router-eth1")).bandwidth_kbit(1_000));
//!
//! topology.validate().unwrap();
//! ```

use std::{collections::HashSet, fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::plan::AddressScheme;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("duplicate node name {0}")]
    DuplicateNode(String),
    #[error("node {node} declares interface {interface} twice")]
    DuplicateInterface { node: String, interface: String },
    #[error("link endpoint {0} does not exist")]
    UnknownEndpoint(Endpoint),
    #[error("interface {0} is attached to more than one link")]
    InterfaceReused(Endpoint),
    #[error("link connects node {0} to itself")]
    SelfLink(String),
    #[error("router {0} cannot carry an address scheme, its addresses follow the hosts it bridges")]
    SchemeOnRouter(String),
    #[error("host {0} has no address scheme")]
    MissingScheme(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Router,
    Host,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Interface {
    pub name: String,
}

impl Interface {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A node of the topology. Interface order is significant: interface `i` is planned on
/// subnet `i` of the node's [`AddressScheme`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub role: Role,
    pub interfaces: Vec<Interface>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<AddressScheme>,
}

impl Node {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self { name: name.into(), role, interfaces: Vec::new(), scheme: None }
    }

    /// A router with interfaces `{name}-eth0` to `{name}-eth{count - 1}`.
    pub fn router(name: impl Into<String>, count: usize) -> Self {
        let node = Self::new(name, Role::Router);
        let interfaces = (0..count).map(|i| Interface::new(format!("{}-eth{i}", node.name))).collect();
        Self { interfaces, ..node }
    }

    /// A host with interfaces `{name}-eth0` to `{name}-eth{count - 1}`.
    pub fn host(name: impl Into<String>, count: usize, scheme: AddressScheme) -> Self {
        let node = Self::new(name, Role::Host);
        let interfaces = (0..count).map(|i| Interface::new(format!("{}-eth{i}", node.name))).collect();
        Self { interfaces, scheme: Some(scheme), ..node }
    }

    pub fn with_interfaces<I, S>(mut self, interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interfaces = interfaces.into_iter().map(Interface::new).collect();
        self
    }

    pub fn with_scheme(mut self, scheme: AddressScheme) -> Self {
        self.scheme = Some(scheme);
        self
    }

    pub fn is_router(&self) -> bool {
        self.role == Role::Router
    }

    /// A node with more than one interface.
    pub fn is_multi_homed(&self) -> bool {
        self.interfaces.len() > 1
    }

    pub fn interface_index(&self, interface: &str) -> Option<usize> {
        self.interfaces.iter().position(|i| i.name == interface)
    }

    pub fn has_interface(&self, interface: &str) -> bool {
        self.interface_index(interface).is_some()
    }
}

/// One end of a link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub node: String,
    pub interface: String,
}

impl Endpoint {
    pub fn new(node: impl Into<String>, interface: impl Into<String>) -> Self {
        Self { node: node.into(), interface: interface.into() }
    }
}

impl<N: Into<String>, I: Into<String>> From<(N, I)> for Endpoint {
    fn from((node, interface): (N, I)) -> Self {
        Self::new(node, interface)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.interface)
    }
}

/// An undirected link between two interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub a: Endpoint,
    pub b: Endpoint,
    /// Link capacity in kbit/s. Links without one are not shaped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_kbit: Option<u64>,
    /// One-way delay added on each shaped endpoint, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Also shape the endpoint owned by a router. Only host endpoints are shaped by default.
    #[serde(default)]
    pub shape_router_side: bool,
}

impl Link {
    pub fn new(a: impl Into<Endpoint>, b: impl Into<Endpoint>) -> Self {
        Self {
            a: a.into(),
            b: b.into(),
            bandwidth_kbit: None,
            latency_ms: None,
            shape_router_side: false,
        }
    }

    pub fn bandwidth_kbit(mut self, kbit: u64) -> Self {
        self.bandwidth_kbit = Some(kbit);
        self
    }

    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    pub fn shape_router_side(mut self, shape: bool) -> Self {
        self.shape_router_side = shape;
        self
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency_ms.map(Duration::from_millis)
    }

    pub fn endpoints(&self) -> [&Endpoint; 2] {
        [&self.a, &self.b]
    }

    /// The endpoint opposite to `end`, if `end` belongs to this link.
    pub fn peer_of(&self, end: &Endpoint) -> Option<&Endpoint> {
        if &self.a == end {
            Some(&self.b)
        } else if &self.b == end {
            Some(&self.a)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn link(mut self, link: Link) -> Self {
        self.links.push(link);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn routers(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_router())
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.is_router())
    }

    /// The link attached to the given interface.
    pub fn link_of(&self, end: &Endpoint) -> Option<&Link> {
        self.links.iter().find(|l| l.peer_of(end).is_some())
    }

    /// Checks names are unique, every link endpoint exists, every interface sits on at most one
    /// link, and address schemes are carried by hosts only.
    pub fn validate(&self) -> Result<(), TopologyError> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(TopologyError::DuplicateNode(node.name.clone()));
            }

            let mut interfaces = HashSet::new();
            for interface in &node.interfaces {
                if !interfaces.insert(interface.name.as_str()) {
                    return Err(TopologyError::DuplicateInterface {
                        node: node.name.clone(),
                        interface: interface.name.clone(),
                    });
                }
            }

            match (node.role, &node.scheme) {
                (Role::Router, Some(_)) => return Err(TopologyError::SchemeOnRouter(node.name.clone())),
                (Role::Host, None) => return Err(TopologyError::MissingScheme(node.name.clone())),
                _ => {}
            }
        }

        let mut attached = HashSet::new();
        for link in &self.links {
            if link.a.node == link.b.node {
                return Err(TopologyError::SelfLink(link.a.node.clone()));
            }
            for end in link.endpoints() {
                let exists = self.get(&end.node).is_some_and(|n| n.has_interface(&end.interface));
                if !exists {
                    return Err(TopologyError::UnknownEndpoint(end.clone()));
                }
                if !attached.insert(end) {
                    return Err(TopologyError::InterfaceReused(end.clone()));
                }
            }
        }

        Ok(())
    }
}
