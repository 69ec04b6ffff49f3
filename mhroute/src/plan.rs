//! Address and routing-table planning.
//!
//! Planning is pure: given a node and its [`AddressScheme`], interface `i` gets
//!
//! | field             | value                   | example (`client`, prefix 11, i = 1) |
//! |-------------------|-------------------------|--------------------------------------|
//! | subnet            | `{p}.0.{i}.0/{w}`       | `11.0.1.0/24`                        |
//! | gateway address   | `{p}.0.{i}.1`           | `11.0.1.1`                           |
//! | local address     | `{p}.0.{i}.2`           | `11.0.1.2`                           |
//! | table id          | `rt_{node}_eth{i}`      | `rt_client_eth1`                     |
//!
//! The router always takes host id 1 on every subnet it bridges, the single host behind it
//! host id 2.
//!
//! Routing tables are only planned for multi-homed nodes. Table ids must be unique across the
//! whole system since all namespaces share the host kernel's table-name space; the
//! [`TableRegistry`] enforces that and assigns each id the kernel table number used in
//! commands.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    net::Ipv4Addr,
};

use serde::{Deserialize, Serialize};

use crate::{
    ip::Subnet,
    routing::RULE_PRIORITY_BASE,
    topology::{Endpoint, Node, Topology},
};

/// The first table number handed out by a [`TableRegistry`].
pub const FIRST_TABLE: u32 = 100;

/// Priority of the kernel's `from all lookup main` rule.
pub const MAIN_RULE_PRIORITY: u32 = 32766;

/// The last table number whose rules are still evaluated before the main table.
pub const LAST_TABLE: u32 = MAIN_RULE_PRIORITY - RULE_PRIORITY_BASE - 1;

/// Kernel-reserved table numbers (`default`, `main`, `local`).
const RESERVED_TABLES: [u32; 3] = [253, 254, 255];

/// The largest subnet width leaving room for the gateway (.1) and local (.2) host ids.
const MAX_WIDTH: u8 = 30;
const MIN_WIDTH: u8 = 8;

/// Interfaces are numbered by the third octet.
const MAX_INTERFACES: usize = 256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("node {0} has no address scheme")]
    NoScheme(String),
    #[error("node {node}: subnet width /{width} must be between /8 and /30")]
    InvalidWidth { node: String, width: u8 },
    #[error("node {node}: {count} interfaces do not fit the address scheme")]
    TooManyInterfaces { node: String, count: usize },
    #[error("node {node}: subnets {a} and {b} overlap")]
    OverlappingSubnets { node: String, a: Subnet, b: Subnet },
    #[error("table {table} planned for {node} is already owned by {owner}")]
    TableCollision { table: TableId, owner: String, node: String },
    #[error("no table numbers left")]
    TablesExhausted,
    #[error("first table number {0} must be between 1 and {}", LAST_TABLE)]
    InvalidFirstTable(u32),
    #[error("{0} is not linked to a host")]
    Unlinked(Endpoint),
}

/// Per-node address prefix scheme: interface `i` lives in `{prefix}.0.{i}.0/{width}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressScheme {
    /// First octet of every address of the node.
    pub prefix: u8,
    /// Subnet prefix length.
    #[serde(default = "AddressScheme::default_width")]
    pub width: u8,
}

impl AddressScheme {
    pub const DEFAULT_WIDTH: u8 = 24;

    pub fn new(prefix: u8, width: u8) -> Self {
        Self { prefix, width }
    }

    fn default_width() -> u8 {
        Self::DEFAULT_WIDTH
    }

    /// The subnet of interface `index`.
    pub fn subnet(&self, index: u8) -> Subnet {
        Subnet::new(Ipv4Addr::new(self.prefix, 0, index, 0), self.width)
    }
}

/// Symbolic name of a per-interface routing table, `rt_{node}_eth{i}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(String);

impl TableId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn for_interface(node: &str, index: usize) -> Self {
        Self(format!("rt_{node}_eth{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Addresses of one interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddressing {
    pub interface: String,
    pub subnet: Subnet,
    pub local_address: Ipv4Addr,
    pub gateway_address: Ipv4Addr,
}

impl InterfaceAddressing {
    /// `local/width`, as assigned to the interface.
    pub fn local_cidr(&self) -> String {
        format!("{}/{}", self.local_address, self.subnet.netmask)
    }
}

/// The routing table planned for one interface of a multi-homed node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPlanEntry {
    pub interface: String,
    pub table_id: TableId,
    pub subnet: Subnet,
    pub gateway_address: Ipv4Addr,
    pub local_address: Ipv4Addr,
}

impl RoutingPlanEntry {
    pub fn local_cidr(&self) -> String {
        format!("{}/{}", self.local_address, self.subnet.netmask)
    }

    pub fn addressing(&self) -> InterfaceAddressing {
        InterfaceAddressing {
            interface: self.interface.clone(),
            subnet: self.subnet,
            local_address: self.local_address,
            gateway_address: self.gateway_address,
        }
    }
}

/// Addresses for every interface of `node`, in interface order. Valid for single-homed nodes.
pub fn addressing(node: &Node) -> Result<Vec<InterfaceAddressing>, PlanError> {
    let scheme = node.scheme.ok_or_else(|| PlanError::NoScheme(node.name.clone()))?;

    if !(MIN_WIDTH..=MAX_WIDTH).contains(&scheme.width) {
        return Err(PlanError::InvalidWidth { node: node.name.clone(), width: scheme.width });
    }
    if node.interfaces.len() > MAX_INTERFACES {
        return Err(PlanError::TooManyInterfaces {
            node: node.name.clone(),
            count: node.interfaces.len(),
        });
    }

    let addressing: Vec<_> = node
        .interfaces
        .iter()
        .zip(0..=u8::MAX)
        .map(|(interface, index)| {
            let subnet = scheme.subnet(index);
            InterfaceAddressing {
                interface: interface.name.clone(),
                subnet,
                local_address: subnet.host(2),
                gateway_address: subnet.host(1),
            }
        })
        .collect();

    check_overlaps(&node.name, &addressing)?;
    Ok(addressing)
}

/// No two interfaces of one node may share address space.
fn check_overlaps(node: &str, addressing: &[InterfaceAddressing]) -> Result<(), PlanError> {
    for (i, a) in addressing.iter().enumerate() {
        if let Some(b) = addressing[i + 1..].iter().find(|b| a.subnet.overlaps(&b.subnet)) {
            return Err(PlanError::OverlappingSubnets {
                node: node.to_owned(),
                a: a.subnet,
                b: b.subnet,
            });
        }
    }
    Ok(())
}

/// Plans one routing table per interface of a multi-homed node, in interface order.
///
/// Single-homed nodes get an empty plan: the main table is enough for them.
pub fn plan(node: &Node) -> Result<Vec<RoutingPlanEntry>, PlanError> {
    let addressing = addressing(node)?;
    if addressing.len() < 2 {
        return Ok(Vec::new());
    }

    let entries: Vec<_> = addressing
        .into_iter()
        .enumerate()
        .map(|(index, a)| RoutingPlanEntry {
            table_id: TableId::for_interface(&node.name, index),
            interface: a.interface,
            subnet: a.subnet,
            gateway_address: a.gateway_address,
            local_address: a.local_address,
        })
        .collect();

    let mut seen = HashSet::new();
    if let Some(dup) = entries.iter().find(|e| !seen.insert(&e.table_id)) {
        return Err(PlanError::TableCollision {
            table: dup.table_id.clone(),
            owner: node.name.clone(),
            node: node.name.clone(),
        });
    }

    Ok(entries)
}

/// Addresses of a router's interfaces: each takes the gateway address of the host interface
/// at the other end of its link, with that host's subnet. Unlinked interfaces, interfaces
/// linked to another router, and hosts whose subnets overlap are an error.
pub fn router_addressing(
    topology: &Topology,
    router: &Node,
) -> Result<Vec<InterfaceAddressing>, PlanError> {
    let addressing = router
        .interfaces
        .iter()
        .map(|interface| {
            let end = Endpoint::new(&router.name, &interface.name);
            let peer = topology
                .link_of(&end)
                .and_then(|link| link.peer_of(&end))
                .ok_or_else(|| PlanError::Unlinked(end.clone()))?;
            let host = topology
                .get(&peer.node)
                .filter(|host| !host.is_router())
                .ok_or_else(|| PlanError::Unlinked(end.clone()))?;

            let host_side = addressing(host)?
                .into_iter()
                .find(|a| a.interface == peer.interface)
                .ok_or_else(|| PlanError::Unlinked(end.clone()))?;

            Ok(InterfaceAddressing {
                interface: interface.name.clone(),
                subnet: host_side.subnet,
                local_address: host_side.gateway_address,
                gateway_address: host_side.local_address,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    check_overlaps(&router.name, &addressing)?;
    Ok(addressing)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Registration {
    owner: String,
    number: u32,
}

/// System-wide registry of routing tables.
///
/// Every [`TableId`] is owned by exactly one node and bound to a unique kernel table number.
#[derive(Debug, Clone)]
pub struct TableRegistry {
    next: u32,
    tables: BTreeMap<TableId, Registration>,
}

impl Default for TableRegistry {
    fn default() -> Self {
        Self { next: FIRST_TABLE, tables: BTreeMap::new() }
    }
}

impl TableRegistry {
    /// A registry handing out numbers from `first`, which must leave the rules of its tables
    /// ahead of the main table.
    pub fn new(first: u32) -> Result<Self, PlanError> {
        if !(1..=LAST_TABLE).contains(&first) {
            return Err(PlanError::InvalidFirstTable(first));
        }
        Ok(Self { next: first, tables: BTreeMap::new() })
    }

    /// Registers the tables of `node`'s plan.
    ///
    /// Registering the same node's tables again is a no-op. A table id owned by another node is
    /// a [`PlanError::TableCollision`], and running past [`LAST_TABLE`] is
    /// [`PlanError::TablesExhausted`]; both leave the registry untouched.
    pub fn register(&mut self, node: &str, entries: &[RoutingPlanEntry]) -> Result<(), PlanError> {
        let mut seen = HashSet::new();
        for entry in entries {
            let collision = match self.tables.get(&entry.table_id) {
                Some(existing) if existing.owner != node => Some(existing.owner.clone()),
                _ if !seen.insert(&entry.table_id) => Some(node.to_owned()),
                _ => None,
            };
            if let Some(owner) = collision {
                return Err(PlanError::TableCollision {
                    table: entry.table_id.clone(),
                    owner,
                    node: node.to_owned(),
                });
            }
        }

        let mut next = self.next;
        let mut allocated = Vec::new();
        for entry in entries.iter().filter(|e| !self.tables.contains_key(&e.table_id)) {
            let number = allocate(&mut next)?;
            allocated.push((entry.table_id.clone(), number));
        }

        self.next = next;
        for (table, number) in allocated {
            tracing::debug!(%table, number, node, "registered routing table");
            self.tables.insert(table, Registration { owner: node.to_owned(), number });
        }

        Ok(())
    }

    /// The kernel table number bound to `table`.
    pub fn number(&self, table: &TableId) -> Option<u32> {
        self.tables.get(table).map(|r| r.number)
    }

    pub fn owner(&self, table: &TableId) -> Option<&str> {
        self.tables.get(table).map(|r| r.owner.as_str())
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// An `rt_tables` snippet naming every registered table, suitable for
    /// `/etc/iproute2/rt_tables.d/mhroute.conf`. With it installed, `ip rule show` prints table
    /// names instead of numbers.
    pub fn rt_tables(&self) -> String {
        let mut tables: Vec<_> = self.tables.iter().collect();
        tables.sort_by_key(|(_, r)| r.number);
        tables.into_iter().map(|(id, r)| format!("{}\t{id}\n", r.number)).collect()
    }
}

/// Takes the next free number at or after `next`, skipping the reserved tables.
fn allocate(next: &mut u32) -> Result<u32, PlanError> {
    while RESERVED_TABLES.contains(next) {
        *next += 1;
    }
    if *next > LAST_TABLE {
        return Err(PlanError::TablesExhausted);
    }
    let number = *next;
    *next += 1;
    Ok(number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{Link, Role};

    fn client() -> Node {
        Node::host("client", 3, AddressScheme::new(11, 24))
    }

    #[test]
    fn multi_homed_plan() {
        let entries = plan(&client()).unwrap();
        assert_eq!(entries.len(), 3);

        let e = &entries[1];
        assert_eq!(e.interface, "client-eth1");
        assert_eq!(e.table_id.as_str(), "rt_client_eth1");
        assert_eq!(e.subnet.to_string(), "11.0.1.0/24");
        assert_eq!(e.gateway_address, Ipv4Addr::new(11, 0, 1, 1));
        assert_eq!(e.local_address, Ipv4Addr::new(11, 0, 1, 2));
        assert_eq!(e.local_cidr(), "11.0.1.2/24");

        let tables: HashSet<_> = entries.iter().map(|e| &e.table_id).collect();
        assert_eq!(tables.len(), 3);
    }

    #[test]
    fn plan_is_deterministic() {
        assert_eq!(plan(&client()).unwrap(), plan(&client()).unwrap());
    }

    #[test]
    fn single_homed_node_has_no_tables() {
        let server = Node::host("server", 1, AddressScheme::new(10, 24));
        assert!(plan(&server).unwrap().is_empty());

        let addressing = addressing(&server).unwrap();
        assert_eq!(addressing.len(), 1);
        assert_eq!(addressing[0].local_cidr(), "10.0.0.2/24");
        assert_eq!(addressing[0].gateway_address, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn wide_subnets_overlap() {
        let node = Node::host("client", 2, AddressScheme::new(11, 16));
        assert!(matches!(plan(&node), Err(PlanError::OverlappingSubnets { .. })));

        // A single interface cannot overlap with anything.
        let node = Node::host("server", 1, AddressScheme::new(10, 16));
        assert!(plan(&node).unwrap().is_empty());
    }

    #[test]
    fn narrow_subnets() {
        let entries = plan(&Node::host("client", 2, AddressScheme::new(11, 30))).unwrap();
        assert_eq!(entries[1].subnet.to_string(), "11.0.1.0/30");
        assert!(entries[1].subnet.contains(entries[1].local_address));

        let node = Node::host("client", 2, AddressScheme::new(11, 31));
        assert_eq!(plan(&node), Err(PlanError::InvalidWidth { node: "client".into(), width: 31 }));
    }

    #[test]
    fn too_many_interfaces() {
        let node = Node::host("big", 257, AddressScheme::new(11, 24));
        assert!(matches!(plan(&node), Err(PlanError::TooManyInterfaces { count: 257, .. })));
    }

    #[test]
    fn router_has_no_scheme() {
        let router = Node::new("router", Role::Router).with_interfaces(["r-eth0", "r-eth1"]);
        assert_eq!(plan(&router), Err(PlanError::NoScheme("router".into())));
    }

    #[test]
    fn router_takes_gateways() {
        let topology = Topology::new()
            .node(Node::router("router", 2))
            .node(Node::host("server", 1, AddressScheme::new(10, 24)))
            .node(client())
            .link(Link::new(("server", "server-eth0"), ("router", "router-eth0")))
            .link(Link::new(("client", "client-eth2"), ("router", "router-eth1")));
        let router = topology.get("router").unwrap();

        let addresses = router_addressing(&topology, router).unwrap();
        assert_eq!(addresses[0].local_cidr(), "10.0.0.1/24");
        assert_eq!(addresses[1].local_cidr(), "11.0.2.1/24");
        assert_eq!(addresses[1].gateway_address, Ipv4Addr::new(11, 0, 2, 2));
    }

    #[test]
    fn router_rejects_overlapping_hosts() {
        let topology = Topology::new()
            .node(Node::router("router", 2))
            .node(Node::host("a", 1, AddressScheme::new(11, 24)))
            .node(Node::host("b", 1, AddressScheme::new(11, 24)))
            .link(Link::new(("router", "router-eth0"), ("a", "a-eth0")))
            .link(Link::new(("router", "router-eth1"), ("b", "b-eth0")));
        let router = topology.get("router").unwrap();

        let subnet = AddressScheme::new(11, 24).subnet(0);
        assert_eq!(
            router_addressing(&topology, router),
            Err(PlanError::OverlappingSubnets { node: "router".into(), a: subnet, b: subnet })
        );
    }

    #[test]
    fn unlinked_router_interface() {
        let topology = Topology::new().node(Node::router("router", 1));
        let router = topology.get("router").unwrap();
        assert_eq!(
            router_addressing(&topology, router),
            Err(PlanError::Unlinked(Endpoint::new("router", "router-eth0")))
        );
    }

    #[test]
    fn registry_assigns_unique_numbers() {
        let mut registry = TableRegistry::default();
        let client = plan(&client()).unwrap();
        let other = plan(&Node::host("other", 2, AddressScheme::new(12, 24))).unwrap();

        registry.register("client", &client).unwrap();
        registry.register("other", &other).unwrap();

        let numbers: HashSet<_> =
            client.iter().chain(&other).map(|e| registry.number(&e.table_id).unwrap()).collect();
        assert_eq!(numbers.len(), 5);
        assert_eq!(registry.number(&client[0].table_id), Some(FIRST_TABLE));
        assert_eq!(registry.owner(&other[1].table_id), Some("other"));
    }

    #[test]
    fn registry_reregistration_is_noop() {
        let mut registry = TableRegistry::default();
        let entries = plan(&client()).unwrap();

        registry.register("client", &entries).unwrap();
        let before = registry.number(&entries[2].table_id);
        registry.register("client", &entries).unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.number(&entries[2].table_id), before);
    }

    #[test]
    fn registry_rejects_foreign_owner() {
        let mut registry = TableRegistry::default();
        let entries = plan(&client()).unwrap();
        registry.register("client", &entries).unwrap();

        let err = registry.register("impostor", &entries).unwrap_err();
        assert_eq!(
            err,
            PlanError::TableCollision {
                table: TableId::new("rt_client_eth0"),
                owner: "client".into(),
                node: "impostor".into(),
            }
        );
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn registry_skips_reserved_numbers() {
        let mut registry = TableRegistry::new(252).unwrap();
        let entries = plan(&Node::host("h", 3, AddressScheme::new(11, 24))).unwrap();
        registry.register("h", &entries).unwrap();

        let numbers: Vec<_> = entries.iter().map(|e| registry.number(&e.table_id).unwrap()).collect();
        assert_eq!(numbers, [252, 256, 257]);
    }

    #[test]
    fn registry_keeps_rules_ahead_of_main() {
        assert_eq!(RULE_PRIORITY_BASE + LAST_TABLE, MAIN_RULE_PRIORITY - 1);
        assert_eq!(TableRegistry::new(40_000).unwrap_err(), PlanError::InvalidFirstTable(40_000));
        assert_eq!(TableRegistry::new(0).unwrap_err(), PlanError::InvalidFirstTable(0));

        let mut registry = TableRegistry::new(LAST_TABLE - 1).unwrap();
        let three = plan(&Node::host("three", 3, AddressScheme::new(11, 24))).unwrap();
        assert_eq!(registry.register("three", &three), Err(PlanError::TablesExhausted));
        assert!(registry.is_empty());

        let two = plan(&Node::host("two", 2, AddressScheme::new(12, 24))).unwrap();
        registry.register("two", &two).unwrap();
        assert_eq!(registry.number(&two[1].table_id), Some(LAST_TABLE));

        let one = plan(&Node::host("one", 2, AddressScheme::new(13, 24))).unwrap();
        assert_eq!(registry.register("one", &one), Err(PlanError::TablesExhausted));
    }

    #[test]
    fn rt_tables_snippet() {
        let mut registry = TableRegistry::default();
        registry.register("h", &plan(&Node::host("h", 2, AddressScheme::new(11, 24))).unwrap()).unwrap();
        assert_eq!(registry.rt_tables(), "100\trt_h_eth0\n101\trt_h_eth1\n");
    }
}
