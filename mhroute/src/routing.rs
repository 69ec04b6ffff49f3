//! Policy routing for multi-homed nodes.
//!
//! With a single routing table, a node with interfaces on several subnets answers every
//! packet through its default route, whatever interface the request came in on. Policy
//! routing fixes the return path: each interface gets its own table, and two rules send
//! packets from or to that interface's address to it.
//!
//! ```text
//!  rule 0       from all               lookup local
//!  rule 1100    from 11.0.0.2          lookup 100  ──►  11.0.0.0/24 dev client-eth0 src 11.0.0.2
//!  rule 1100    from all to 11.0.0.2   lookup 100       default via 11.0.0.1 dev client-eth0
//!  rule 1101    from 11.0.1.2          lookup 101  ──►  11.0.1.0/24 dev client-eth1 src 11.0.1.2
//!  rule 1101    from all to 11.0.1.2   lookup 101       default via 11.0.1.1 dev client-eth1
//!  ...
//!  rule 32766   from all               lookup main ──►  default via 11.0.0.1 dev client-eth0
//! ```
//!
//! ## Ordering
//!
//! 1. Addresses are assigned first: routes with `src` and gateways need them.
//! 2. Per entry, the table gets its routes before any rule points at it. A rule pointing at an
//!    empty table black-holes matching packets.
//! 3. The main-table default goes last.
//!
//! Entries are independent of each other; only the order within an entry matters.
//!
//! ## Idempotence
//!
//! Applying the same plan twice leaves the same state. Addresses and routes are installed with
//! `replace`; rules have no replace verb, so `ip rule show` is consulted and only missing
//! rules are added. Nothing is rolled back on failure: the recovery path is to apply again.

use std::{fmt, net::Ipv4Addr};

use mhroute_netns::{
    argv,
    command::{self, Argv, Output},
    NamespaceExec,
};

use crate::plan::{InterfaceAddressing, RoutingPlanEntry, TableId, TableRegistry};

/// Rules for table `n` get priority `RULE_PRIORITY_BASE + n`, ahead of the main table (32766).
pub const RULE_PRIORITY_BASE: u32 = 1000;

/// The step of [`PolicyRouter::apply`] that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    ResolveTable { table: TableId },
    AssignAddress { interface: String },
    LinkUp { interface: String },
    SubnetRoute { interface: String, table: TableId },
    TableDefault { interface: String, table: TableId },
    ListRules,
    SourceRule { table: TableId },
    DestinationRule { table: TableId },
    MainDefault { interface: String },
    Dump,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResolveTable { table } => write!(f, "resolving table {table}"),
            Self::AssignAddress { interface } => write!(f, "assigning address to {interface}"),
            Self::LinkUp { interface } => write!(f, "bringing {interface} up"),
            Self::SubnetRoute { interface, table } => {
                write!(f, "adding subnet route via {interface} to {table}")
            }
            Self::TableDefault { interface, table } => {
                write!(f, "adding default route via {interface} to {table}")
            }
            Self::ListRules => f.write_str("listing rules"),
            Self::SourceRule { table } => write!(f, "adding source rule for {table}"),
            Self::DestinationRule { table } => write!(f, "adding destination rule for {table}"),
            Self::MainDefault { interface } => {
                write!(f, "adding main default route via {interface}")
            }
            Self::Dump => f.write_str("dumping routing state"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyFailure {
    #[error(transparent)]
    Command(#[from] command::Error),
    #[error("table {0} is not registered")]
    UnregisteredTable(TableId),
}

/// A routing command failed. Steps before `step` stay applied.
#[derive(Debug, thiserror::Error)]
#[error("routing on {node} failed while {step}: {source}")]
pub struct RoutingApplyError {
    pub node: String,
    pub step: Step,
    pub source: ApplyFailure,
}

pub type Result<T> = std::result::Result<T, RoutingApplyError>;

/// What a rule matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Selector {
    /// Packets whose source address is this address.
    From(Ipv4Addr),
    /// Packets whose destination address is this address.
    To(Ipv4Addr),
}

/// A policy routing rule: packets matching `selector` consult `table`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rule {
    pub selector: Selector,
    pub table: u32,
    pub priority: u32,
}

impl Rule {
    pub fn new(selector: Selector, table: u32) -> Self {
        Self { selector, table, priority: RULE_PRIORITY_BASE + table }
    }

    pub fn add_argv(&self) -> Argv {
        let (direction, address) = match self.selector {
            Selector::From(address) => ("from", address),
            Selector::To(address) => ("to", address),
        };
        argv!["ip", "rule", "add", "pref", self.priority, direction, format!("{address}/32"), "table", self.table]
    }
}

/// A rule as printed by `ip rule show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledRule {
    pub priority: u32,
    /// `None` for `from all`.
    pub from: Option<String>,
    pub to: Option<String>,
    /// Table number, or its name if `rt_tables` maps it.
    pub table: String,
    /// Any selector other than `from`/`to` (`iif`, `fwmark`, `not`...).
    pub extra: bool,
}

impl InstalledRule {
    /// Parses one line of `ip rule show`, e.g. `1100:\tfrom all to 11.0.0.2 lookup 100`.
    pub fn parse(line: &str) -> Option<Self> {
        let (priority, rest) = line.split_once(':')?;
        let priority = priority.trim().parse().ok()?;

        let mut rule = Self { priority, from: None, to: None, table: String::new(), extra: false };
        let mut tokens = rest.split_whitespace();
        while let Some(key) = tokens.next() {
            match key {
                "from" => rule.from = normalize(tokens.next()?),
                "to" => rule.to = normalize(tokens.next()?),
                "lookup" | "table" => rule.table = tokens.next()?.to_owned(),
                _ => rule.extra = true,
            }
        }

        (!rule.table.is_empty()).then_some(rule)
    }

    /// Whether this installed rule is `rule`, with `name` the symbolic id of its table.
    /// Priorities are not compared: a rule added by hand with another priority still counts.
    pub fn is(&self, rule: &Rule, name: &TableId) -> bool {
        let selector = match rule.selector {
            Selector::From(address) => {
                self.from.as_deref() == Some(&address.to_string()) && self.to.is_none()
            }
            Selector::To(address) => {
                self.from.is_none() && self.to.as_deref() == Some(&address.to_string())
            }
        };
        let table = self.table == rule.table.to_string() || self.table == name.as_str();

        !self.extra && selector && table
    }
}

/// `all` becomes `None`, host prefixes lose their `/32`.
fn normalize(address: &str) -> Option<String> {
    match address {
        "all" => None,
        other => Some(other.strip_suffix("/32").unwrap_or(other).to_owned()),
    }
}

/// Parses the output of `ip rule show`, skipping lines it does not understand.
pub fn parse_rules(stdout: &str) -> Vec<InstalledRule> {
    stdout.lines().filter_map(InstalledRule::parse).collect()
}

/// Output of [`PolicyRouter::dump`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingDump {
    pub rules: String,
    pub routes: String,
}

/// Applies routing plans through a [`NamespaceExec`].
#[derive(Debug, Clone, Copy)]
pub struct PolicyRouter<'a> {
    exec: &'a dyn NamespaceExec,
    tables: &'a TableRegistry,
}

impl<'a> PolicyRouter<'a> {
    pub fn new(exec: &'a dyn NamespaceExec, tables: &'a TableRegistry) -> Self {
        Self { exec, tables }
    }

    async fn run(&self, node: &str, step: Step, argv: Argv) -> Result<Output> {
        tracing::debug!(%argv, %step, "running routing command");
        self.exec.exec_checked(node, &argv).await.map_err(|e| RoutingApplyError {
            node: node.to_owned(),
            step,
            source: e.into(),
        })
    }

    /// Installs the per-interface tables and rules of a multi-homed node, then its main-table
    /// default route via the first entry's gateway.
    ///
    /// Every table must already be registered. An empty plan does nothing.
    #[tracing::instrument(skip_all, fields(node = %node))]
    pub async fn apply(&self, node: &str, entries: &[RoutingPlanEntry]) -> Result<()> {
        let Some(first) = entries.first() else {
            tracing::debug!("empty routing plan, nothing to apply");
            return Ok(());
        };

        let tables = entries
            .iter()
            .map(|entry| {
                self.tables.number(&entry.table_id).ok_or_else(|| RoutingApplyError {
                    node: node.to_owned(),
                    step: Step::ResolveTable { table: entry.table_id.clone() },
                    source: ApplyFailure::UnregisteredTable(entry.table_id.clone()),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        for entry in entries {
            self.assign_address(node, &entry.addressing()).await?;
        }

        for (entry, table) in entries.iter().zip(tables) {
            self.apply_entry(node, entry, table).await?;
        }

        self.main_default(node, &first.interface, first.gateway_address).await?;

        tracing::info!(tables = entries.len(), "policy routing applied");
        Ok(())
    }

    async fn apply_entry(&self, node: &str, entry: &RoutingPlanEntry, table: u32) -> Result<()> {
        let interface = &entry.interface;
        let id = &entry.table_id;

        self.run(
            node,
            Step::SubnetRoute { interface: interface.clone(), table: id.clone() },
            argv!["ip", "route", "replace", entry.subnet, "dev", interface, "src", entry.local_address, "table", table],
        )
        .await?;
        self.run(
            node,
            Step::TableDefault { interface: interface.clone(), table: id.clone() },
            argv!["ip", "route", "replace", "default", "via", entry.gateway_address, "dev", interface, "table", table],
        )
        .await?;

        let installed = parse_rules(&self.run(node, Step::ListRules, argv!["ip", "rule", "show"]).await?.stdout);

        let rules = [
            (Rule::new(Selector::From(entry.local_address), table), Step::SourceRule { table: id.clone() }),
            (Rule::new(Selector::To(entry.local_address), table), Step::DestinationRule { table: id.clone() }),
        ];
        for (rule, step) in rules {
            if installed.iter().any(|r| r.is(&rule, id)) {
                tracing::debug!(?rule, table = %id, "rule already installed");
                continue;
            }
            self.run(node, step, rule.add_argv()).await?;
        }

        Ok(())
    }

    /// Assigns `local/width` to the interface and brings it up.
    pub async fn assign_address(&self, node: &str, addressing: &InterfaceAddressing) -> Result<()> {
        let interface = &addressing.interface;
        self.run(
            node,
            Step::AssignAddress { interface: interface.clone() },
            argv!["ip", "addr", "replace", addressing.local_cidr(), "dev", interface],
        )
        .await?;
        self.run(
            node,
            Step::LinkUp { interface: interface.clone() },
            argv!["ip", "link", "set", "dev", interface, "up"],
        )
        .await?;
        Ok(())
    }

    async fn main_default(&self, node: &str, interface: &str, gateway: Ipv4Addr) -> Result<()> {
        self.run(
            node,
            Step::MainDefault { interface: interface.to_owned() },
            argv!["ip", "route", "replace", "default", "via", gateway, "dev", interface],
        )
        .await?;
        Ok(())
    }

    /// Addresses a single-homed host and points its main-table default route at the gateway.
    #[tracing::instrument(skip_all, fields(node = %node, interface = %addressing.interface))]
    pub async fn apply_single_homed(&self, node: &str, addressing: &InterfaceAddressing) -> Result<()> {
        self.assign_address(node, addressing).await?;
        self.main_default(node, &addressing.interface, addressing.gateway_address).await?;

        tracing::info!(gateway = %addressing.gateway_address, "single-homed routing applied");
        Ok(())
    }

    /// Addresses every interface of a router. Every subnet it bridges is directly connected,
    /// so the main table needs nothing more.
    #[tracing::instrument(skip_all, fields(node = %node))]
    pub async fn apply_router(&self, node: &str, addressing: &[InterfaceAddressing]) -> Result<()> {
        for a in addressing {
            self.assign_address(node, a).await?;
        }

        tracing::info!(interfaces = addressing.len(), "router addresses applied");
        Ok(())
    }

    /// The node's rule list and every routing table, for inspection.
    pub async fn dump(&self, node: &str) -> Result<RoutingDump> {
        let rules = self.run(node, Step::Dump, argv!["ip", "rule", "show"]).await?.stdout;
        let routes =
            self.run(node, Step::Dump, argv!["ip", "route", "show", "table", "all"]).await?.stdout;

        Ok(RoutingDump { rules, routes })
    }
}
