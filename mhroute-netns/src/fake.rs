//! An in-memory stand-in for a set of network namespaces.
//!
//! [`FakeNetwork`] implements [`NamespaceExec`] by interpreting the subset of `ip`, `tc` and
//! `sysctl` that mhroute issues, against a small model of per-node kernel state: interface
//! addresses and link state, routing tables with connected routes, the rule list, root qdiscs
//! and sysctls. It rejects what the kernel rejects (unknown devices, unreachable gateways,
//! foreign `src` addresses, `add` over an existing route or root qdisc), so ordering and
//! idempotence mistakes surface as failed commands.
//!
//! Unlike older kernels' `ip rule add`, nothing stops duplicate rules from piling up: callers
//! are expected to check before adding.

use std::{
    collections::BTreeMap,
    fmt::{self, Write as _},
    net::Ipv4Addr,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::{
    command::{self, Argv, Output},
    namespace::NamespaceExec,
};

pub const TABLE_DEFAULT: u32 = 253;
pub const TABLE_MAIN: u32 = 254;
pub const TABLE_LOCAL: u32 = 255;

/// An IPv4 prefix, `address/len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Prefix {
    pub address: Ipv4Addr,
    pub len: u8,
}

impl Prefix {
    pub const DEFAULT: Self = Self { address: Ipv4Addr::UNSPECIFIED, len: 0 };

    pub fn new(address: Ipv4Addr, len: u8) -> Self {
        Self { address, len }
    }

    fn mask(&self) -> u32 {
        if self.len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.len.min(32)))
        }
    }

    /// The prefix with host bits cleared.
    pub fn network(&self) -> Self {
        Self::new(Ipv4Addr::from_bits(self.address.to_bits() & self.mask()), self.len)
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        address.to_bits() & self.mask() == self.address.to_bits() & self.mask()
    }

    /// Parses `a.b.c.d/len`, `a.b.c.d` (a host prefix) or `default`.
    pub fn parse(s: &str) -> Option<Self> {
        if s == "default" {
            return Some(Self::DEFAULT);
        }
        match s.split_once('/') {
            Some((address, len)) => {
                let len = len.parse().ok().filter(|len| *len <= 32)?;
                Some(Self::new(address.parse().ok()?, len))
            }
            None => Some(Self::new(s.parse().ok()?, 32)),
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.len {
            0 => f.write_str("default"),
            32 => write!(f, "{}", self.address),
            len => write!(f, "{}/{len}", self.address),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeRoute {
    pub destination: Prefix,
    pub via: Option<Ipv4Addr>,
    pub dev: String,
    pub src: Option<Ipv4Addr>,
    /// Installed by the kernel on address assignment.
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeRule {
    pub pref: u32,
    pub from: Option<Prefix>,
    pub to: Option<Prefix>,
    pub table: u32,
}

impl FakeRule {
    fn matches(&self, src: Option<Ipv4Addr>, dst: Ipv4Addr) -> bool {
        let from = match (self.from, src) {
            (None, _) => true,
            (Some(from), Some(src)) => from.contains(src),
            (Some(_), None) => false,
        };
        let to = self.to.map_or(true, |to| to.contains(dst));
        from && to
    }
}

/// The route chosen for a packet, see [`FakeNetwork::route_lookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub table: u32,
    pub dev: String,
    pub via: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Default)]
struct FakeInterface {
    addresses: Vec<Prefix>,
    up: bool,
}

#[derive(Debug, Clone)]
struct FakeNode {
    interfaces: BTreeMap<String, FakeInterface>,
    tables: BTreeMap<u32, Vec<FakeRoute>>,
    rules: Vec<FakeRule>,
    qdiscs: BTreeMap<String, Vec<String>>,
    sysctls: BTreeMap<String, String>,
    history: Vec<Argv>,
    failures: Vec<String>,
}

impl FakeNode {
    fn new<I, S>(interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let interfaces = interfaces
            .into_iter()
            .map(|name| (name.into(), FakeInterface { up: true, ..Default::default() }))
            .collect();
        let rules = vec![
            FakeRule { pref: 0, from: None, to: None, table: TABLE_LOCAL },
            FakeRule { pref: 32766, from: None, to: None, table: TABLE_MAIN },
            FakeRule { pref: 32767, from: None, to: None, table: TABLE_DEFAULT },
        ];
        let sysctls = [
            ("net.ipv4.ip_forward".to_owned(), "0".to_owned()),
            ("net.ipv6.conf.all.forwarding".to_owned(), "0".to_owned()),
        ]
        .into();

        Self {
            interfaces,
            tables: BTreeMap::new(),
            rules,
            qdiscs: BTreeMap::new(),
            sysctls,
            history: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn local_addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.interfaces.values().flat_map(|i| i.addresses.iter().map(|p| p.address))
    }

    fn interface_mut(&mut self, dev: &str) -> Result<&mut FakeInterface, Output> {
        self.interfaces.get_mut(dev).ok_or_else(|| no_device(dev))
    }

    fn add_connected_routes(&mut self, dev: &str) {
        let Some(interface) = self.interfaces.get(dev) else { return };
        if !interface.up {
            return;
        }
        let connected: Vec<FakeRoute> = interface
            .addresses
            .iter()
            .map(|prefix| FakeRoute {
                destination: prefix.network(),
                via: None,
                dev: dev.to_owned(),
                src: Some(prefix.address),
                connected: true,
            })
            .collect();

        let main = self.tables.entry(TABLE_MAIN).or_default();
        for route in connected {
            if !main.iter().any(|r| r.destination == route.destination && r.dev == route.dev) {
                main.push(route);
            }
        }
    }

    fn run(&mut self, argv: &Argv) -> Output {
        self.history.push(argv.clone());

        let line = argv.to_string();
        if self.failures.iter().any(|pattern| line.contains(pattern.as_str())) {
            return Output::failed(2, format!("injected failure: {line}"));
        }

        let args: Vec<&str> = argv.as_slice().iter().map(String::as_str).collect();
        let result = match args.as_slice() {
            ["ip", "addr" | "address", verb @ ("add" | "replace"), rest @ ..] => {
                self.addr(verb == &"replace", rest)
            }
            ["ip", "link", "set", "dev", dev, "up"] | ["ip", "link", "set", dev, "up"] => {
                self.link_up(dev)
            }
            ["ip", "route", verb @ ("add" | "replace"), rest @ ..] => {
                self.route_add(verb == &"replace", rest)
            }
            ["ip", "route", "show", rest @ ..] => self.route_show(rest),
            ["ip", "rule", "add", rest @ ..] => self.rule_add(rest),
            ["ip", "rule", "show"] | ["ip", "rule", "list"] | ["ip", "rule"] => {
                Ok(Output::ok(self.rule_show()))
            }
            ["tc", "qdisc", verb @ ("add" | "replace"), "dev", dev, "root", rest @ ..] => {
                self.qdisc(verb == &"replace", dev, rest)
            }
            ["tc", "qdisc", "show", "dev", dev] => self.qdisc_show(dev),
            ["sysctl", "-w", assignment] => self.sysctl_write(assignment),
            ["sysctl", "-n", key] => self
                .sysctls
                .get(*key)
                .map(|value| Output::ok(format!("{value}\n")))
                .ok_or_else(|| unknown_key(key)),
            _ => Err(Output::failed(1, format!("unsupported command: {line}"))),
        };

        result.unwrap_or_else(|failed| failed)
    }

    fn addr(&mut self, replace: bool, args: &[&str]) -> Result<Output, Output> {
        let [cidr, "dev", dev] = args else { return Err(usage()) };
        let prefix = Prefix::parse(cidr).ok_or_else(|| invalid_prefix(cidr))?;

        let interface = self.interface_mut(dev)?;
        if interface.addresses.iter().any(|a| a.address == prefix.address) {
            if !replace {
                return Err(exists());
            }
            interface.addresses.retain(|a| a.address != prefix.address);
        }
        interface.addresses.push(prefix);

        self.add_connected_routes(dev);
        Ok(Output::ok(""))
    }

    fn link_up(&mut self, dev: &str) -> Result<Output, Output> {
        self.interface_mut(dev)?.up = true;
        self.add_connected_routes(dev);
        Ok(Output::ok(""))
    }

    fn route_add(&mut self, replace: bool, args: &[&str]) -> Result<Output, Output> {
        let (destination, rest) = args.split_first().ok_or_else(usage)?;
        let destination = Prefix::parse(destination).ok_or_else(|| invalid_prefix(destination))?;
        let options = options(rest)?;

        let dev = *options.get("dev").ok_or_else(usage)?;
        let via = options.get("via").map(|v| v.parse::<Ipv4Addr>()).transpose().map_err(|_| usage())?;
        let src = options.get("src").map(|v| v.parse::<Ipv4Addr>()).transpose().map_err(|_| usage())?;
        let table = options.get("table").map(|t| parse_table(t)).transpose()?.unwrap_or(TABLE_MAIN);

        let interface = self.interfaces.get(dev).ok_or_else(|| no_device(dev))?;
        if !interface.up {
            return Err(Output::failed(2, "Error: Nexthop device is not up."));
        }
        if let Some(via) = via {
            if !interface.addresses.iter().any(|a| a.network().contains(via)) {
                return Err(Output::failed(2, "Error: Nexthop has invalid gateway."));
            }
        }
        if let Some(src) = src {
            if !self.local_addresses().any(|a| a == src) {
                return Err(Output::failed(2, "Error: Invalid prefsrc address."));
            }
        }

        let route =
            FakeRoute { destination: destination.network(), via, dev: dev.to_owned(), src, connected: false };
        let routes = self.tables.entry(table).or_default();
        match routes.iter().position(|r| r.destination == route.destination) {
            Some(_) if !replace => return Err(exists()),
            Some(index) => routes[index] = route,
            None => routes.push(route),
        }

        Ok(Output::ok(""))
    }

    fn route_show(&self, args: &[&str]) -> Result<Output, Output> {
        let tables: Vec<u32> = match args {
            [] => vec![TABLE_MAIN],
            ["table", "all"] => self.tables.keys().copied().collect(),
            ["table", table] => vec![parse_table(table)?],
            _ => return Err(usage()),
        };

        let mut out = String::new();
        for table in tables {
            for route in self.tables.get(&table).into_iter().flatten() {
                let _ = write!(out, "{}", route.destination);
                if let Some(via) = route.via {
                    let _ = write!(out, " via {via}");
                }
                let _ = write!(out, " dev {}", route.dev);
                if route.connected {
                    out.push_str(" proto kernel scope link");
                }
                if let Some(src) = route.src {
                    let _ = write!(out, " src {src}");
                }
                if table != TABLE_MAIN {
                    let _ = write!(out, " table {}", table_name(table));
                }
                out.push('\n');
            }
        }

        Ok(Output::ok(out))
    }

    fn rule_add(&mut self, args: &[&str]) -> Result<Output, Output> {
        let options = options(args)?;

        let pref = match options.get("pref").or_else(|| options.get("priority")) {
            Some(pref) => pref.parse().map_err(|_| usage())?,
            None => self.rules.iter().map(|r| r.pref).filter(|p| *p > 0).min().unwrap_or(32766) - 1,
        };
        let from = match options.get("from") {
            Some(&"all") | None => None,
            Some(from) => Some(Prefix::parse(from).ok_or_else(|| invalid_prefix(from))?),
        };
        let to = match options.get("to") {
            Some(&"all") | None => None,
            Some(to) => Some(Prefix::parse(to).ok_or_else(|| invalid_prefix(to))?),
        };
        let table = options.get("table").or_else(|| options.get("lookup")).ok_or_else(usage)?;
        let table = parse_table(table)?;

        let rule = FakeRule { pref, from, to, table };
        let index = self.rules.iter().position(|r| r.pref > pref).unwrap_or(self.rules.len());
        self.rules.insert(index, rule);

        Ok(Output::ok(""))
    }

    fn rule_show(&self) -> String {
        let mut out = String::new();
        for rule in &self.rules {
            let _ = write!(out, "{}:\tfrom ", rule.pref);
            match rule.from {
                Some(from) => {
                    let _ = write!(out, "{from}");
                }
                None => out.push_str("all"),
            }
            if let Some(to) = rule.to {
                let _ = write!(out, " to {to}");
            }
            let _ = writeln!(out, " lookup {}", table_name(rule.table));
        }
        out
    }

    fn qdisc(&mut self, replace: bool, dev: &str, args: &[&str]) -> Result<Output, Output> {
        if !self.interfaces.contains_key(dev) {
            return Err(no_device(dev));
        }
        let Some((kind, params)) = args.split_first() else { return Err(usage()) };
        if *kind != "netem" {
            return Err(Output::failed(1, format!("Unknown qdisc \"{kind}\"")));
        }
        if let Some(rate) = option_value(params, "rate") {
            let valid = rate
                .strip_suffix("kbit")
                .and_then(|r| r.parse::<u64>().ok())
                .is_some_and(|r| r > 0);
            if !valid {
                return Err(Output::failed(1, format!("Illegal \"rate\": {rate}")));
            }
        }

        let policy = args.join(" ");
        let qdiscs = self.qdiscs.entry(dev.to_owned()).or_default();
        if !qdiscs.is_empty() && !replace {
            return Err(Output::failed(2, "Error: Exclusivity flag on, cannot modify."));
        }
        qdiscs.clear();
        qdiscs.push(policy);

        Ok(Output::ok(""))
    }

    fn qdisc_show(&self, dev: &str) -> Result<Output, Output> {
        if !self.interfaces.contains_key(dev) {
            return Err(no_device(dev));
        }
        let mut out = String::new();
        for policy in self.qdiscs.get(dev).into_iter().flatten() {
            let _ = writeln!(out, "qdisc {policy} root dev {dev}");
        }
        Ok(Output::ok(out))
    }

    fn sysctl_write(&mut self, assignment: &str) -> Result<Output, Output> {
        let (key, value) = assignment.split_once('=').ok_or_else(usage)?;
        let current = self.sysctls.get_mut(key).ok_or_else(|| unknown_key(key))?;
        if !matches!(value, "0" | "1") {
            return Err(Output::failed(255, format!("sysctl: setting key \"{key}\": Invalid argument")));
        }
        *current = value.to_owned();
        Ok(Output::ok(format!("{key} = {value}\n")))
    }

    fn route_lookup(&self, src: Option<Ipv4Addr>, dst: Ipv4Addr) -> Option<RouteDecision> {
        for rule in self.rules.iter().filter(|r| r.table != TABLE_LOCAL) {
            if !rule.matches(src, dst) {
                continue;
            }
            let best = self
                .tables
                .get(&rule.table)
                .into_iter()
                .flatten()
                .filter(|route| route.destination.contains(dst))
                .max_by_key(|route| route.destination.len);
            if let Some(route) = best {
                return Some(RouteDecision { table: rule.table, dev: route.dev.clone(), via: route.via });
            }
        }
        None
    }
}

/// Parses `key value` pairs.
fn options<'a>(args: &[&'a str]) -> Result<BTreeMap<&'a str, &'a str>, Output> {
    if args.len() % 2 != 0 {
        return Err(usage());
    }
    Ok(args.chunks_exact(2).map(|pair| (pair[0], pair[1])).collect())
}

fn option_value<'a>(args: &[&'a str], key: &str) -> Option<&'a str> {
    args.windows(2).find(|pair| pair[0] == key).map(|pair| pair[1])
}

fn parse_table(table: &str) -> Result<u32, Output> {
    match table {
        "main" => Ok(TABLE_MAIN),
        "local" => Ok(TABLE_LOCAL),
        "default" => Ok(TABLE_DEFAULT),
        other => other
            .parse()
            .map_err(|_| Output::failed(1, format!("Error: argument \"{other}\" is wrong: invalid table ID"))),
    }
}

fn table_name(table: u32) -> String {
    match table {
        TABLE_MAIN => "main".to_owned(),
        TABLE_LOCAL => "local".to_owned(),
        TABLE_DEFAULT => "default".to_owned(),
        other => other.to_string(),
    }
}

fn usage() -> Output {
    Output::failed(255, "Command line is not complete.")
}

fn exists() -> Output {
    Output::failed(2, "RTNETLINK answers: File exists")
}

fn no_device(dev: &str) -> Output {
    Output::failed(1, format!("Cannot find device \"{dev}\""))
}

fn invalid_prefix(prefix: &str) -> Output {
    Output::failed(1, format!("Error: any valid prefix is expected rather than \"{prefix}\"."))
}

fn unknown_key(key: &str) -> Output {
    Output::failed(255, format!("sysctl: cannot stat /proc/sys/{}: No such file or directory", key.replace('.', "/")))
}

/// A set of fake namespaces, keyed by node name.
#[derive(Debug, Default)]
pub struct FakeNetwork {
    nodes: Mutex<FxHashMap<String, FakeNode>>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node owning the given interfaces, all up and without addresses.
    pub fn with_node<I, S>(self, node: impl Into<String>, interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes.lock().insert(node.into(), FakeNode::new(interfaces));
        self
    }

    /// Makes every later command on `node` whose argv contains `pattern` exit with status 2.
    pub fn fail_matching(&self, node: &str, pattern: impl Into<String>) {
        if let Some(state) = self.nodes.lock().get_mut(node) {
            state.failures.push(pattern.into());
        }
    }

    /// Removes all injected failures from `node`.
    pub fn clear_failures(&self, node: &str) {
        if let Some(state) = self.nodes.lock().get_mut(node) {
            state.failures.clear();
        }
    }

    pub fn set_link_down(&self, node: &str, dev: &str) {
        if let Some(interface) = self.nodes.lock().get_mut(node).and_then(|n| n.interfaces.get_mut(dev)) {
            interface.up = false;
        }
    }

    /// Every command run on `node`, in order, including failed ones.
    pub fn history(&self, node: &str) -> Vec<String> {
        self.nodes
            .lock()
            .get(node)
            .map(|n| n.history.iter().map(ToString::to_string).collect())
            .unwrap_or_default()
    }

    pub fn addresses(&self, node: &str, dev: &str) -> Vec<Prefix> {
        self.nodes
            .lock()
            .get(node)
            .and_then(|n| n.interfaces.get(dev).map(|i| i.addresses.clone()))
            .unwrap_or_default()
    }

    pub fn is_up(&self, node: &str, dev: &str) -> bool {
        self.nodes.lock().get(node).and_then(|n| n.interfaces.get(dev)).is_some_and(|i| i.up)
    }

    /// The routes in `table`, including kernel-installed connected routes in main.
    pub fn routes(&self, node: &str, table: u32) -> Vec<FakeRoute> {
        self.nodes.lock().get(node).and_then(|n| n.tables.get(&table).cloned()).unwrap_or_default()
    }

    /// The rule list, sorted by priority, including the three default rules.
    pub fn rules(&self, node: &str) -> Vec<FakeRule> {
        self.nodes.lock().get(node).map(|n| n.rules.clone()).unwrap_or_default()
    }

    /// The root qdiscs on `dev`, as `kind params...`.
    pub fn qdiscs(&self, node: &str, dev: &str) -> Vec<String> {
        self.nodes.lock().get(node).and_then(|n| n.qdiscs.get(dev).cloned()).unwrap_or_default()
    }

    pub fn sysctl(&self, node: &str, key: &str) -> Option<String> {
        self.nodes.lock().get(node).and_then(|n| n.sysctls.get(key).cloned())
    }

    /// Resolves the route a packet from `src` to `dst` leaving `node` would take, walking the
    /// rule list by priority and picking the longest matching prefix in each consulted table.
    pub fn route_lookup(&self, node: &str, src: Option<Ipv4Addr>, dst: Ipv4Addr) -> Option<RouteDecision> {
        self.nodes.lock().get(node).and_then(|n| n.route_lookup(src, dst))
    }
}

#[async_trait]
impl NamespaceExec for FakeNetwork {
    async fn exec(&self, node: &str, argv: &Argv) -> command::Result<Output> {
        if argv.is_empty() {
            return Err(command::Error::Empty);
        }

        let mut nodes = self.nodes.lock();
        let Some(state) = nodes.get_mut(node) else {
            return Ok(Output::failed(
                1,
                format!("Cannot open network namespace \"{node}\": No such file or directory"),
            ));
        };

        let output = state.run(argv);
        tracing::trace!(node, %argv, status = output.status, "fake exec");
        Ok(output)
    }
}
