//! Whole-topology orchestration.
//!
//! A [`Network`] takes a validated [`Topology`] through setup and teardown:
//!
//! 1. Plan every node. Hosts are planned first so their tables are registered, then routers
//!    take the gateway addresses of the hosts they link to.
//! 2. Configure every node. Routers get forwarding enabled and their addresses; multi-homed
//!    hosts get per-interface tables and rules; single-homed hosts get an address and a
//!    default route.
//! 3. Shape every link declaring a bandwidth.
//!
//! The steps of one node run sequentially, since rule order within a namespace matters. Distinct
//! nodes share nothing and are configured concurrently. A failing node does not stop its
//! siblings: setup runs to completion and returns a [`SetupReport`] listing what failed. Setup
//! is idempotent, so the report's failures can be fixed and setup run again.

use std::{future::Future, sync::Arc};

use futures::future::join_all;
use mhroute_netns::NamespaceExec;
use rustc_hash::FxHashMap;
use tracing::Instrument as _;

use crate::{
    forwarding::{ForwardingController, ForwardingState, ForwardingToggleError},
    plan::{self, InterfaceAddressing, PlanError, RoutingPlanEntry, TableRegistry},
    routing::{PolicyRouter, RoutingApplyError, RoutingDump},
    shaping::{Shaper, ShapingError},
    topology::{Node, Topology, TopologyError},
};

/// Errors that can occur while setting up or tearing down a network.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid topology: {0}")]
    Topology(#[from] TopologyError),

    #[error("planning failed: {0}")]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Routing(#[from] RoutingApplyError),

    #[error(transparent)]
    Shaping(#[from] ShapingError),

    #[error(transparent)]
    Forwarding(#[from] ForwardingToggleError),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("{}", setup_summary(.0))]
    Setup(Vec<Failure>),
}

fn setup_summary(failures: &[Failure]) -> String {
    match failures.first() {
        Some(first) => format!("{} failure(s), first: {first}", failures.len()),
        None => "setup failed".to_owned(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// What a node needs configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodePlan {
    /// Interface addresses only.
    Router(Vec<InterfaceAddressing>),
    /// One address and a main-table default route.
    SingleHomed(InterfaceAddressing),
    /// One routing table and two rules per interface.
    MultiHomed(Vec<RoutingPlanEntry>),
}

/// A failed node or link.
#[derive(Debug, thiserror::Error)]
#[error("{scope}: {error}")]
pub struct Failure {
    /// Node name, or link endpoints for shaping failures.
    pub scope: String,
    pub error: Box<Error>,
}

impl Failure {
    fn new(scope: impl Into<String>, error: impl Into<Error>) -> Self {
        Self { scope: scope.into(), error: Box::new(error.into()) }
    }
}

/// Outcome of [`Network::setup`] or [`Network::teardown`].
#[derive(Debug, Default)]
pub struct SetupReport {
    pub failures: Vec<Failure>,
}

impl SetupReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// The first failure recorded for `scope`.
    pub fn failure(&self, scope: &str) -> Option<&Error> {
        self.failures.iter().find(|f| f.scope == scope).map(|f| f.error.as_ref())
    }

    pub fn into_result(self) -> Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Setup(self.failures))
        }
    }
}

/// A topology bound to the namespaces it is configured in.
#[derive(Debug)]
pub struct Network {
    topology: Topology,
    exec: Arc<dyn NamespaceExec>,
    tables: TableRegistry,
    plans: FxHashMap<String, NodePlan>,
    forwarding: FxHashMap<String, ForwardingController>,
}

impl Network {
    /// Validates `topology`. Nothing is executed until [`Network::setup`].
    pub fn new(topology: Topology, exec: Arc<dyn NamespaceExec>) -> Result<Self> {
        topology.validate()?;

        let forwarding = topology
            .routers()
            .map(|r| (r.name.clone(), ForwardingController::new(&r.name)))
            .collect();

        Ok(Self {
            topology,
            exec,
            tables: TableRegistry::default(),
            plans: FxHashMap::default(),
            forwarding,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The tables registered so far.
    pub fn tables(&self) -> &TableRegistry {
        &self.tables
    }

    /// The plan computed for `node` by the last setup, if planning succeeded.
    pub fn plan(&self, node: &str) -> Option<&NodePlan> {
        self.plans.get(node)
    }

    /// Forwarding state of a router, `None` for hosts.
    pub fn forwarding_state(&self, router: &str) -> Option<ForwardingState> {
        self.forwarding.get(router).map(|c| c.state())
    }

    /// Plans, configures and shapes the whole topology.
    #[tracing::instrument(skip_all)]
    pub async fn setup(&mut self) -> SetupReport {
        let mut report = SetupReport::default();

        self.plan_all(&mut report);

        let exec = &*self.exec;
        let tables = &self.tables;
        let plans = &self.plans;

        let routers = join_all(self.forwarding.iter_mut().map(|(name, controller)| {
            let span = tracing::info_span!("router", node = %name);
            let setup = async move {
                // A router whose planning failed is left untouched.
                let Some(NodePlan::Router(addressing)) = plans.get(name) else {
                    return Ok::<_, Error>(());
                };
                controller.start(exec).await?;
                PolicyRouter::new(exec, tables).apply_router(name, addressing).await?;
                Ok::<_, Error>(())
            };
            scoped(name, setup.instrument(span))
        }));

        let hosts = join_all(self.topology.hosts().filter_map(|host| {
            let plan = plans.get(&host.name)?;
            let span = tracing::info_span!("host", node = %host.name);
            let router = PolicyRouter::new(exec, tables);
            let future = async move {
                match plan {
                    NodePlan::MultiHomed(entries) => router.apply(&host.name, entries).await?,
                    NodePlan::SingleHomed(addressing) => {
                        router.apply_single_homed(&host.name, addressing).await?
                    }
                    NodePlan::Router(_) => {}
                }
                Ok::<_, Error>(())
            };
            Some(scoped(&host.name, future.instrument(span)))
        }));

        let (routers, hosts) = futures::join!(routers, hosts);
        report.failures.extend(routers.into_iter().chain(hosts).flatten());

        let shaper = Shaper::new(exec, &self.topology);
        for link in &self.topology.links {
            if let Err(e) = shaper.shape_link(link).await {
                report.failures.push(Failure::new(format!("{} <-> {}", link.a, link.b), e));
            }
        }

        if report.is_success() {
            tracing::info!(tables = self.tables.len(), "network set up");
        } else {
            tracing::warn!(failures = report.failures.len(), "network set up with failures");
        }
        report
    }

    /// Plans hosts, registering their tables, then routers.
    fn plan_all(&mut self, report: &mut SetupReport) {
        let hosts = self.topology.hosts();
        let routers = self.topology.routers();

        for node in hosts.chain(routers) {
            match plan_node(&self.topology, &mut self.tables, node) {
                Ok(Some(plan)) => {
                    self.plans.insert(node.name.clone(), plan);
                }
                Ok(None) => {
                    tracing::debug!(node = %node.name, "no interfaces, nothing to plan");
                }
                Err(e) => {
                    tracing::warn!(node = %node.name, ?e, "planning failed");
                    self.plans.remove(&node.name);
                    report.failures.push(Failure::new(&node.name, e));
                }
            }
        }
    }

    /// Disables forwarding on every router.
    #[tracing::instrument(skip_all)]
    pub async fn teardown(&mut self) -> SetupReport {
        let exec = &*self.exec;
        let results = join_all(
            self.forwarding
                .iter_mut()
                .map(|(name, controller)| scoped(name, async move { controller.stop(exec).await })),
        )
        .await;

        SetupReport { failures: results.into_iter().flatten().collect() }
    }

    /// The rule list and routing tables of `node`.
    pub async fn dump(&self, node: &str) -> Result<RoutingDump> {
        if self.topology.get(node).is_none() {
            return Err(Error::NodeNotFound(node.to_owned()));
        }
        Ok(PolicyRouter::new(&*self.exec, &self.tables).dump(node).await?)
    }
}

fn plan_node(
    topology: &Topology,
    tables: &mut TableRegistry,
    node: &Node,
) -> std::result::Result<Option<NodePlan>, PlanError> {
    if node.is_router() {
        let addressing = plan::router_addressing(topology, node)?;
        return Ok((!addressing.is_empty()).then_some(NodePlan::Router(addressing)));
    }

    if node.is_multi_homed() {
        let entries = plan::plan(node)?;
        tables.register(&node.name, &entries)?;
        return Ok(Some(NodePlan::MultiHomed(entries)));
    }

    Ok(plan::addressing(node)?.into_iter().next().map(NodePlan::SingleHomed))
}

/// Awaits a node's setup, turning its error into a [`Failure`] scoped to the node.
async fn scoped<E>(scope: &str, setup: impl Future<Output = std::result::Result<(), E>>) -> Option<Failure>
where
    E: Into<Error>,
{
    let error = setup.await.err()?;
    let failure = Failure::new(scope, error);
    tracing::warn!(%failure, "node setup failed");
    Some(failure)
}
