//! A server behind a router, and a client reaching the router over three links of different
//! bandwidth.
//!
//! By default every command is only logged. Pass `--apply` to run them for real, which needs
//! namespaces `router`, `server` and `client` with the interfaces below already created.
//!
//! ```sh
//! RUST_LOG=info cargo run --example three_path
//! sudo -E cargo run --example three_path -- --apply
//! ```

use std::sync::Arc;

use mhroute::{AddressScheme, Link, Network, Node, Topology};
use mhroute_netns::{DryRunExecutor, NamespaceExec, NetnsExecutor};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let topology = Topology::new()
        .node(Node::router("router", 4))
        .node(Node::host("server", 1, AddressScheme::new(10, 24)))
        .node(Node::host("client", 3, AddressScheme::new(11, 24)))
        .link(Link::new(("router", "router-eth0"), ("server", "server-eth0")).bandwidth_kbit(5000))
        .link(Link::new(("router", "router-eth1"), ("client", "client-eth0")).bandwidth_kbit(1000))
        .link(Link::new(("router", "router-eth2"), ("client", "client-eth1")).bandwidth_kbit(750))
        .link(Link::new(("router", "router-eth3"), ("client", "client-eth2")).bandwidth_kbit(500));

    let apply = std::env::args().any(|arg| arg == "--apply");
    let exec: Arc<dyn NamespaceExec> =
        if apply { Arc::new(NetnsExecutor::new()) } else { Arc::new(DryRunExecutor) };

    let mut network = Network::new(topology, exec)?;
    network.setup().await.into_result()?;

    println!("# /etc/iproute2/rt_tables.d/mhroute.conf");
    print!("{}", network.tables().rt_tables());

    if apply {
        let dump = network.dump("client").await?;
        println!("\n# client rules\n{}\n# client routes\n{}", dump.rules, dump.routes);
    }

    network.teardown().await.into_result()?;
    Ok(())
}
