// The broker executable: read the environment, bring the subsystems up in
// dependency order, then park until ctrl-c. Kept deliberately small;
// anything with behavior worth testing lives in the subsystem crates.

use herald_admin::AdminServer;
use herald_base::{Config, Result, BASE_PORT};
use herald_net::{Broker, BrokerSink, BrokerStats, Dispatcher, Ingest, SWEEP_INTERVAL};
use herald_raft::{discover_cluster, RaftNode, RpcServer};
use herald_store::{Store, WriteGateway};
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod ops;

fn main() {
    if let Err(e) = run() {
        eprintln!("fatal: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    info!(
        "herald node {} starting: data port {}, rpc port {}, http port {}",
        config.node_id,
        config.port,
        config.rpc_port(),
        config.http_port
    );
    ops::write_pid_file(&config.pid_path())?;

    // Storage first: a store that cannot open is fatal.
    let store = Store::open(config.db_path())?;
    let gateway = Arc::new(WriteGateway::start(&store)?);

    // The cluster view is fixed from here on.
    let cluster = discover_cluster(BASE_PORT, config.max_cluster_size, config.port);

    let dispatcher = Arc::new(Dispatcher::new(&store, gateway.clone())?);
    dispatcher.spawn_sweeper(SWEEP_INTERVAL)?;
    let stats = Arc::new(BrokerStats::new());
    let sink = Arc::new(BrokerSink::new(
        gateway.clone(),
        dispatcher.clone(),
        stats.clone(),
    ));

    let raft = RaftNode::new(config.node_id_str(), cluster, sink);
    raft.run()?;
    let rpc_bind: SocketAddr = format!("127.0.0.1:{}", config.rpc_port()).parse()?;
    let mut rpc = RpcServer::serve(raft.clone(), rpc_bind)?;

    let broker = Arc::new(Broker {
        raft: raft.clone(),
        dispatcher: dispatcher.clone(),
        stats,
    });
    let mut admin = AdminServer::serve(broker.clone(), &store, config.port, &config.http_addr())?;
    ops::spawn_dead_node_sweeper(raft.clone())?;

    let mut ingest = Ingest::serve(broker, &config.data_addr())?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })?;
    let _ = shutdown_rx.recv();

    info!("shutting down");
    ingest.stop();
    admin.stop();
    dispatcher.shutdown();
    raft.shutdown();
    rpc.stop();
    gateway.shutdown();
    ops::remove_pid_file(&config.pid_path());
    Ok(())
}
