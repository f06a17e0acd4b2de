//! Server bootstrap: recovery, the executor task, the accept loop.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection;
use crate::engine::{self, Engine, EngineHandle};

/// Capacity of the connection → executor channel. Acts as the
/// backpressure valve under pipelined load.
const COMMAND_CHANNEL: usize = 4096;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    if config.daemonize {
        warn!("daemonize is ignored; run under a process supervisor instead");
    }
    if let Err(e) = std::fs::write(&config.pidfile, format!("{}\n", std::process::id())) {
        debug!(path = %config.pidfile.display(), "cannot write pidfile: {e}");
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (msg_tx, msg_rx) = mpsc::channel(COMMAND_CHANNEL);

    let mut engine = Engine::new(Arc::clone(&config), events_tx)?;
    engine.load_data()?;
    engine.start_initial_replication();
    tokio::spawn(engine::run(engine, msg_rx, events_rx));

    let listener = TcpListener::bind(format!("{}:{}", config.bind, config.port)).await?;
    info!(addr = %listener.local_addr()?, "ready to accept connections");

    let handle = EngineHandle { tx: msg_tx };
    // ids 0 and u64::MAX are reserved for the synthetic clients
    let mut next_client_id: u64 = 1;
    loop {
        let (stream, peer) = listener.accept().await?;
        next_client_id += 1;
        let id = next_client_id;
        debug!(%peer, client = id, "accepted connection");
        let _ = stream.set_nodelay(true);
        tokio::spawn(connection::handle(
            stream,
            handle.clone(),
            Arc::clone(&config),
            id,
        ));
    }
}
