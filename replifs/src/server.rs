//! Node assembly: storage engine, consensus node, peer transport and the
//! serving surfaces, started together and stopped in reverse order.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::RuntimeConfig;
use crate::error::FsError;
use crate::lock_table::LockTable;
use crate::metrics;
use crate::raft::node::Node;
use crate::raft::transport;
use crate::rpc::RpcServer;
use crate::state_fs::{FsHandle, LeaderState, StateFs};
use crate::storage::LocalStorage;

const MAILBOX_SIZE: usize = 1024;
const PROPOSAL_QUEUE_SIZE: usize = 1024;

pub struct Server {
    rpc: RpcServer,
    peer_task: tokio::task::JoinHandle<()>,
    handle: FsHandle,
}

impl Server {
    /// Brings up a replica from its configuration.
    pub async fn start(config: &RuntimeConfig) -> Result<Server, FsError> {
        let peers = config.peers().map_err(FsError::Raft)?;
        let node_id = config.self_id().map_err(FsError::Raft)?;
        let voters: Vec<u64> = (1..=peers.len() as u64).collect();
        let peer_names: HashMap<u64, String> = config.peer_names().map_err(FsError::Raft)?;
        let peer_addrs: HashMap<u64, String> = config.peer_addrs().map_err(FsError::Raft)?;

        let storage = Arc::new(LocalStorage::new(&config.base_path));
        storage.init()?;
        let locks = Arc::new(LockTable::new());
        let shared = Arc::new(LeaderState::default());
        let state_machine = StateFs::new(node_id, storage.clone(), locks.clone(), shared.clone());

        let bind_addr = peers[(node_id - 1) as usize].addr.clone();
        let peer_listener = TcpListener::bind(&bind_addr).await?;
        let (in_tx, in_rx) = mpsc::channel(MAILBOX_SIZE);
        let peer_task = tokio::spawn(transport::serve_peers(peer_listener, in_tx));

        let (proposal_tx, proposal_rx) = mpsc::channel(PROPOSAL_QUEUE_SIZE);
        let out_mailbox = Node::start(
            node_id,
            voters,
            Path::new(&config.raft_path),
            config.election_timeout_ms,
            config.snapshot_interval_s,
            in_rx,
            proposal_rx,
            state_machine,
        )?;
        transport::start_sender(out_mailbox, peer_addrs);

        let handle = FsHandle::new(
            proposal_tx,
            shared,
            Arc::new(peer_names),
            storage,
            locks,
        );

        let mut rpc = RpcServer::new(
            format!("{}:{}", config.rpc_addr, config.rpc_port),
            handle.clone(),
        );
        rpc.start().await?;

        metrics::init_registry();
        match config.metrics_addr.parse() {
            Ok(addr) => metrics::serve(addr),
            Err(e) => log::warn!("invalid metrics_addr {}: {e}", config.metrics_addr),
        }

        log::info!(
            "replica started - peer {}, group {}",
            config.peer_addr,
            config.group_id
        );
        Ok(Server {
            rpc,
            peer_task,
            handle,
        })
    }

    /// A local façade over this replica, usable without the RPC surface.
    pub fn handle(&self) -> FsHandle {
        self.handle.clone()
    }

    pub fn rpc(&self) -> &RpcServer {
        &self.rpc
    }

    /// Stops serving: RPC first, then the consensus side. Dropping the last
    /// proposal sender ends the node loop.
    pub async fn stop(mut self) {
        self.rpc.stop().await;
        self.peer_task.abort();
        log::info!("server stopped");
    }
}
