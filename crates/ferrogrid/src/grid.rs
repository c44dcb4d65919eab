//! Grid server accepting agent connections

use crate::client::GridClient;
use crate::config::GridConf;
use crate::error::GridError;
use crate::file_manager::FileManager;
use crate::selector::TokenRegistry;
use async_trait::async_trait;
use ferrogrid_proto::message::{ErrorCode, ErrorDetails};
use ferrogrid_proto::{AgentRegistration, Peer, Request, RequestHandler, Response};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
struct AgentHandle {
    connection: Uuid,
    agent_url: String,
    peer: Peer,
}

/// State shared by the server tasks and the clients
pub(crate) struct GridState {
    pub(crate) conf: GridConf,
    pub(crate) tokens: TokenRegistry,
    pub(crate) files: FileManager,
    agents: RwLock<HashMap<String, AgentHandle>>,
}

impl GridState {
    fn new(conf: GridConf) -> Self {
        let files = FileManager::new(conf.file_manager_dir.clone());
        Self {
            conf,
            tokens: TokenRegistry::new(),
            files,
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Connection to an agent
    pub(crate) fn agent_peer(&self, agent_id: &str) -> Result<Peer, GridError> {
        self.agents
            .read()
            .get(agent_id)
            .map(|agent| agent.peer.clone())
            .ok_or_else(|| GridError::AgentUnavailable(agent_id.to_string()))
    }

    fn register_agent(&self, connection: Uuid, peer: Peer, registration: &AgentRegistration) {
        let previous = self.agents.write().insert(
            registration.agent_id.clone(),
            AgentHandle {
                connection,
                agent_url: registration.agent_url.clone(),
                peer,
            },
        );
        let added = self.tokens.register(registration);
        match previous {
            Some(previous) if previous.connection == connection => {
                debug!(agent = %registration.agent_id, "Agent keepalive")
            }
            _ => info!(
                agent = %registration.agent_id,
                url = %registration.agent_url,
                tokens = registration.tokens.len(),
                added,
                "Agent registered"
            ),
        }
    }

    fn unregister_agent(&self, agent_id: &str) {
        self.agents.write().remove(agent_id);
        let invalidated = self.tokens.invalidate_agent(agent_id);
        info!(agent = %agent_id, invalidated, "Agent unregistered");
    }

    fn disconnect_agent(&self, agent_id: &str, connection: Uuid) {
        let mut agents = self.agents.write();
        let current = agents.get(agent_id).map(|agent| agent.connection);
        if current != Some(connection) {
            return;
        }
        if let Some(agent) = agents.remove(agent_id) {
            warn!(agent = %agent_id, url = %agent.agent_url, "Agent disconnected");
        }
        drop(agents);
        self.tokens.invalidate_agent(agent_id);
    }
}

/// Serves the requests an agent sends over its connection
struct AgentConnectionHandler {
    connection: Uuid,
    state: Arc<GridState>,
    peer: watch::Receiver<Option<Peer>>,
    agents: Mutex<HashSet<String>>,
}

impl AgentConnectionHandler {
    async fn peer(&self) -> Option<Peer> {
        let mut peer = self.peer.clone();
        loop {
            let current = peer.borrow_and_update().clone();
            if current.is_some() {
                return current;
            }
            if peer.changed().await.is_err() {
                return None;
            }
        }
    }
}

#[async_trait]
impl RequestHandler for AgentConnectionHandler {
    async fn handle(&self, request: Request) -> Response {
        let request_id = request.id();
        match request {
            Request::RegisterTokens { registration, .. } => {
                let Some(peer) = self.peer().await else {
                    return Response::error(
                        request_id,
                        ErrorDetails::new(ErrorCode::InternalError, "Connection closed during registration"),
                    );
                };
                self.agents.lock().insert(registration.agent_id.clone());
                self.state.register_agent(self.connection, peer, &registration);
                Response::ack(request_id)
            }
            Request::UnregisterAgent { agent_id, .. } => {
                self.agents.lock().remove(&agent_id);
                self.state.unregister_agent(&agent_id);
                Response::ack(request_id)
            }
            Request::FetchFile { file, .. } => match self.state.files.fetch(&file).await {
                Ok(payload) => Response::FileContent { request_id, payload },
                Err(GridError::FileNotFound(file)) => Response::error(
                    request_id,
                    ErrorDetails::new(ErrorCode::NotFound, format!("File {} is not registered", file))
                        .with_context("fileId", file.file_id)
                        .with_context("version", file.version),
                ),
                Err(e) => Response::error(request_id, ErrorDetails::new(ErrorCode::InternalError, e.to_string())),
            },
            Request::Ping { timestamp, .. } => Response::pong(request_id, timestamp),
            other => Response::error(
                request_id,
                ErrorDetails::new(
                    ErrorCode::Unsupported,
                    format!("The grid does not serve {} requests", other.kind()),
                ),
            ),
        }
    }
}

async fn serve_connection(stream: TcpStream, address: SocketAddr, state: Arc<GridState>) {
    let connection = Uuid::new_v4();
    let (peer_tx, peer_rx) = watch::channel(None);
    let handler = Arc::new(AgentConnectionHandler {
        connection,
        state: state.clone(),
        peer: peer_rx,
        agents: Mutex::new(HashSet::new()),
    });
    let peer = Peer::spawn(address.to_string(), stream, handler.clone());
    let _ = peer_tx.send(Some(peer.clone()));
    debug!(%address, %connection, "Agent connection accepted");

    peer.closed().await;
    let agents: Vec<String> = handler.agents.lock().drain().collect();
    for agent_id in agents {
        state.disconnect_agent(&agent_id, connection);
    }
    debug!(%address, %connection, "Agent connection closed");
}

async fn accept_loop(listener: TcpListener, state: Arc<GridState>) {
    loop {
        match listener.accept().await {
            Ok((stream, address)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(%address, error = %e, "Failed to disable Nagle's algorithm");
                }
                tokio::spawn(serve_connection(stream, address, state.clone()));
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept agent connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn keepalive_loop(state: Arc<GridState>) {
    let period = state.conf.keepalive_check_period();
    let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticks.tick().await;
        state.tokens.invalidate_expired(state.conf.token_keepalive_timeout());
    }
}

/// A running grid: accepts agents, tracks their tokens and serves their
/// file downloads
pub struct Grid {
    state: Arc<GridState>,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Grid {
    /// Bind the configured address and start serving
    pub async fn bind(conf: GridConf) -> Result<Self, GridError> {
        conf.validate()?;
        let listener = TcpListener::bind(&conf.bind).await?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(GridState::new(conf));

        let tasks = vec![
            tokio::spawn(accept_loop(listener, state.clone())),
            tokio::spawn(keepalive_loop(state.clone())),
        ];
        info!(%local_addr, "Grid listening");
        Ok(Self {
            state,
            local_addr,
            tasks,
        })
    }

    /// Address agents connect to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Client dispatching work through this grid
    pub fn client(&self) -> GridClient {
        GridClient::new(self.state.clone())
    }

    /// Tokens known to the grid
    pub fn tokens(&self) -> &TokenRegistry {
        &self.state.tokens
    }

    /// Files served to agents
    pub fn files(&self) -> &FileManager {
        &self.state.files
    }

    /// Ids of the connected agents, sorted
    pub fn connected_agents(&self) -> Vec<String> {
        let mut agents: Vec<_> = self.state.agents.read().keys().cloned().collect();
        agents.sort();
        agents
    }

    /// Stop accepting agents and close every agent connection
    pub async fn shutdown(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let peers: Vec<Peer> = self.state.agents.read().values().map(|agent| agent.peer.clone()).collect();
        for peer in peers {
            peer.close().await;
        }
        info!("Grid stopped");
    }
}

impl Drop for Grid {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
