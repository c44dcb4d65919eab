//! Agent main loop: grid connection, registration and request serving

use crate::config::AgentConf;
use crate::context::ContextLoader;
use crate::dispatcher::Dispatcher;
use crate::error::{FileCacheError, TokenPoolError};
use crate::file_cache::{FileCache, FileProvider};
use crate::handler::AgentServices;
use crate::handlers::builtin_catalog;
use crate::registry::HandlerRegistry;
use crate::token_pool::{AgentToken, TokenPool};
use anyhow::{Context, Result};
use async_trait::async_trait;
use ferrogrid_proto::message::{ErrorCode, ErrorDetails};
use ferrogrid_proto::{
    AgentRegistration, FilePayload, FileVersionId, Peer, ProtocolError, Request, RequestHandler, Response,
    AGENT_TYPE_KEY, DEFAULT_AGENT_TYPE,
};
use ferrogrid_wasm::{WasmConfig, WasmRuntime};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Delay between two connection attempts
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

type PeerSlot = Arc<RwLock<Option<Peer>>>;

/// Downloads files from the grid over the current connection
pub struct GridFileProvider {
    peer: PeerSlot,
    timeout: Duration,
}

impl GridFileProvider {
    fn new(peer: PeerSlot, timeout: Duration) -> Self {
        Self { peer, timeout }
    }
}

#[async_trait]
impl FileProvider for GridFileProvider {
    async fn fetch(&self, file: &FileVersionId) -> Result<FilePayload, FileCacheError> {
        let peer = self.peer.read().clone().ok_or_else(|| FileCacheError::Download {
            file: file.clone(),
            message: "not connected to the grid".to_string(),
        })?;

        match peer.call(Request::fetch_file(file.clone()), self.timeout).await {
            Ok(Response::FileContent { payload, .. }) => {
                debug!(file = %file, size = payload.size(), "File received from grid");
                Ok(payload)
            }
            Ok(other) => Err(FileCacheError::Download {
                file: file.clone(),
                message: format!("unexpected response {:?}", other),
            }),
            Err(ProtocolError::Timeout { timeout_ms, .. }) => Err(FileCacheError::Timeout {
                file: file.clone(),
                timeout_ms,
            }),
            Err(e) => Err(FileCacheError::Download {
                file: file.clone(),
                message: e.to_string(),
            }),
        }
    }
}

/// Serves grid requests on the agent side of the connection
pub struct AgentRequestHandler {
    dispatcher: Arc<Dispatcher>,
}

impl AgentRequestHandler {
    /// Create a handler backed by `dispatcher`
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

fn token_error(request_id: Uuid, error: TokenPoolError) -> Response {
    let code = match error {
        TokenPoolError::NotFound(_) => ErrorCode::NotFound,
        _ => ErrorCode::InvalidRequest,
    };
    Response::error(request_id, ErrorDetails::new(code, error.to_string()))
}

#[async_trait]
impl RequestHandler for AgentRequestHandler {
    async fn handle(&self, request: Request) -> Response {
        let request_id = request.id();
        match request {
            Request::Process { token_id, input, .. } => Response::Output {
                request_id,
                output: self.dispatcher.process(&token_id, input).await,
            },
            Request::ReserveToken { token_id, .. } => match self.dispatcher.reserve_token(&token_id) {
                Ok(()) => Response::ack(request_id),
                Err(e) => token_error(request_id, e),
            },
            Request::ReleaseToken { token_id, .. } => match self.dispatcher.release_token(&token_id) {
                Ok(()) => Response::ack(request_id),
                Err(e) => token_error(request_id, e),
            },
            Request::ListTokens { .. } => Response::Tokens {
                request_id,
                tokens: self.dispatcher.pool().token_statuses(),
            },
            Request::Ping { timestamp, .. } => Response::pong(request_id, timestamp),
            other => Response::error(
                request_id,
                ErrorDetails::new(
                    ErrorCode::Unsupported,
                    format!("Agents do not serve {} requests", other.kind()),
                ),
            ),
        }
    }
}

/// A running agent
pub struct Agent {
    conf: AgentConf,
    agent_id: String,
    agent_url: String,
    pool: Arc<TokenPool>,
    dispatcher: Arc<Dispatcher>,
    peer: PeerSlot,
    shutdown_rx: Option<oneshot::Receiver<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Agent {
    /// Build an agent from its configuration. Must be called inside a tokio
    /// runtime.
    pub fn new(conf: AgentConf) -> Result<Self> {
        conf.validate()?;
        let runtime_handle = tokio::runtime::Handle::try_current()
            .context("The agent must be created inside a tokio runtime")?;

        let agent_id = Uuid::new_v4().to_string();
        let agent_url = format!("ferrogrid-agent://{}", agent_id);

        let wasm_runtime = Arc::new(
            WasmRuntime::with_config(WasmConfig::from(&conf.wasm)).context("Failed to create WASM runtime")?,
        );
        let peer: PeerSlot = Arc::new(RwLock::new(None));
        let provider = Arc::new(GridFileProvider::new(peer.clone(), conf.grid_read_timeout()));
        let file_cache = Arc::new(
            FileCache::open(conf.file_manager_dir(), provider).context("Failed to open the file cache")?,
        );

        let pool = Arc::new(TokenPool::new());
        for group in &conf.token_groups {
            for _ in 0..group.capacity {
                let mut attributes = group.token_conf.attributes.clone();
                attributes
                    .entry(AGENT_TYPE_KEY.to_string())
                    .or_insert_with(|| DEFAULT_AGENT_TYPE.to_string());
                pool.offer(AgentToken {
                    uid: Uuid::new_v4().to_string(),
                    agent_id: agent_id.clone(),
                    attributes,
                    selection_patterns: group.token_conf.selection_patterns.clone(),
                    properties: group.token_conf.properties.clone(),
                    capacity: group.capacity,
                });
            }
        }

        let services = AgentServices::new(&agent_id, &agent_url, file_cache, wasm_runtime, runtime_handle)
            .with_properties(conf.properties.clone());
        let registry = Arc::new(HandlerRegistry::new(services));
        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            ContextLoader::new(builtin_catalog()),
            registry,
        ));

        info!(agent = %agent_id, tokens = pool.len(), "Agent created");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        Ok(Self {
            conf,
            agent_id,
            agent_url,
            pool,
            dispatcher,
            peer,
            shutdown_rx: Some(shutdown_rx),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Agent identity
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Token pool
    pub fn pool(&self) -> &Arc<TokenPool> {
        &self.pool
    }

    /// Dispatcher serving process requests
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Whether the agent is currently connected to the grid
    pub fn is_connected(&self) -> bool {
        self.peer.read().as_ref().map_or(false, |peer| !peer.is_closed())
    }

    /// Get shutdown sender for graceful shutdown
    pub fn shutdown_sender(&mut self) -> Option<oneshot::Sender<()>> {
        self.shutdown_tx.take()
    }

    /// Run until shut down, reconnecting whenever the grid connection drops
    pub async fn run(&mut self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_rx.take().context("Shutdown receiver already taken")?;
        let handler = Arc::new(AgentRequestHandler::new(self.dispatcher.clone()));

        let mut registration = interval(self.conf.registration_period());
        registration.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut eviction = interval(self.conf.session_eviction_period());
        eviction.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(agent = %self.agent_id, grid = %self.conf.grid_host, "Starting agent");
        loop {
            let peer = tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Received shutdown signal before connecting");
                    return Ok(());
                }
                peer = self.connect(handler.clone()) => peer,
            };
            *self.peer.write() = Some(peer.clone());

            match self.register(&peer).await {
                Ok(()) => info!(tokens = self.pool.len(), "Tokens registered with the grid"),
                Err(e) => warn!(error = %e, "Token registration failed"),
            }
            registration.reset();

            let shutdown = loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break true,
                    _ = peer.closed() => break false,
                    _ = registration.tick() => {
                        if let Err(e) = self.register(&peer).await {
                            warn!(error = %e, "Token keepalive failed");
                        }
                    }
                    _ = eviction.tick() => self.evict_idle_sessions(),
                }
            };
            *self.peer.write() = None;

            if shutdown {
                info!("Received shutdown signal, unregistering");
                let request = Request::unregister_agent(self.agent_id.clone());
                if let Err(e) = peer.call(request, self.conf.grid_read_timeout()).await {
                    warn!(error = %e, "Failed to unregister from the grid");
                }
                peer.close().await;
                info!("Agent stopped");
                return Ok(());
            }
            warn!("Connection to the grid lost, reconnecting");
        }
    }

    async fn connect(&self, handler: Arc<AgentRequestHandler>) -> Peer {
        loop {
            match TcpStream::connect(&self.conf.grid_host).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(grid = %self.conf.grid_host, error = %e, "Failed to disable Nagle's algorithm");
                    }
                    info!(grid = %self.conf.grid_host, "Connected to the grid");
                    return Peer::spawn("grid", stream, handler);
                }
                Err(e) => {
                    debug!(grid = %self.conf.grid_host, error = %e, "Grid not reachable");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    async fn register(&self, peer: &Peer) -> Result<()> {
        let registration = AgentRegistration {
            agent_id: self.agent_id.clone(),
            agent_url: self.agent_url.clone(),
            tokens: self.pool.token_descriptors(),
        };
        match peer
            .call(Request::register_tokens(registration), self.conf.grid_read_timeout())
            .await?
        {
            Response::Ack { .. } => {
                debug!("Registration acknowledged");
                Ok(())
            }
            other => Err(ProtocolError::UnexpectedResponse(format!("{:?}", other)).into()),
        }
    }

    /// Close the sessions of tokens idle for longer than the configured timeout
    pub fn evict_idle_sessions(&self) {
        let evicted = self.pool.evict_idle_sessions(self.conf.token_session_idle_timeout());
        for session in &evicted {
            session.session.lock().close();
        }
        let purged = self.dispatcher.registry().purge_unused();
        if !evicted.is_empty() || purged > 0 {
            debug!(sessions = evicted.len(), handlers = purged, "Idle resources released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenConf;
    use ferrogrid_proto::{AgentErrorCode, InputMessage, Interest};
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Grid side of the test connection
    struct FakeGrid {
        registrations: mpsc::UnboundedSender<AgentRegistration>,
        fetch_delay: Duration,
    }

    #[async_trait]
    impl RequestHandler for FakeGrid {
        async fn handle(&self, request: Request) -> Response {
            let request_id = request.id();
            match request {
                Request::RegisterTokens { registration, .. } => {
                    let _ = self.registrations.send(registration);
                    Response::ack(request_id)
                }
                Request::FetchFile { file, .. } => {
                    tokio::time::sleep(self.fetch_delay).await;
                    Response::error(request_id, ErrorDetails::new(ErrorCode::NotFound, format!("{}", file)))
                }
                _ => Response::ack(request_id),
            }
        }
    }

    fn conf(dir: &TempDir, grid_host: String) -> AgentConf {
        let mut conf = AgentConf::default()
            .with_grid_host(grid_host)
            .with_working_dir(dir.path())
            .with_token_group(
                1,
                TokenConf::default()
                    .with_attribute("att1", "val1")
                    .with_selection_pattern("team", Interest::new("qa", true).unwrap()),
            );
        conf.grid_read_timeout_ms = 200;
        conf
    }

    async fn start_agent(
        dir: &TempDir,
        fetch_delay: Duration,
    ) -> (Peer, AgentRegistration, oneshot::Sender<()>, tokio::task::JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut agent = Agent::new(conf(dir, listener.local_addr().unwrap().to_string())).unwrap();
        let shutdown = agent.shutdown_sender().unwrap();
        let running = tokio::spawn(async move { agent.run().await });

        let (stream, _) = listener.accept().await.unwrap();
        let (registrations_tx, mut registrations_rx) = mpsc::unbounded_channel();
        let grid = Peer::spawn(
            "agent",
            stream,
            Arc::new(FakeGrid {
                registrations: registrations_tx,
                fetch_delay,
            }),
        );
        let registration = registrations_rx.recv().await.unwrap();
        (grid, registration, shutdown, running)
    }

    #[tokio::test]
    async fn test_agent_registers_and_processes() {
        let dir = TempDir::new().unwrap();
        let (grid, registration, shutdown, running) = start_agent(&dir, Duration::ZERO).await;

        assert_eq!(registration.tokens.len(), 1);
        let token = &registration.tokens[0];
        assert_eq!(token.attributes.get("att1"), Some(&"val1".to_string()));
        assert_eq!(token.attributes.get(AGENT_TYPE_KEY), Some(&DEFAULT_AGENT_TYPE.to_string()));
        assert!(token.selection_patterns.contains_key("team"));

        let input = InputMessage::new("f", "echo", json!({"arg1": "val1"}));
        let response = grid
            .call(Request::process(token.uid.clone(), input), Duration::from_secs(5))
            .await
            .unwrap();
        match response {
            Response::Output { output, .. } => assert_eq!(output.payload, Some(json!({"arg1": "val1"}))),
            other => panic!("unexpected response: {:?}", other),
        }

        let pong = grid.call(Request::ping(), Duration::from_secs(5)).await.unwrap();
        assert!(matches!(pong, Response::Pong { .. }));

        shutdown.send(()).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_agent_lists_tokens() {
        let dir = TempDir::new().unwrap();
        let (grid, registration, shutdown, running) = start_agent(&dir, Duration::ZERO).await;

        let response = grid.call(Request::list_tokens(), Duration::from_secs(5)).await.unwrap();
        match response {
            Response::Tokens { tokens, .. } => {
                assert_eq!(tokens.len(), 1);
                assert_eq!(tokens[0].descriptor, registration.tokens[0]);
                assert!(!tokens[0].reserved);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        shutdown.send(()).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reserve_unknown_token() {
        let dir = TempDir::new().unwrap();
        let (grid, registration, shutdown, running) = start_agent(&dir, Duration::ZERO).await;

        let ok = grid
            .call(Request::reserve_token(registration.tokens[0].uid.clone()), Duration::from_secs(5))
            .await;
        assert!(matches!(ok, Ok(Response::Ack { .. })));

        let missing = grid.call(Request::release_token("unknown"), Duration::from_secs(5)).await;
        match missing {
            Err(ProtocolError::Remote(details)) => assert_eq!(details.code, ErrorCode::NotFound),
            other => panic!("unexpected result: {:?}", other),
        }

        shutdown.send(()).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_download_timeout_reported() {
        let dir = TempDir::new().unwrap();
        let (grid, registration, shutdown, running) = start_agent(&dir, Duration::from_secs(2)).await;

        let input = InputMessage::new("f", "handler", json!({}))
            .with_handler_package(FileVersionId::new("slow", "1"));
        let response = grid
            .call(Request::process(registration.tokens[0].uid.clone(), input), Duration::from_secs(5))
            .await
            .unwrap();

        let output = match response {
            Response::Output { output, .. } => output,
            other => panic!("unexpected response: {:?}", other),
        };
        let agent_error = output.agent_error.unwrap();
        assert_eq!(agent_error.code, AgentErrorCode::ContextBuilderFileDownloadTimeout);
        assert_eq!(agent_error.details.get("timeout"), Some(&"200".to_string()));
        assert_eq!(agent_error.details.get("fileId"), Some(&"slow".to_string()));

        shutdown.send(()).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_download_error_reported() {
        let dir = TempDir::new().unwrap();
        let (grid, registration, shutdown, running) = start_agent(&dir, Duration::ZERO).await;

        let input = InputMessage::new("f", "handler", json!({}))
            .with_handler_package(FileVersionId::new("missing", "1"));
        let response = grid
            .call(Request::process(registration.tokens[0].uid.clone(), input), Duration::from_secs(5))
            .await
            .unwrap();

        let Response::Output { output, .. } = response else {
            panic!("expected an output");
        };
        assert_eq!(
            output.agent_error.unwrap().code,
            AgentErrorCode::ContextBuilderFileDownloadError
        );

        shutdown.send(()).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_before_connecting() {
        let dir = TempDir::new().unwrap();
        let mut agent = Agent::new(conf(&dir, "127.0.0.1:1".to_string())).unwrap();
        let shutdown = agent.shutdown_sender().unwrap();
        assert!(agent.shutdown_sender().is_none());

        let running = tokio::spawn(async move { agent.run().await });
        shutdown.send(()).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_configuration_rejected() {
        let dir = TempDir::new().unwrap();
        let conf = conf(&dir, String::new());
        assert!(Agent::new(conf).is_err());
    }
}
