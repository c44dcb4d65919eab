//! In-process execution of local tokens.
//!
//! A local token runs its input messages inside the controller, with the same
//! dispatcher an agent uses. Handler packages are read straight from the
//! grid's file manager instead of being downloaded over a connection.

use crate::error::GridError;
use crate::grid::GridState;
use async_trait::async_trait;
use ferrogrid_agent::{
    AgentServices, AgentToken, ContextLoader, Dispatcher, FileCache, FileCacheError, FileProvider, HandlerRegistry,
    TokenPool,
};
use ferrogrid_agent::handlers::builtin_catalog;
use ferrogrid_proto::{FilePayload, FileVersionId, InputMessage, OutputMessage};
use ferrogrid_wasm::{WasmConfig, WasmRuntime};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Agent id carried by local tokens
pub const LOCAL_AGENT_ID: &str = "local";

/// Agent address carried by local tokens
pub const LOCAL_AGENT_URL: &str = "localhost";

/// Serves the controller's registered files to the local file cache
struct FileManagerProvider {
    state: Arc<GridState>,
}

#[async_trait]
impl FileProvider for FileManagerProvider {
    async fn fetch(&self, file: &FileVersionId) -> Result<FilePayload, FileCacheError> {
        self.state.files.fetch(file).await.map_err(|e| FileCacheError::Download {
            file: file.clone(),
            message: e.to_string(),
        })
    }
}

/// Dispatcher and tokens of the controller's in-process agent
pub(crate) struct LocalAgent {
    pool: Arc<TokenPool>,
    dispatcher: Dispatcher,
}

impl LocalAgent {
    /// Build the local agent. Must be called inside a tokio runtime.
    pub(crate) fn start(state: Arc<GridState>) -> Result<Self, GridError> {
        let work_dir = local_agent_dir(&state);
        let provider = Arc::new(FileManagerProvider { state: state.clone() });
        let file_cache = FileCache::open(work_dir.clone(), provider).map_err(|e| GridError::LocalAgent(e.to_string()))?;
        let wasm_runtime =
            WasmRuntime::with_config(WasmConfig::default()).map_err(|e| GridError::LocalAgent(e.to_string()))?;

        let services = AgentServices::new(
            LOCAL_AGENT_ID,
            LOCAL_AGENT_URL,
            Arc::new(file_cache),
            Arc::new(wasm_runtime),
            tokio::runtime::Handle::current(),
        );
        let pool = Arc::new(TokenPool::new());
        let dispatcher = Dispatcher::new(
            pool.clone(),
            ContextLoader::new(builtin_catalog()),
            Arc::new(HandlerRegistry::new(services)),
        );

        info!(dir = %work_dir.display(), "Local agent started");
        Ok(Self { pool, dispatcher })
    }

    /// Add a token with a fresh session
    pub(crate) fn offer(&self, uid: &str) {
        self.pool.offer(AgentToken {
            uid: uid.to_string(),
            agent_id: LOCAL_AGENT_ID.to_string(),
            attributes: HashMap::new(),
            selection_patterns: HashMap::new(),
            properties: HashMap::new(),
            capacity: 1,
        });
    }

    /// Run `input` on a local token
    pub(crate) async fn process(&self, uid: &str, input: InputMessage) -> OutputMessage {
        self.dispatcher.process(uid, input).await
    }

    /// Drop a local token and its session
    pub(crate) fn remove(&self, uid: &str) -> bool {
        let removed = self.pool.remove(uid).is_some();
        debug!(token = %uid, removed, "Local token dropped");
        removed
    }
}

fn local_agent_dir(state: &GridState) -> PathBuf {
    match &state.conf.local_agent_dir {
        Some(dir) => dir.clone(),
        None => std::env::temp_dir().join(format!("ferrogrid-local-{}", std::process::id())),
    }
}
