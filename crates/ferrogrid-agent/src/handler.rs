//! Handler interface and the per-invocation execution context

use crate::file_cache::{CachedFile, FileCache};
use crate::token_pool::SharedSession;
use ferrogrid_proto::{FileVersionId, InputMessage, Measure, OutputMessage, OutputMessageBuilder};
use ferrogrid_wasm::WasmRuntime;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Slice used by [`ExecutionContext::sleep`] between interruption checks
const INTERRUPT_POLL: Duration = Duration::from_millis(10);

/// Code invoked with an input message to produce an output message.
///
/// Handlers run on a blocking worker thread and may block freely. A
/// long-running handler should poll [`ExecutionContext::is_interrupted`] so
/// that a timed-out call can be stopped.
pub trait MessageHandler: Send + Sync {
    /// Called once after construction, before the first `handle`
    fn init(&mut self, _services: &AgentServices) -> anyhow::Result<()> {
        Ok(())
    }

    /// Process one input message
    fn handle(&self, context: &mut ExecutionContext, input: &InputMessage) -> anyhow::Result<OutputMessage>;

    /// Take `next` as the handler this one forwards to in a `a|b` chain.
    ///
    /// Called before `init`. Handlers that cannot wrap another one keep the
    /// default, which hands `next` back.
    fn set_delegate(&mut self, next: Arc<dyn MessageHandler>) -> Result<(), Arc<dyn MessageHandler>> {
        Err(next)
    }
}

/// Constructor registered for a native handler
pub type HandlerCtor = Arc<dyn Fn() -> anyhow::Result<Box<dyn MessageHandler>> + Send + Sync>;

/// Returned by handlers that stopped because the call was interrupted
#[derive(Debug, Error)]
#[error("Execution interrupted")]
pub struct Interrupted;

/// Agent facilities available to handlers
#[derive(Clone)]
pub struct AgentServices {
    agent_id: String,
    agent_url: String,
    file_cache: Arc<FileCache>,
    wasm_runtime: Arc<WasmRuntime>,
    runtime_handle: tokio::runtime::Handle,
    properties: HashMap<String, String>,
}

impl AgentServices {
    /// Bundle the agent's services. `runtime_handle` drives file downloads
    /// requested from handler threads.
    pub fn new(
        agent_id: impl Into<String>,
        agent_url: impl Into<String>,
        file_cache: Arc<FileCache>,
        wasm_runtime: Arc<WasmRuntime>,
        runtime_handle: tokio::runtime::Handle,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_url: agent_url.into(),
            file_cache,
            wasm_runtime,
            runtime_handle,
            properties: HashMap::new(),
        }
    }

    /// Set the agent properties
    pub fn with_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties = properties;
        self
    }

    /// Agent identity
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Address the agent announces to the grid
    pub fn agent_url(&self) -> &str {
        &self.agent_url
    }

    /// Agent-wide properties
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// Shared file cache
    pub fn file_cache(&self) -> &Arc<FileCache> {
        &self.file_cache
    }

    /// Shared WASM runtime
    pub fn wasm_runtime(&self) -> &Arc<WasmRuntime> {
        &self.wasm_runtime
    }

    /// Blocking file request. Must not be called from an async context.
    pub fn request_file(&self, file: &FileVersionId) -> anyhow::Result<CachedFile> {
        let cached = self
            .runtime_handle
            .block_on(self.file_cache.request_file_version(&file.file_id, &file.version))?;
        Ok(cached)
    }
}

/// State handed to a handler for one invocation
pub struct ExecutionContext {
    token_id: String,
    session: SharedSession,
    properties: HashMap<String, String>,
    interrupt: Arc<AtomicBool>,
    services: AgentServices,
    measures: OutputMessageBuilder,
}

impl ExecutionContext {
    /// Create a context. `properties` are the merged agent, token and input properties.
    pub fn new(
        token_id: impl Into<String>,
        session: SharedSession,
        properties: HashMap<String, String>,
        interrupt: Arc<AtomicBool>,
        services: AgentServices,
    ) -> Self {
        Self {
            token_id: token_id.into(),
            session,
            properties,
            interrupt,
            services,
            measures: OutputMessageBuilder::new(),
        }
    }

    /// Token the call runs on
    pub fn token_id(&self) -> &str {
        &self.token_id
    }

    /// Session of the token, kept across calls until the token is renewed
    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    /// Merged properties
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// Property lookup
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Agent services
    pub fn services(&self) -> &AgentServices {
        &self.services
    }

    /// Shared interruption flag
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    /// Whether the call timed out and the handler should stop
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Fail with [`Interrupted`] if the call was interrupted
    pub fn check_interrupted(&self) -> anyhow::Result<()> {
        if self.is_interrupted() {
            return Err(Interrupted.into());
        }
        Ok(())
    }

    /// Sleep for `duration`, returning early with [`Interrupted`]
    pub fn sleep(&self, duration: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_interrupted()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            std::thread::sleep(remaining.min(INTERRUPT_POLL));
        }
    }

    /// Download the file referenced by the `<name>.id` / `<name>.version`
    /// properties, if present
    pub fn file_property(&self, name: &str) -> anyhow::Result<Option<CachedFile>> {
        match FileVersionId::from_properties(name, &self.properties) {
            Some(file) => Ok(Some(self.services.request_file(&file)?)),
            None => Ok(None),
        }
    }

    /// Start a nested measure
    pub fn start_measure(&mut self, name: impl Into<String>) {
        self.measures.start_measure(name);
    }

    /// Stop the latest measure
    pub fn stop_measure(&mut self) {
        self.measures.stop_measure();
    }

    /// Stop the latest measure with custom data
    pub fn stop_measure_with_data(&mut self, data: HashMap<String, Value>) {
        self.measures.stop_measure_with_data(data);
    }

    /// Measures recorded so far
    pub fn into_measures(self) -> Vec<Measure> {
        self.measures.build().measures
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::error::FileCacheError;
    use crate::file_cache::FileProvider;
    use crate::token_pool::TokenSession;
    use async_trait::async_trait;
    use ferrogrid_proto::FilePayload;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Provider serving files registered by the test
    #[derive(Default)]
    pub struct TestProvider {
        pub files: Mutex<HashMap<FileVersionId, FilePayload>>,
    }

    #[async_trait]
    impl FileProvider for TestProvider {
        async fn fetch(&self, file: &FileVersionId) -> Result<FilePayload, FileCacheError> {
            self.files.lock().get(file).cloned().ok_or_else(|| FileCacheError::Download {
                file: file.clone(),
                message: "unknown file".to_string(),
            })
        }
    }

    pub fn services(dir: &TempDir, provider: Arc<TestProvider>) -> AgentServices {
        let cache = FileCache::open(dir.path().join("filemanager"), provider).unwrap();
        let wasm_config = ferrogrid_wasm::WasmConfig {
            max_fuel: None,
            ..Default::default()
        };
        AgentServices::new(
            "agent-test",
            "tcp://127.0.0.1:0",
            Arc::new(cache),
            Arc::new(WasmRuntime::with_config(wasm_config).unwrap()),
            tokio::runtime::Handle::current(),
        )
    }

    pub fn context(services: AgentServices, properties: HashMap<String, String>) -> ExecutionContext {
        ExecutionContext::new(
            "token-1",
            Arc::new(Mutex::new(TokenSession::new())),
            properties,
            Arc::new(AtomicBool::new(false)),
            services,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use bytes::Bytes;
    use ferrogrid_proto::FilePayload;
    use tempfile::TempDir;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sleep_stops_when_interrupted() {
        let dir = TempDir::new().unwrap();
        let context = context(services(&dir, Arc::default()), HashMap::new());
        let flag = context.interrupt_flag();

        let worker = tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let result = context.sleep(Duration::from_secs(30));
            (result, started.elapsed())
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        flag.store(true, Ordering::SeqCst);

        let (result, elapsed) = worker.await.unwrap();
        assert!(result.unwrap_err().is::<Interrupted>());
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_file_property_downloads() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(TestProvider::default());
        provider.files.lock().insert(
            FileVersionId::new("data", "5"),
            FilePayload::File { name: "data.csv".to_string(), content: Bytes::from_static(b"a,b") },
        );
        let properties = FileVersionId::new("data", "5").to_properties("dataset");
        let context = context(services(&dir, provider), properties);

        let (present, absent) = tokio::task::spawn_blocking(move || {
            (context.file_property("dataset").unwrap(), context.file_property("other").unwrap())
        })
        .await
        .unwrap();

        let present = present.unwrap();
        assert_eq!(std::fs::read(present.path).unwrap(), b"a,b");
        assert!(absent.is_none());
    }

    #[tokio::test]
    async fn test_measures_collected() {
        let dir = TempDir::new().unwrap();
        let mut context = context(services(&dir, Arc::default()), HashMap::new());
        context.start_measure("step");
        context.stop_measure();

        let measures = context.into_measures();
        assert_eq!(measures.len(), 1);
        assert_eq!(measures[0].name, "step");
    }
}
