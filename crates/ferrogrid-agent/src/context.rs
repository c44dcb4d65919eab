//! Layered handler scopes.
//!
//! A [`ContextScope`] is the unit of code isolation: a catalog of handler
//! definitions built from one bundle. Scopes form a tree rooted at the host
//! scope; a request composes a path through that tree on its own
//! [`ContextStack`] and resolves handler names against it.

use crate::error::ContextError;
use crate::file_cache::FileCache;
use crate::handler::{HandlerCtor, MessageHandler};
use async_trait::async_trait;
use ferrogrid_proto::FileVersionId;
use ferrogrid_wasm::{WasmModule, WasmRuntime};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Name prefix resolved through the parent even from isolated scopes
pub const DEFAULT_SHARED_PREFIX: &str = "ferrogrid.";

/// Property pair (`$libraries.id` / `$libraries.version`) naming a library bundle
pub const LIBRARIES_PROPERTY: &str = "$libraries";

/// Property requesting an isolated handler package scope when set to `true`
pub const ISOLATED_PROPERTY: &str = "$isolated";

const ROOT_KEY: &str = "$host";

/// How a handler becomes an instance
#[derive(Clone)]
pub enum HandlerDefinition {
    /// Host code registered under a name
    Native(HandlerCtor),
    /// Compiled module from a bundle
    Wasm(WasmModule),
}

impl fmt::Debug for HandlerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native(_) => f.write_str("Native"),
            Self::Wasm(module) => f.debug_tuple("Wasm").field(&module.hash()).finish(),
        }
    }
}

/// Handler definitions of one scope, by name
#[derive(Debug, Clone, Default)]
pub struct HandlerCatalog {
    definitions: HashMap<String, HandlerDefinition>,
}

impl HandlerCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a native handler constructor
    pub fn register_native<F>(&mut self, name: impl Into<String>, ctor: F) -> &mut Self
    where
        F: Fn() -> anyhow::Result<Box<dyn MessageHandler>> + Send + Sync + 'static,
    {
        self.definitions
            .insert(name.into(), HandlerDefinition::Native(Arc::new(ctor)));
        self
    }

    /// Register a compiled module
    pub fn register_wasm(&mut self, name: impl Into<String>, module: WasmModule) -> &mut Self {
        self.definitions.insert(name.into(), HandlerDefinition::Wasm(module));
        self
    }

    /// Look up a definition
    pub fn get(&self, name: &str) -> Option<&HandlerDefinition> {
        self.definitions.get(name)
    }

    /// Whether a definition exists
    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of definitions
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// Name resolution policy of a scope relative to its parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    /// Parent first, then the scope itself
    Delegating,
    /// Only names under a shared prefix go to the parent
    Isolated {
        /// Prefixes resolved through the parent
        shared_prefixes: Vec<String>,
    },
}

impl Isolation {
    /// Isolated scope sharing only [`DEFAULT_SHARED_PREFIX`]
    pub fn isolated() -> Self {
        Self::Isolated {
            shared_prefixes: vec![DEFAULT_SHARED_PREFIX.to_string()],
        }
    }

    fn delegates(&self, name: &str) -> bool {
        match self {
            Self::Delegating => true,
            Self::Isolated { shared_prefixes } => shared_prefixes.iter().any(|p| name.starts_with(p.as_str())),
        }
    }
}

type ChildSlot = Arc<tokio::sync::Mutex<Option<Arc<ContextScope>>>>;

/// One isolated unit of handler code
pub struct ContextScope {
    id: Uuid,
    key: String,
    version: Option<String>,
    isolation: Isolation,
    catalog: HandlerCatalog,
    resources: Vec<PathBuf>,
    children: Mutex<HashMap<String, ChildSlot>>,
}

impl ContextScope {
    /// Create a scope with a fresh id
    pub fn new(
        key: impl Into<String>,
        version: Option<String>,
        isolation: Isolation,
        catalog: HandlerCatalog,
        resources: Vec<PathBuf>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            version,
            isolation,
            catalog,
            resources,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Unique id of this scope instance
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Key the scope was registered under
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Version of the bundle the scope was built from
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Resolution policy
    pub fn isolation(&self) -> &Isolation {
        &self.isolation
    }

    /// Handler definitions
    pub fn catalog(&self) -> &HandlerCatalog {
        &self.catalog
    }

    /// Non-handler files of the bundle
    pub fn resources(&self) -> &[PathBuf] {
        &self.resources
    }

    fn child_slot(&self, key: &str) -> ChildSlot {
        self.children.lock().entry(key.to_string()).or_default().clone()
    }
}

impl fmt::Debug for ContextScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextScope")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("version", &self.version)
            .field("isolation", &self.isolation)
            .field("handlers", &self.catalog.names())
            .finish()
    }
}

/// Builds scopes for one key
#[async_trait]
pub trait ContextFactory: Send + Sync {
    /// Key identifying the scope among its siblings
    fn key(&self) -> String;

    /// Whether `existing`, built earlier for the same key, is outdated
    async fn requires_reload(&self, existing: &ContextScope) -> Result<bool, ContextError>;

    /// Build a new scope
    async fn build(&self) -> Result<ContextScope, ContextError>;
}

/// Factory for a catalog known in advance
pub struct LocalContextFactory {
    key: String,
    catalog: HandlerCatalog,
    isolation: Isolation,
}

impl LocalContextFactory {
    /// Create a delegating local factory
    pub fn new(key: impl Into<String>, catalog: HandlerCatalog) -> Self {
        Self {
            key: key.into(),
            catalog,
            isolation: Isolation::Delegating,
        }
    }

    /// Set the isolation of built scopes
    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }
}

#[async_trait]
impl ContextFactory for LocalContextFactory {
    fn key(&self) -> String {
        self.key.clone()
    }

    async fn requires_reload(&self, _existing: &ContextScope) -> Result<bool, ContextError> {
        Ok(false)
    }

    async fn build(&self) -> Result<ContextScope, ContextError> {
        Ok(ContextScope::new(
            self.key.clone(),
            None,
            self.isolation.clone(),
            self.catalog.clone(),
            Vec::new(),
        ))
    }
}

/// Factory for a bundle held by the grid.
///
/// Every `*.wasm` file of the bundle becomes a handler named after its file
/// stem; other files are exposed as resources.
pub struct RemoteContextFactory {
    file: FileVersionId,
    cache: Arc<FileCache>,
    runtime: Arc<WasmRuntime>,
    isolation: Isolation,
}

impl RemoteContextFactory {
    /// Create a delegating factory for `file`
    pub fn new(file: FileVersionId, cache: Arc<FileCache>, runtime: Arc<WasmRuntime>) -> Self {
        Self {
            file,
            cache,
            runtime,
            isolation: Isolation::Delegating,
        }
    }

    /// Set the isolation of built scopes
    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }
}

#[async_trait]
impl ContextFactory for RemoteContextFactory {
    fn key(&self) -> String {
        self.file.file_id.clone()
    }

    async fn requires_reload(&self, existing: &ContextScope) -> Result<bool, ContextError> {
        let cached = self
            .cache
            .request_file_version(&self.file.file_id, &self.file.version)
            .await?;
        Ok(cached.modified
            || existing.version() != Some(cached.version.as_str())
            || existing.isolation() != &self.isolation)
    }

    async fn build(&self) -> Result<ContextScope, ContextError> {
        let cached = self
            .cache
            .request_file_version(&self.file.file_id, &self.file.version)
            .await?;

        let key = self.key();
        let runtime = self.runtime.clone();
        let root = cached.path.clone();
        let scan_key = key.clone();
        let (catalog, resources) = tokio::task::spawn_blocking(move || load_bundle(&scan_key, &root, &runtime))
            .await
            .map_err(|e| ContextError::InvalidBundle {
                key: key.clone(),
                message: e.to_string(),
            })??;

        info!(key = %key, version = %cached.version, handlers = catalog.len(), "Bundle loaded");
        Ok(ContextScope::new(
            key,
            Some(cached.version),
            self.isolation.clone(),
            catalog,
            resources,
        ))
    }
}

fn load_bundle(key: &str, root: &Path, runtime: &WasmRuntime) -> Result<(HandlerCatalog, Vec<PathBuf>), ContextError> {
    let mut files = Vec::new();
    collect_files(root, &mut files)?;
    files.sort();

    let mut catalog = HandlerCatalog::new();
    let mut resources = Vec::new();
    for path in files {
        let is_module = path.extension().map_or(false, |ext| ext == "wasm");
        let stem = path.file_stem().and_then(|s| s.to_str());
        match (is_module, stem) {
            (true, Some(name)) => {
                if catalog.contains(name) {
                    return Err(ContextError::InvalidBundle {
                        key: key.to_string(),
                        message: format!("handler '{}' defined twice", name),
                    });
                }
                let bytes = fs::read(&path)?;
                let module = runtime.load(&bytes).map_err(|source| ContextError::Module {
                    path: path.display().to_string(),
                    source,
                })?;
                debug!(key = %key, handler = %name, "Module compiled");
                catalog.register_wasm(name, module);
            }
            _ => resources.push(path),
        }
    }

    Ok((catalog, resources))
}

fn collect_files(path: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            collect_files(&entry?.path(), files)?;
        }
    } else {
        files.push(path.to_path_buf());
    }
    Ok(())
}

/// Result of [`ContextStack::push_context`]
#[derive(Debug, Clone)]
pub struct PushOutcome {
    /// Scope now on top of the stack
    pub scope: Arc<ContextScope>,
    /// Whether an existing scope was reused
    pub reused: bool,
    /// Outdated scope that was replaced, if any
    pub replaced: Option<Arc<ContextScope>>,
}

/// A handler definition and the scope that supplied it
#[derive(Debug, Clone)]
pub struct ResolvedHandler {
    /// Defining scope
    pub scope: Arc<ContextScope>,
    /// The definition
    pub definition: HandlerDefinition,
}

/// Long-lived owner of the scope tree
#[derive(Debug, Clone)]
pub struct ContextLoader {
    root: Arc<ContextScope>,
}

impl ContextLoader {
    /// Create a loader whose root scope holds the host handlers
    pub fn new(host_catalog: HandlerCatalog) -> Self {
        Self {
            root: Arc::new(ContextScope::new(ROOT_KEY, None, Isolation::Delegating, host_catalog, Vec::new())),
        }
    }

    /// Root scope
    pub fn root(&self) -> &Arc<ContextScope> {
        &self.root
    }

    /// Fresh stack holding only the root scope
    pub fn stack(&self) -> ContextStack {
        ContextStack {
            scopes: vec![self.root.clone()],
        }
    }
}

/// Scopes composed for one request. Owned by that request and never shared;
/// dropping the stack resets it.
#[derive(Debug)]
pub struct ContextStack {
    scopes: Vec<Arc<ContextScope>>,
}

impl ContextStack {
    /// Push the scope built by `factory` as a child of the current scope,
    /// reusing the existing child for the same key unless it is outdated
    pub async fn push_context(&mut self, factory: &dyn ContextFactory) -> Result<PushOutcome, ContextError> {
        let key = factory.key();
        let slot = self.current_context().child_slot(&key);
        let mut child = slot.lock().await;

        if let Some(existing) = child.as_ref() {
            if !factory.requires_reload(existing).await? {
                debug!(key = %key, scope = %existing.id(), "Reusing context scope");
                let scope = existing.clone();
                self.scopes.push(scope.clone());
                return Ok(PushOutcome {
                    scope,
                    reused: true,
                    replaced: None,
                });
            }
        }

        let scope = Arc::new(factory.build().await?);
        let replaced = child.replace(scope.clone());
        debug!(
            key = %key,
            scope = %scope.id(),
            replaced = ?replaced.as_ref().map(|s| s.id()),
            "Context scope created"
        );
        self.scopes.push(scope.clone());
        Ok(PushOutcome {
            scope,
            reused: false,
            replaced,
        })
    }

    /// Push unless a scope with the factory's key is already on the stack
    pub async fn push_context_if_absent(
        &mut self,
        factory: &dyn ContextFactory,
    ) -> Result<Option<PushOutcome>, ContextError> {
        if self.contains_key(&factory.key()) {
            return Ok(None);
        }
        self.push_context(factory).await.map(Some)
    }

    /// Pop every scope above the root
    pub fn reset_context(&mut self) {
        self.scopes.truncate(1);
    }

    /// Scope on top of the stack
    pub fn current_context(&self) -> &Arc<ContextScope> {
        // The root is never popped.
        &self.scopes[self.scopes.len() - 1]
    }

    /// Number of scopes, root included
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Whether a scope with `key` is on the stack
    pub fn contains_key(&self, key: &str) -> bool {
        self.scopes.iter().any(|scope| scope.key() == key)
    }

    /// Independent copy of this stack
    pub fn fork_branch(&self) -> ContextStack {
        ContextStack {
            scopes: self.scopes.clone(),
        }
    }

    /// Resolve a handler name from the top of the stack
    pub fn resolve(&self, name: &str) -> Option<ResolvedHandler> {
        self.resolve_at(self.scopes.len() - 1, name)
    }

    fn resolve_at(&self, index: usize, name: &str) -> Option<ResolvedHandler> {
        let scope = &self.scopes[index];
        let own = || {
            scope.catalog().get(name).map(|definition| ResolvedHandler {
                scope: scope.clone(),
                definition: definition.clone(),
            })
        };

        if index == 0 {
            return own();
        }
        if scope.isolation().delegates(name) {
            self.resolve_at(index - 1, name).or_else(own)
        } else {
            own()
        }
    }
}

impl Drop for ContextStack {
    fn drop(&mut self) {
        self.reset_context();
    }
}
