//! # Ferrogrid Agent
//!
//! Agent side of the execution grid. An agent offers tokens to the grid,
//! builds handler contexts from packages downloaded on demand and runs input
//! messages on reserved tokens.

#![warn(missing_docs)]

/// Agent main loop and grid connection
pub mod agent;

/// Agent configuration
pub mod config;

/// Context scopes and the per-request context stack
pub mod context;

/// Execution of input messages on tokens
pub mod dispatcher;

/// Error types
pub mod error;

/// Versioned cache of files downloaded from the grid
pub mod file_cache;

/// Handler interface and execution context
pub mod handler;

/// Built-in handlers
pub mod handlers;

/// Handler instances per scope
pub mod registry;

/// Tokens and their sessions
pub mod token_pool;

pub use agent::{Agent, AgentRequestHandler, GridFileProvider};
pub use config::{AgentConf, TokenConf, TokenGroupConf, WasmConf};
pub use context::{ContextLoader, ContextStack, HandlerCatalog, Isolation};
pub use dispatcher::Dispatcher;
pub use error::{ConfigError, ContextError, DispatchError, FileCacheError, RegistryError, TokenPoolError};
pub use file_cache::{FileCache, FileProvider};
pub use handler::{AgentServices, ExecutionContext, MessageHandler};
pub use registry::HandlerRegistry;
pub use token_pool::{AgentToken, TokenPool, TokenSession};
