//! # Ferrogrid
//!
//! Controller side of the Ferrogrid execution grid.
//!
//! Agents connect to a [`Grid`] and register their tokens. A [`GridClient`]
//! selects a token matching the requester's interests, runs input messages on
//! it and returns it. Handler packages registered with the grid's
//! [`FileManager`] are downloaded by agents on demand.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use ferrogrid_proto as proto;

/// Error types for the grid
pub mod error;

/// Grid configuration
pub mod config;

/// Token selection across agents
pub mod selector;

/// Files served to agents
pub mod file_manager;

/// Grid server
pub mod grid;

/// Client API
pub mod client;

/// In-process execution of local tokens
pub mod local;

pub use client::{GridClient, TokenHandle};
pub use config::GridConf;
pub use error::{GridError, SelectionError};
pub use file_manager::FileManager;
pub use grid::Grid;
pub use selector::{affinity_score, Pretender, RegisteredToken, SelectionTimeouts, TokenRegistry};

/// Result type alias for grid operations
pub type Result<T> = std::result::Result<T, GridError>;
