//! # Ferrogrid WASM Runtime
//!
//! Isolated loading boundary for handler bundles. A bundle's `.wasm` files are
//! compiled into [`WasmModule`]s and invoked through [`WasmRuntime`], which
//! shares nothing between modules or calls except the JSON documents passed
//! across the handler ABI.

#![warn(missing_docs)]

/// WASM module loading and validation
pub mod module;

/// WASM execution runtime
pub mod runtime;

/// WASM-specific error types
pub mod error;

/// Test utilities for WASM modules
pub mod test_utils;

pub use module::{ModuleMetadata, WasmModule, HANDLER_EXPORTS};
pub use runtime::{WasmRuntime, WasmContext, WasmConfig};
pub use error::WasmError;
