//! Errors raised while compiling or invoking handler modules

use thiserror::Error;

/// Failure to load or run a handler module
#[derive(Debug, Error)]
pub enum WasmError {
    /// The bytes could not be compiled
    #[error("Cannot compile module: {0}")]
    ModuleLoad(String),

    /// The module compiled but breaks a host limit
    #[error("Module rejected: {0}")]
    ModuleValidation(String),

    /// The bytes are not a WebAssembly binary
    #[error("Not a WebAssembly module: {0}")]
    InvalidFormat(String),

    /// The module needs something the host does not link
    #[error("Unsupported capability: {0}")]
    UnsupportedCapability(String),

    /// Handler entry points the module does not export
    #[error("Module does not export {0}")]
    MissingExport(String),

    /// The handler trapped or misused the ABI
    #[error("Execution error: {0}")]
    Execution(String),

    /// Fuel budget exhausted
    #[error("Execution ran out of fuel")]
    OutOfFuel,

    /// Wall-clock limit in milliseconds
    #[error("Execution exceeded {0}ms")]
    TimedOut(u64),

    /// The caller asked the handler to stop
    #[error("Execution interrupted")]
    Interrupted,

    /// The handler answered with bytes that are not a JSON document
    #[error("Invalid handler output: {0}")]
    InvalidOutput(String),

    /// I/O failure
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Engine, linker or store setup failed
    #[error("Wasmtime error: {0}")]
    Wasmtime(#[from] wasmtime::Error),
}
