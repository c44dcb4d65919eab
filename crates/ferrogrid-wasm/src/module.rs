//! WASM module loading and validation

use crate::error::WasmError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use wasmtime::{Engine, Module};

/// Exports a module must provide to be invoked as a message handler:
/// linear memory, `alloc(len) -> ptr` and `handle(ptr, len) -> (ptr << 32 | len)`.
pub const HANDLER_EXPORTS: [&str; 3] = ["memory", "alloc", "handle"];

/// Upper bound on module size
const MAX_MODULE_SIZE: usize = 64 * 1024 * 1024;

const WASI_PREFIX: &str = "wasi_";

/// Summary of a compiled module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleMetadata {
    /// SHA256 of the module bytes, hex encoded
    pub hash: String,
    /// Size of the module in bytes
    pub size: usize,
    /// Exported item names
    pub exports: Vec<String>,
    /// Imports as `(module, name)` pairs
    pub imports: Vec<(String, String)>,
    /// Whether the module imports WASI
    pub is_wasi: bool,
}

/// A validated module compiled for one engine.
///
/// Cloning is cheap and clones share the compiled code, but never any
/// runtime state: every invocation instantiates into its own store.
#[derive(Debug, Clone)]
pub struct WasmModule {
    /// Module metadata
    pub metadata: ModuleMetadata,
    compiled: Module,
}

impl WasmModule {
    /// Validate and compile module bytes for `engine`
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, WasmError> {
        Self::validate_basic_format(bytes)?;

        let compiled = Module::from_binary(engine, bytes)
            .map_err(|e| WasmError::ModuleLoad(e.to_string()))?;
        let metadata = Self::extract_metadata(bytes, &compiled);
        Self::validate_module(&metadata)?;

        Ok(WasmModule { metadata, compiled })
    }

    /// Compiled wasmtime module
    pub fn compiled(&self) -> &Module {
        &self.compiled
    }

    /// Get the module hash
    pub fn hash(&self) -> &str {
        &self.metadata.hash
    }

    /// Check if the module imports WASI
    pub fn is_wasi(&self) -> bool {
        self.metadata.is_wasi
    }

    /// Handler exports this module lacks
    pub fn missing_handler_exports(&self) -> Vec<&'static str> {
        HANDLER_EXPORTS
            .iter()
            .copied()
            .filter(|name| !self.metadata.exports.iter().any(|export| export == name))
            .collect()
    }

    /// Whether the module can be invoked as a message handler
    pub fn is_handler(&self) -> bool {
        self.missing_handler_exports().is_empty()
    }

    fn extract_metadata(bytes: &[u8], module: &Module) -> ModuleMetadata {
        let hash = hex::encode(Sha256::digest(bytes));
        let exports = module.exports().map(|export| export.name().to_string()).collect();
        let imports: Vec<(String, String)> = module
            .imports()
            .map(|import| (import.module().to_string(), import.name().to_string()))
            .collect();
        let is_wasi = imports.iter().any(|(module, _)| module.starts_with(WASI_PREFIX));

        ModuleMetadata {
            hash,
            size: bytes.len(),
            exports,
            imports,
            is_wasi,
        }
    }

    fn validate_basic_format(bytes: &[u8]) -> Result<(), WasmError> {
        if bytes.len() < 8 {
            return Err(WasmError::InvalidFormat(
                "WASM module too small (minimum 8 bytes)".to_string()
            ));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(WasmError::InvalidFormat(
                "Invalid WASM magic number".to_string()
            ));
        }

        if bytes.len() > MAX_MODULE_SIZE {
            return Err(WasmError::ModuleValidation(format!(
                "Module too large: {} bytes (max: {} bytes)",
                bytes.len(), MAX_MODULE_SIZE
            )));
        }

        Ok(())
    }

    fn validate_module(metadata: &ModuleMetadata) -> Result<(), WasmError> {
        if let Some((_, name)) = metadata.imports.iter().find(|(_, name)| name.starts_with("sock_")) {
            return Err(WasmError::UnsupportedCapability(format!(
                "WASI networking is not supported ({})",
                name
            )));
        }

        // Only WASI is linked; anything else would fail at instantiation.
        if let Some((module, name)) = metadata
            .imports
            .iter()
            .find(|(module, _)| !module.starts_with(WASI_PREFIX))
        {
            return Err(WasmError::UnsupportedCapability(format!(
                "import {}::{} is not provided by the host",
                module, name
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_modules::{
        echo_handler_wasm, minimal_wasm, simple_function_wasm, wasi_echo_handler_wasm, INVALID_MAGIC_WASM,
    };

    fn engine() -> Engine {
        Engine::default()
    }

    #[test]
    fn test_minimal_wasm_module() {
        let module = WasmModule::from_bytes(&engine(), minimal_wasm()).unwrap();
        assert_eq!(module.metadata.size, minimal_wasm().len());
        assert!(!module.is_wasi());
        assert!(module.metadata.exports.is_empty());
        assert!(!module.is_handler());
        assert_eq!(module.missing_handler_exports(), HANDLER_EXPORTS.to_vec());
    }

    #[test]
    fn test_handler_exports_detected() {
        let module = WasmModule::from_bytes(&engine(), echo_handler_wasm()).unwrap();
        assert!(module.is_handler());
        assert!(!module.is_wasi());

        let module = WasmModule::from_bytes(&engine(), simple_function_wasm()).unwrap();
        assert!(!module.is_handler());
        assert_eq!(module.missing_handler_exports(), vec!["memory", "alloc", "handle"]);
    }

    #[test]
    fn test_wasi_module_detection() {
        let module = WasmModule::from_bytes(&engine(), wasi_echo_handler_wasm()).unwrap();
        assert!(module.is_wasi());
        assert!(module.is_handler());
        assert!(module
            .metadata
            .imports
            .iter()
            .any(|(module, name)| module == "wasi_snapshot_preview1" && name == "environ_get"));
    }

    #[test]
    fn test_foreign_imports_rejected() {
        let bytes = wat::parse_str(r#"
            (module
              (import "env" "log" (func $log (param i32)))
              (memory (export "memory") 1))
        "#).unwrap();

        let result = WasmModule::from_bytes(&engine(), &bytes);
        assert!(matches!(result, Err(WasmError::UnsupportedCapability(_))));
    }

    #[test]
    fn test_wasi_networking_rejected() {
        let bytes = wat::parse_str(r#"
            (module
              (import "wasi_snapshot_preview1" "sock_accept"
                (func $sock_accept (param i32 i32 i32) (result i32))))
        "#).unwrap();

        let result = WasmModule::from_bytes(&engine(), &bytes);
        assert!(matches!(result, Err(WasmError::UnsupportedCapability(_))));
    }

    #[test]
    fn test_invalid_wasm_magic() {
        let result = WasmModule::from_bytes(&engine(), INVALID_MAGIC_WASM);
        assert!(matches!(result, Err(WasmError::InvalidFormat(_))));
    }

    #[test]
    fn test_empty_bytes() {
        let result = WasmModule::from_bytes(&engine(), &[]);
        assert!(matches!(result, Err(WasmError::InvalidFormat(_))));
    }

    #[test]
    fn test_corrupt_body() {
        let mut bytes = minimal_wasm().to_vec();
        bytes.extend_from_slice(&[0x01, 0xFF, 0xFF]);

        let result = WasmModule::from_bytes(&engine(), &bytes);
        assert!(matches!(result, Err(WasmError::ModuleLoad(_))));
    }

    #[test]
    fn test_hash_calculation() {
        let engine = engine();
        let module1 = WasmModule::from_bytes(&engine, minimal_wasm()).unwrap();
        let module2 = WasmModule::from_bytes(&engine, simple_function_wasm()).unwrap();
        assert_ne!(module1.hash(), module2.hash());

        let module1_copy = WasmModule::from_bytes(&engine, minimal_wasm()).unwrap();
        assert_eq!(module1.hash(), module1_copy.hash());
    }
}
