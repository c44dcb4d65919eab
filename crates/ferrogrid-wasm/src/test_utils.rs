//! Test utilities for WASM module testing

pub mod test_modules {
    use std::sync::OnceLock;

    /// Bump allocator shared by the handler fixtures
    const ALLOC_FUNC: &str = r#"
      (global $next (mut i32) (i32.const 1024))
      (func (export "alloc") (param $len i32) (result i32)
        (local $ptr i32)
        global.get $next
        local.set $ptr
        global.get $next
        local.get $len
        i32.add
        global.set $next
        local.get $ptr)
    "#;

    /// `handle` returning the input region unchanged
    const ECHO_FUNC: &str = r#"
      (func (export "handle") (param $ptr i32) (param $len i32) (result i64)
        local.get $ptr
        i64.extend_i32_u
        i64.const 32
        i64.shl
        local.get $len
        i64.extend_i32_u
        i64.or)
    "#;

    fn generate_minimal_wasm() -> Vec<u8> {
        wat::parse_str("(module)").unwrap()
    }

    fn generate_simple_function_wasm() -> Vec<u8> {
        wat::parse_str(r#"
            (module
              (func $add (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add)
              (export "add" (func $add)))
        "#).unwrap()
    }

    fn generate_echo_handler_wasm() -> Vec<u8> {
        wat::parse_str(format!(
            r#"(module (memory (export "memory") 1) {} {})"#,
            ALLOC_FUNC, ECHO_FUNC
        )).unwrap()
    }

    fn generate_wasi_echo_handler_wasm() -> Vec<u8> {
        wat::parse_str(format!(
            r#"(module
              (import "wasi_snapshot_preview1" "fd_write"
                (func $fd_write (param i32 i32 i32 i32) (result i32)))
              (import "wasi_snapshot_preview1" "environ_get"
                (func $environ_get (param i32 i32) (result i32)))
              (memory (export "memory") 1)
              {} {})"#,
            ALLOC_FUNC, ECHO_FUNC
        )).unwrap()
    }

    fn generate_looping_handler_wasm() -> Vec<u8> {
        wat::parse_str(format!(
            r#"(module
              (memory (export "memory") 1)
              {}
              (func (export "handle") (param i32 i32) (result i64)
                (loop $spin (br $spin))
                i64.const 0))"#,
            ALLOC_FUNC
        )).unwrap()
    }

    static MINIMAL_WASM: OnceLock<Vec<u8>> = OnceLock::new();
    static SIMPLE_FUNCTION_WASM: OnceLock<Vec<u8>> = OnceLock::new();
    static ECHO_HANDLER_WASM: OnceLock<Vec<u8>> = OnceLock::new();
    static WASI_ECHO_HANDLER_WASM: OnceLock<Vec<u8>> = OnceLock::new();
    static LOOPING_HANDLER_WASM: OnceLock<Vec<u8>> = OnceLock::new();

    /// A minimal valid WASM module that does nothing
    pub fn minimal_wasm() -> &'static [u8] {
        MINIMAL_WASM.get_or_init(generate_minimal_wasm)
    }

    /// A WASM module with a simple function export and no handler ABI
    pub fn simple_function_wasm() -> &'static [u8] {
        SIMPLE_FUNCTION_WASM.get_or_init(generate_simple_function_wasm)
    }

    /// Handler returning its input document
    pub fn echo_handler_wasm() -> &'static [u8] {
        ECHO_HANDLER_WASM.get_or_init(generate_echo_handler_wasm)
    }

    /// Echo handler that also imports WASI
    pub fn wasi_echo_handler_wasm() -> &'static [u8] {
        WASI_ECHO_HANDLER_WASM.get_or_init(generate_wasi_echo_handler_wasm)
    }

    /// Handler that never returns
    pub fn looping_handler_wasm() -> &'static [u8] {
        LOOPING_HANDLER_WASM.get_or_init(generate_looping_handler_wasm)
    }

    /// Handler ignoring its input and always returning `json`
    pub fn constant_handler_wasm(json: &str) -> Vec<u8> {
        let escaped = json.replace('\\', "\\\\").replace('"', "\\\"");
        wat::parse_str(format!(
            r#"(module
              (memory (export "memory") 1)
              (data (i32.const 16) "{}")
              {}
              (func (export "handle") (param i32 i32) (result i64)
                i64.const {}))"#,
            escaped,
            ALLOC_FUNC,
            (16u64 << 32) | json.len() as u64
        )).unwrap()
    }

    /// Invalid WASM with wrong magic number
    pub const INVALID_MAGIC_WASM: &[u8] = &[
        0xFF, 0xFF, 0xFF, 0xFF, // wrong magic
        0x01, 0x00, 0x00, 0x00, // version
    ];
}
