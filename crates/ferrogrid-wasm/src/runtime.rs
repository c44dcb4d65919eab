//! WASM execution runtime
//!
//! Handlers are invoked synchronously on the calling thread. Each invocation
//! instantiates the module into a fresh [`Store`], so no linear memory or
//! global survives from one call to the next and two modules never share
//! state. Execution is bounded by fuel, a wall-clock limit and an optional
//! caller-owned interruption flag; the last two are checked on epoch ticks.

use crate::error::WasmError;
use crate::module::WasmModule;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;
use wasmtime::{Engine, Linker, Store, StoreLimits, StoreLimitsBuilder, Trap, UpdateDeadline};
use wasmtime_wasi::{WasiCtx, WasiCtxBuilder};

/// Interval between epoch increments
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Per-invocation inputs supplied by the caller
#[derive(Debug, Default, Clone)]
pub struct WasmContext {
    /// Environment variables visible to WASI modules
    env: HashMap<String, String>,
    /// Set by the caller to ask the handler to stop
    interrupt: Option<Arc<AtomicBool>>,
}

impl WasmContext {
    /// Create a new WASM context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set environment variables
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Stop execution once `flag` becomes true
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }
}

/// Configuration for WASM execution
#[derive(Debug, Clone)]
pub struct WasmConfig {
    /// Maximum linear memory per instance in bytes (default: 64MB)
    pub max_memory: usize,
    /// Maximum execution time of one invocation (default: 30 seconds)
    pub max_execution_time: Duration,
    /// Maximum fuel (instruction count limit)
    pub max_fuel: Option<u64>,
    /// Link WASI for modules that import it
    pub enable_wasi: bool,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            max_memory: 64 * 1024 * 1024,
            max_execution_time: Duration::from_secs(30),
            max_fuel: Some(100_000_000),
            enable_wasi: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Interrupted,
    TimedOut,
}

struct StoreState {
    wasi: WasiCtx,
    limits: StoreLimits,
    interrupt: Option<Arc<AtomicBool>>,
    deadline: Instant,
    stopped: Option<StopReason>,
}

/// WASM execution runtime with wasmtime integration
pub struct WasmRuntime {
    engine: Engine,
    config: WasmConfig,
    ticker_stop: Arc<AtomicBool>,
}

impl WasmRuntime {
    /// Create a new WASM runtime with default configuration
    pub fn new() -> Result<Self, WasmError> {
        Self::with_config(WasmConfig::default())
    }

    /// Create a new WASM runtime with custom configuration
    pub fn with_config(config: WasmConfig) -> Result<Self, WasmError> {
        let mut wasmtime_config = wasmtime::Config::new();
        wasmtime_config.max_wasm_stack(1024 * 1024);
        wasmtime_config.epoch_interruption(true);
        if config.max_fuel.is_some() {
            wasmtime_config.consume_fuel(true);
        }

        let engine = Engine::new(&wasmtime_config)?;

        let ticker_stop = Arc::new(AtomicBool::new(false));
        let ticker_engine = engine.clone();
        let stop = ticker_stop.clone();
        thread::Builder::new()
            .name("ferrogrid-wasm-epoch".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    thread::sleep(EPOCH_TICK);
                    ticker_engine.increment_epoch();
                }
            })?;

        Ok(WasmRuntime { engine, config, ticker_stop })
    }

    /// Engine modules must be compiled with to run here
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get the runtime configuration
    pub fn config(&self) -> &WasmConfig {
        &self.config
    }

    /// Validate and compile module bytes for this runtime
    pub fn load(&self, bytes: &[u8]) -> Result<WasmModule, WasmError> {
        WasmModule::from_bytes(&self.engine, bytes)
    }

    /// Invoke a handler module with a JSON document and return its JSON answer.
    ///
    /// The input is written into memory obtained from the module's `alloc`,
    /// then `handle(ptr, len)` returns the output region packed as
    /// `ptr << 32 | len`.
    pub fn invoke_json(
        &self,
        module: &WasmModule,
        input: &Value,
        context: WasmContext,
    ) -> Result<Value, WasmError> {
        let missing = module.missing_handler_exports();
        if !missing.is_empty() {
            return Err(WasmError::MissingExport(missing.join(", ")));
        }
        if module.is_wasi() && !self.config.enable_wasi {
            return Err(WasmError::UnsupportedCapability(
                "module imports WASI but WASI is disabled".to_string(),
            ));
        }

        let mut store = self.new_store(module, context)?;
        let mut linker = Linker::new(&self.engine);
        if module.is_wasi() {
            wasmtime_wasi::add_to_linker(&mut linker, |state: &mut StoreState| &mut state.wasi)?;
        }

        let instance = linker
            .instantiate(&mut store, module.compiled())
            .map_err(|e| self.execution_error(&store, e))?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| WasmError::MissingExport("memory".to_string()))?;
        let alloc = instance.get_typed_func::<i32, i32>(&mut store, "alloc")?;
        let handle = instance.get_typed_func::<(i32, i32), i64>(&mut store, "handle")?;

        let input_bytes = serde_json::to_vec(input)
            .map_err(|e| WasmError::Execution(format!("Failed to serialize input: {}", e)))?;
        let input_len = i32::try_from(input_bytes.len())
            .map_err(|_| WasmError::Execution("Input too large".to_string()))?;

        let input_ptr = alloc
            .call(&mut store, input_len)
            .map_err(|e| self.execution_error(&store, e))?;
        memory
            .write(&mut store, input_ptr as u32 as usize, &input_bytes)
            .map_err(|e| WasmError::Execution(format!("alloc returned an invalid region: {}", e)))?;

        let packed = handle
            .call(&mut store, (input_ptr, input_len))
            .map_err(|e| self.execution_error(&store, e))? as u64;
        let output_ptr = (packed >> 32) as usize;
        let output_len = (packed & 0xFFFF_FFFF) as usize;

        if output_ptr + output_len > memory.data_size(&store) {
            return Err(WasmError::InvalidOutput(format!(
                "output region {}+{} is outside linear memory",
                output_ptr, output_len
            )));
        }
        let mut output = vec![0u8; output_len];
        memory
            .read(&store, output_ptr, &mut output)
            .map_err(|e| WasmError::InvalidOutput(e.to_string()))?;

        debug!(module = %module.hash(), output_len, "Handler module returned");
        serde_json::from_slice(&output).map_err(|e| WasmError::InvalidOutput(e.to_string()))
    }

    fn new_store(&self, module: &WasmModule, context: WasmContext) -> Result<Store<StoreState>, WasmError> {
        let mut wasi_builder = WasiCtxBuilder::new();
        if module.is_wasi() {
            for (key, value) in &context.env {
                let _ = wasi_builder.env(key, value);
            }
        }

        let state = StoreState {
            wasi: wasi_builder.build(),
            limits: StoreLimitsBuilder::new().memory_size(self.config.max_memory).build(),
            interrupt: context.interrupt,
            deadline: Instant::now() + self.config.max_execution_time,
            stopped: None,
        };

        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);
        if let Some(fuel) = self.config.max_fuel {
            store.add_fuel(fuel)?;
        }
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(|mut ctx| {
            let state = ctx.data_mut();
            let interrupted = state
                .interrupt
                .as_ref()
                .map_or(false, |flag| flag.load(Ordering::SeqCst));
            if interrupted {
                state.stopped = Some(StopReason::Interrupted);
                return Err(Trap::Interrupt.into());
            }
            if Instant::now() >= state.deadline {
                state.stopped = Some(StopReason::TimedOut);
                return Err(Trap::Interrupt.into());
            }
            Ok(UpdateDeadline::Continue(1))
        });

        Ok(store)
    }

    fn execution_error(&self, store: &Store<StoreState>, error: wasmtime::Error) -> WasmError {
        match store.data().stopped {
            Some(StopReason::Interrupted) => WasmError::Interrupted,
            Some(StopReason::TimedOut) => {
                WasmError::TimedOut(self.config.max_execution_time.as_millis() as u64)
            }
            None => match error.downcast_ref::<Trap>() {
                Some(Trap::OutOfFuel) => WasmError::OutOfFuel,
                _ => WasmError::Execution(format!("{:#}", error)),
            },
        }
    }
}

impl Drop for WasmRuntime {
    fn drop(&mut self) {
        self.ticker_stop.store(true, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for WasmRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmRuntime")
            .field("config", &self.config)
            .finish()
    }
}
