//! Built-in message handlers

use crate::context::HandlerCatalog;
use crate::handler::{AgentServices, ExecutionContext, Interrupted, MessageHandler};
use anyhow::{anyhow, Context, Result};
use ferrogrid_proto::{InputMessage, OutputMessage};
use ferrogrid_wasm::{WasmContext, WasmError, WasmModule, WasmRuntime};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Name of [`EchoHandler`]
pub const ECHO_HANDLER: &str = "echo";

/// Name of [`SleepHandler`]
pub const SLEEP_HANDLER: &str = "ferrogrid.sleep";

/// Name of [`MeasureHandler`]
pub const MEASURE_HANDLER: &str = "ferrogrid.measure";

/// Catalog of the handlers every agent provides
pub fn builtin_catalog() -> HandlerCatalog {
    let mut catalog = HandlerCatalog::new();
    catalog
        .register_native(ECHO_HANDLER, || Ok(Box::new(EchoHandler) as Box<dyn MessageHandler>))
        .register_native(SLEEP_HANDLER, || Ok(Box::new(SleepHandler) as Box<dyn MessageHandler>))
        .register_native(MEASURE_HANDLER, || Ok(Box::new(MeasureHandler::default()) as Box<dyn MessageHandler>));
    catalog
}

/// Returns the argument as payload
pub struct EchoHandler;

impl MessageHandler for EchoHandler {
    fn handle(&self, _context: &mut ExecutionContext, input: &InputMessage) -> Result<OutputMessage> {
        Ok(OutputMessage::with_payload(input.argument.clone()))
    }
}

/// Sleeps for `durationMs` milliseconds, stopping early when interrupted
pub struct SleepHandler;

impl MessageHandler for SleepHandler {
    fn handle(&self, context: &mut ExecutionContext, input: &InputMessage) -> Result<OutputMessage> {
        let duration_ms = input
            .argument
            .get("durationMs")
            .and_then(|v| v.as_u64())
            .context("Missing or invalid argument 'durationMs'")?;

        debug!(token = %context.token_id(), duration_ms, "Sleeping");
        context.sleep(Duration::from_millis(duration_ms))?;
        Ok(OutputMessage::with_payload(json!({ "sleptMs": duration_ms })))
    }
}

/// Chain head recording one measure around the handler it forwards to,
/// e.g. `ferrogrid.measure|my.Handler`
#[derive(Default)]
pub struct MeasureHandler {
    delegate: Option<Arc<dyn MessageHandler>>,
}

impl MessageHandler for MeasureHandler {
    fn set_delegate(&mut self, next: Arc<dyn MessageHandler>) -> Result<(), Arc<dyn MessageHandler>> {
        self.delegate = Some(next);
        Ok(())
    }

    fn handle(&self, context: &mut ExecutionContext, input: &InputMessage) -> Result<OutputMessage> {
        let delegate = self
            .delegate
            .as_ref()
            .ok_or_else(|| anyhow!("'{}' must be followed by another handler", MEASURE_HANDLER))?;

        context.start_measure(input.function.clone());
        let result = delegate.handle(context, input);
        let succeeded = matches!(&result, Ok(output) if !output.is_error());
        context.stop_measure_with_data([("succeeded".to_string(), json!(succeeded))].into());
        result
    }
}

/// Runs a compiled module through the agent's WASM runtime.
///
/// The argument is passed as JSON input, the merged properties as the WASI
/// environment, and the module's JSON answer becomes the payload.
pub struct WasmMessageHandler {
    name: String,
    module: WasmModule,
    runtime: Option<Arc<WasmRuntime>>,
}

impl WasmMessageHandler {
    /// Wrap `module`; the runtime is injected by [`MessageHandler::init`]
    pub fn new(name: impl Into<String>, module: WasmModule) -> Self {
        Self {
            name: name.into(),
            module,
            runtime: None,
        }
    }

    /// Exports the module lacks to be a handler
    pub fn missing_exports(&self) -> Vec<&'static str> {
        self.module.missing_handler_exports()
    }
}

impl MessageHandler for WasmMessageHandler {
    fn init(&mut self, services: &AgentServices) -> Result<()> {
        self.runtime = Some(services.wasm_runtime().clone());
        Ok(())
    }

    fn handle(&self, context: &mut ExecutionContext, input: &InputMessage) -> Result<OutputMessage> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| anyhow!("Handler '{}' used before initialisation", self.name))?;

        let wasm_context = WasmContext::new()
            .with_env(context.properties().clone())
            .with_interrupt(context.interrupt_flag());

        match runtime.invoke_json(&self.module, &input.argument, wasm_context) {
            Ok(payload) => Ok(OutputMessage::with_payload(payload)),
            Err(WasmError::Interrupted) => Err(Interrupted.into()),
            Err(e) => Err(anyhow::Error::new(e).context(format!("Module handler '{}' failed", self.name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_support::{context, services};
    use ferrogrid_wasm::test_utils::test_modules;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_echo_handler() {
        let dir = TempDir::new().unwrap();
        let mut context = context(services(&dir, Arc::default()), HashMap::new());
        let input = InputMessage::new("f", ECHO_HANDLER, json!({"arg1": "val1"}));

        let output = EchoHandler.handle(&mut context, &input).unwrap();
        assert_eq!(output.payload, Some(json!({"arg1": "val1"})));
        assert!(!output.is_error());
    }

    #[tokio::test]
    async fn test_sleep_handler_requires_duration() {
        let dir = TempDir::new().unwrap();
        let mut context = context(services(&dir, Arc::default()), HashMap::new());
        let input = InputMessage::new("f", SLEEP_HANDLER, json!({}));

        let error = SleepHandler.handle(&mut context, &input).unwrap_err();
        assert!(error.to_string().contains("durationMs"));
    }

    #[tokio::test]
    async fn test_sleep_handler_interrupted() {
        let dir = TempDir::new().unwrap();
        let mut context = context(services(&dir, Arc::default()), HashMap::new());
        context.interrupt_flag().store(true, Ordering::SeqCst);
        let input = InputMessage::new("f", SLEEP_HANDLER, json!({"durationMs": 60_000}));

        let error = SleepHandler.handle(&mut context, &input).unwrap_err();
        assert!(error.is::<Interrupted>());
    }

    #[tokio::test]
    async fn test_wasm_handler_round_trip() {
        let dir = TempDir::new().unwrap();
        let services = services(&dir, Arc::default());
        let module = services.wasm_runtime().load(test_modules::echo_handler_wasm()).unwrap();
        let mut handler = WasmMessageHandler::new("echo-module", module);
        handler.init(&services).unwrap();

        let mut context = context(services, HashMap::new());
        let input = InputMessage::new("f", "echo-module", json!({"items": [1, 2, 3]}));
        let output = handler.handle(&mut context, &input).unwrap();

        assert_eq!(output.payload, Some(json!({"items": [1, 2, 3]})));
    }

    #[tokio::test]
    async fn test_wasm_handler_needs_init() {
        let dir = TempDir::new().unwrap();
        let services = services(&dir, Arc::default());
        let module = services.wasm_runtime().load(test_modules::echo_handler_wasm()).unwrap();
        let handler = WasmMessageHandler::new("echo-module", module);

        let mut context = context(services, HashMap::new());
        let input = InputMessage::new("f", "echo-module", json!(null));
        assert!(handler.handle(&mut context, &input).is_err());
    }

    #[tokio::test]
    async fn test_wasm_handler_interrupted() {
        let dir = TempDir::new().unwrap();
        let services = services(&dir, Arc::default());
        let module = services.wasm_runtime().load(test_modules::looping_handler_wasm()).unwrap();
        let mut handler = WasmMessageHandler::new("loop", module);
        handler.init(&services).unwrap();

        let mut context = context(services, HashMap::new());
        context.interrupt_flag().store(true, Ordering::SeqCst);
        let input = InputMessage::new("f", "loop", json!({}));

        let error = handler.handle(&mut context, &input).unwrap_err();
        assert!(error.is::<Interrupted>());
    }

    #[tokio::test]
    async fn test_measure_handler_wraps_delegate() {
        let dir = TempDir::new().unwrap();
        let mut context = context(services(&dir, Arc::default()), HashMap::new());
        let mut handler = MeasureHandler::default();
        assert!(handler.set_delegate(Arc::new(EchoHandler)).is_ok());
        let input = InputMessage::new("compute", "ferrogrid.measure|echo", json!({"x": 1}));

        let output = handler.handle(&mut context, &input).unwrap();
        assert_eq!(output.payload, Some(json!({"x": 1})));

        let measures = context.into_measures();
        assert_eq!(measures.len(), 1);
        assert_eq!(measures[0].name, "compute");
        assert_eq!(measures[0].data.get("succeeded"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_measure_handler_alone_fails() {
        let dir = TempDir::new().unwrap();
        let mut context = context(services(&dir, Arc::default()), HashMap::new());
        let input = InputMessage::new("compute", MEASURE_HANDLER, json!({}));

        let error = MeasureHandler::default().handle(&mut context, &input).unwrap_err();
        assert!(error.to_string().contains("must be followed"));
    }

    #[test]
    fn test_echo_refuses_delegate() {
        let mut echo = EchoHandler;
        assert!(echo.set_delegate(Arc::new(SleepHandler)).is_err());
    }

    #[test]
    fn test_builtin_catalog() {
        let catalog = builtin_catalog();
        assert_eq!(catalog.names(), vec![ECHO_HANDLER, MEASURE_HANDLER, SLEEP_HANDLER]);
    }
}
