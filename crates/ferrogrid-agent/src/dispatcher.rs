//! Execution of input messages on tokens

use crate::context::{
    ContextLoader, ContextStack, Isolation, PushOutcome, RemoteContextFactory, ISOLATED_PROPERTY, LIBRARIES_PROPERTY,
};
use crate::error::{ContextError, DispatchError, TokenPoolError};
use crate::handler::ExecutionContext;
use crate::registry::HandlerRegistry;
use crate::token_pool::TokenPool;
use ferrogrid_proto::{Attachment, FileVersionId, InputMessage, Measure, OutputMessage};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::task::JoinError;
use tracing::{debug, error, warn};

/// Attempts made to observe an interrupted handler stopping
const INTERRUPTION_ATTEMPTS: usize = 10;

/// Wait between two interruption checks
const INTERRUPTION_WAIT: Duration = Duration::from_millis(10);

/// Returns the token to the pool when dropped.
///
/// Moved onto the worker thread, so a handler that ignores interruption keeps
/// its token reserved until it really finishes.
struct TokenLease {
    pool: Arc<TokenPool>,
    token_id: String,
}

impl Drop for TokenLease {
    fn drop(&mut self) {
        if let Err(e) = self.pool.return_token(&self.token_id) {
            error!(token = %self.token_id, error = %e, "Failed to return token");
        }
    }
}

/// Runs input messages against the agent's tokens
pub struct Dispatcher {
    pool: Arc<TokenPool>,
    loader: ContextLoader,
    registry: Arc<HandlerRegistry>,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(pool: Arc<TokenPool>, loader: ContextLoader, registry: Arc<HandlerRegistry>) -> Self {
        Self { pool, loader, registry }
    }

    /// Token pool
    pub fn pool(&self) -> &Arc<TokenPool> {
        &self.pool
    }

    /// Handler registry
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Start a new lease on a token
    pub fn reserve_token(&self, token_id: &str) -> Result<(), TokenPoolError> {
        self.pool.renew_session(token_id)
    }

    /// End the lease on a token
    pub fn release_token(&self, token_id: &str) -> Result<(), TokenPoolError> {
        self.pool.renew_session(token_id)
    }

    /// Process `input` on `token_id`. Every failure is reported in the output.
    pub async fn process(&self, token_id: &str, input: InputMessage) -> OutputMessage {
        let begin_ms = epoch_millis();
        let started = Instant::now();
        let function = input.function.clone();
        let handler = input.handler.clone();

        let mut output = match self.execute(token_id, input).await {
            Ok(output) => output,
            Err(e) => {
                warn!(token = %token_id, function = %function, error = %e, "Dispatch failed");
                e.into_output()
            }
        };

        output.measures.push(Measure {
            name: function,
            begin_ms,
            duration_ms: started.elapsed().as_millis() as u64,
            data: HashMap::from([("handler".to_string(), json!(handler))]),
        });
        output
    }

    async fn execute(&self, token_id: &str, input: InputMessage) -> Result<OutputMessage, DispatchError> {
        let reserved = self.pool.get(token_id)?;
        let lease = TokenLease {
            pool: self.pool.clone(),
            token_id: token_id.to_string(),
        };

        let services = self.registry.services();
        let mut properties = services.properties().clone();
        properties.extend(reserved.token.properties.clone());
        properties.extend(input.properties.clone());

        let mut stack = self.loader.stack();
        self.build_context(&mut stack, &properties, &input).await?;

        let interrupt = Arc::new(AtomicBool::new(false));
        let mut context = ExecutionContext::new(
            token_id,
            reserved.session.clone(),
            properties,
            interrupt.clone(),
            services.clone(),
        );

        let call_timeout = Duration::from_millis(input.call_timeout_ms);
        let started = Instant::now();
        let registry = self.registry.clone();
        let function = input.function.clone();
        let handler_name = input.handler.clone();
        debug!(token = %token_id, function = %function, handler = %handler_name, "Dispatching");

        let mut worker = tokio::task::spawn_blocking(move || {
            let _lease = lease;
            let result = registry
                .get(&stack, &input.handler)
                .map_err(anyhow::Error::from)
                .and_then(|handler| handler.handle(&mut context, &input));
            drop(stack);
            (result, context.into_measures())
        });

        let joined = match tokio::time::timeout(call_timeout, &mut worker).await {
            Ok(joined) => joined,
            Err(_) => {
                interrupt.store(true, Ordering::SeqCst);
                let interrupted = wait_for_stop(&worker).await;
                let state = format!(
                    "token: {}\nfunction: {}\nhandler: {}\nelapsed_ms: {}\nstopped: {}\n",
                    token_id,
                    function,
                    handler_name,
                    started.elapsed().as_millis(),
                    interrupted
                );
                let timeout_ms = call_timeout.as_millis() as u64;
                return Err(if interrupted {
                    DispatchError::TimeoutInterrupted { timeout_ms, state }
                } else {
                    error!(token = %token_id, function = %function, "Handler ignored interruption");
                    DispatchError::TimeoutNotInterrupted { timeout_ms, state }
                });
            }
        };

        match joined {
            Ok((Ok(mut output), measures)) => {
                output.measures.extend(measures);
                Ok(output)
            }
            Ok((Err(e), measures)) => {
                warn!(token = %token_id, function = %function, error = %format!("{:#}", e), "Handler failed");
                let mut output = OutputMessage::error(format!("{:#}", e));
                output.add_attachment(Attachment::text(Attachment::EXCEPTION_LOG, &format!("{:?}", e)));
                output.measures = measures;
                Ok(output)
            }
            Err(e) => {
                let cause = join_error_message(e);
                Err(DispatchError::Unexpected {
                    message: format!(
                        "Error in agent '{}' while executing '{}': {}",
                        services.agent_url(),
                        function,
                        cause
                    ),
                    details: cause,
                })
            }
        }
    }

    async fn build_context(
        &self,
        stack: &mut ContextStack,
        properties: &HashMap<String, String>,
        input: &InputMessage,
    ) -> Result<(), ContextError> {
        stack.reset_context();
        let services = self.registry.services();

        if let Some(libraries) = FileVersionId::from_properties(LIBRARIES_PROPERTY, properties) {
            let factory = RemoteContextFactory::new(
                libraries,
                services.file_cache().clone(),
                services.wasm_runtime().clone(),
            );
            let outcome = stack.push_context(&factory).await?;
            self.forget_replaced(&outcome);
        }

        if let Some(package) = &input.handler_package {
            let isolation = match properties.get(ISOLATED_PROPERTY).map(String::as_str) {
                Some("true") => Isolation::isolated(),
                _ => Isolation::Delegating,
            };
            let factory = RemoteContextFactory::new(
                package.clone(),
                services.file_cache().clone(),
                services.wasm_runtime().clone(),
            )
            .with_isolation(isolation);
            if let Some(outcome) = stack.push_context_if_absent(&factory).await? {
                self.forget_replaced(&outcome);
            }
        }

        Ok(())
    }

    fn forget_replaced(&self, outcome: &PushOutcome) {
        if let Some(replaced) = &outcome.replaced {
            self.registry.evict_scope(replaced.id());
            self.registry.purge_unused();
        }
    }
}

async fn wait_for_stop<T>(worker: &tokio::task::JoinHandle<T>) -> bool {
    for _ in 0..INTERRUPTION_ATTEMPTS {
        if worker.is_finished() {
            return true;
        }
        tokio::time::sleep(INTERRUPTION_WAIT).await;
    }
    worker.is_finished()
}

fn join_error_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
