//! Handler instances cached per active scope

use crate::context::{ContextScope, ContextStack, HandlerDefinition};
use crate::error::RegistryError;
use crate::handler::{AgentServices, MessageHandler};
use crate::handlers::WasmMessageHandler;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

/// Separates the handlers of a chain in a handler name
pub const CHAIN_SEPARATOR: char = '|';

struct CachedHandler {
    scope: Weak<ContextScope>,
    handler: Arc<dyn MessageHandler>,
}

/// Resolves handler names to initialised instances.
///
/// One instance exists per (active scope, name). Instantiation happens under
/// the registry lock, so concurrent lookups of the same pair build it once.
pub struct HandlerRegistry {
    services: AgentServices,
    cache: Mutex<HashMap<(Uuid, String), CachedHandler>>,
}

impl HandlerRegistry {
    /// Create a registry injecting `services` into new handlers
    pub fn new(services: AgentServices) -> Self {
        Self {
            services,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Services injected into handlers
    pub fn services(&self) -> &AgentServices {
        &self.services
    }

    /// Handler `name` as seen from the top of `stack`.
    ///
    /// `name` may be a chain `a|b|c`: each handler forwards to the next one
    /// and the chain is cached as a whole under its full name.
    pub fn get(&self, stack: &ContextStack, name: &str) -> Result<Arc<dyn MessageHandler>, RegistryError> {
        let active = stack.current_context();
        let key = (active.id(), name.to_string());

        let mut cache = self.cache.lock();
        if let Some(cached) = cache.get(&key) {
            return Ok(cached.handler.clone());
        }

        let mut links = name.split(CHAIN_SEPARATOR).rev();
        let last = links.next().unwrap_or(name);
        let mut handler = self.create(stack, last, None)?;
        for link in links {
            handler = self.create(stack, link, Some(handler))?;
        }

        debug!(handler = %name, active_scope = %active.id(), "Handler instantiated");
        cache.insert(
            key,
            CachedHandler {
                scope: Arc::downgrade(active),
                handler: handler.clone(),
            },
        );
        Ok(handler)
    }

    fn create(
        &self,
        stack: &ContextStack,
        name: &str,
        delegate: Option<Arc<dyn MessageHandler>>,
    ) -> Result<Arc<dyn MessageHandler>, RegistryError> {
        let resolved = stack
            .resolve(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let mut handler = self.instantiate(name, resolved.definition)?;
        if let Some(delegate) = delegate {
            handler
                .set_delegate(delegate)
                .map_err(|_| RegistryError::NotADelegate(name.to_string()))?;
        }
        handler
            .init(&self.services)
            .map_err(|e| RegistryError::Instantiation {
                name: name.to_string(),
                message: format!("{:#}", e),
            })?;

        debug!(handler = %name, defining_scope = %resolved.scope.id(), "Handler created");
        Ok(Arc::from(handler))
    }

    fn instantiate(&self, name: &str, definition: HandlerDefinition) -> Result<Box<dyn MessageHandler>, RegistryError> {
        match definition {
            HandlerDefinition::Native(ctor) => ctor().map_err(|e| RegistryError::Instantiation {
                name: name.to_string(),
                message: format!("{:#}", e),
            }),
            HandlerDefinition::Wasm(module) => {
                let handler = WasmMessageHandler::new(name, module);
                let missing = handler.missing_exports();
                if !missing.is_empty() {
                    return Err(RegistryError::NotAHandler {
                        name: name.to_string(),
                        message: format!("missing exports: {}", missing.join(", ")),
                    });
                }
                Ok(Box::new(handler))
            }
        }
    }

    /// Drop the handlers cached for an active scope
    pub fn evict_scope(&self, scope_id: Uuid) -> usize {
        let mut cache = self.cache.lock();
        let before = cache.len();
        cache.retain(|(id, _), _| *id != scope_id);
        let evicted = before - cache.len();
        if evicted > 0 {
            debug!(scope = %scope_id, evicted, "Handlers evicted");
        }
        evicted
    }

    /// Drop the handlers of scopes that no longer exist
    pub fn purge_unused(&self) -> usize {
        let mut cache = self.cache.lock();
        let before = cache.len();
        cache.retain(|_, cached| cached.scope.strong_count() > 0);
        before - cache.len()
    }

    /// Number of cached instances
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Whether no instance is cached
    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}
