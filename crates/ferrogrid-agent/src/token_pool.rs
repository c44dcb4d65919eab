//! Agent-side bookkeeping of execution tokens

use crate::error::TokenPoolError;
use ferrogrid_proto::{Interest, TokenDescriptor, TokenStatus};
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Session shared between the pool and the handler running on the token
pub type SharedSession = Arc<Mutex<TokenSession>>;

type CloseCallback = Box<dyn FnOnce() + Send>;

/// Reservation state of a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// Available for a new call
    Free,
    /// A call is executing on the token
    Reserved,
}

/// Ephemeral state attached to a token's current lease.
///
/// Holds JSON values, arbitrary host objects and callbacks run when the
/// session is discarded.
#[derive(Default)]
pub struct TokenSession {
    values: HashMap<String, Value>,
    objects: HashMap<String, Box<dyn Any + Send>>,
    close_callbacks: Vec<CloseCallback>,
}

impl TokenSession {
    /// Create an empty session
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value
    pub fn put(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }

    /// Read a value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Remove a value
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// Store a host object
    pub fn put_object<T: Any + Send>(&mut self, key: impl Into<String>, object: T) {
        self.objects.insert(key.into(), Box::new(object));
    }

    /// Borrow a host object of type `T`
    pub fn get_object<T: Any + Send>(&self, key: &str) -> Option<&T> {
        self.objects.get(key).and_then(|object| object.downcast_ref())
    }

    /// Mutably borrow a host object of type `T`
    pub fn get_object_mut<T: Any + Send>(&mut self, key: &str) -> Option<&mut T> {
        self.objects.get_mut(key).and_then(|object| object.downcast_mut())
    }

    /// Run `callback` when the session is discarded
    pub fn on_close(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.close_callbacks.push(Box::new(callback));
    }

    /// Whether the session holds nothing
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.objects.is_empty() && self.close_callbacks.is_empty()
    }

    /// Number of values and objects
    pub fn len(&self) -> usize {
        self.values.len() + self.objects.len()
    }

    /// Run the close callbacks and drop every entry
    pub fn close(&mut self) {
        for callback in self.close_callbacks.drain(..) {
            callback();
        }
        self.values.clear();
        self.objects.clear();
    }
}

impl std::fmt::Debug for TokenSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSession")
            .field("values", &self.values)
            .field("objects", &self.objects.len())
            .field("close_callbacks", &self.close_callbacks.len())
            .finish()
    }
}

/// An execution slot hosted by this agent
#[derive(Debug, Clone)]
pub struct AgentToken {
    /// Token identity
    pub uid: String,
    /// Owning agent
    pub agent_id: String,
    /// Capability attributes
    pub attributes: HashMap<String, String>,
    /// Interests the token places on requesters
    pub selection_patterns: HashMap<String, Interest>,
    /// Properties visible to handlers running on the token
    pub properties: HashMap<String, String>,
    /// Size of the token's group
    pub capacity: u32,
}

impl AgentToken {
    /// Descriptor announced to the grid
    pub fn descriptor(&self) -> TokenDescriptor {
        TokenDescriptor {
            uid: self.uid.clone(),
            agent_id: self.agent_id.clone(),
            attributes: self.attributes.clone(),
            selection_patterns: self.selection_patterns.clone(),
            capacity: self.capacity,
        }
    }
}

struct PooledToken {
    token: AgentToken,
    state: TokenState,
    last_touch: Instant,
    session: SharedSession,
}

/// A token handed out by [`TokenPool::get`]
#[derive(Debug, Clone)]
pub struct ReservedToken {
    /// Token configuration
    pub token: AgentToken,
    /// The token's current session
    pub session: SharedSession,
}

/// A session detached from an idle token by the eviction sweep
#[derive(Debug)]
pub struct EvictedSession {
    /// Token the session belonged to
    pub token_id: String,
    /// The detached session; close it to run its callbacks
    pub session: SharedSession,
}

/// Thread-safe pool of the agent's tokens.
///
/// Every operation runs under one pool-wide lock; the pool holds tens of
/// tokens and each critical section is a map lookup.
#[derive(Default)]
pub struct TokenPool {
    tokens: Mutex<HashMap<String, PooledToken>>,
}

impl TokenPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or re-insert a token as free with a fresh session.
    /// The previous session, if any, is closed.
    pub fn offer(&self, token: AgentToken) {
        let uid = token.uid.clone();
        let previous = self.tokens.lock().insert(
            uid.clone(),
            PooledToken {
                token,
                state: TokenState::Free,
                last_touch: Instant::now(),
                session: Arc::new(Mutex::new(TokenSession::new())),
            },
        );
        debug!(token = %uid, "Token offered");

        if let Some(previous) = previous {
            if previous.state == TokenState::Reserved {
                error!(token = %uid, "Token re-offered while reserved");
            }
            previous.session.lock().close();
        }
    }

    /// Take a token out of the pool and close its session
    pub fn remove(&self, uid: &str) -> Option<AgentToken> {
        let removed = self.tokens.lock().remove(uid)?;
        if removed.state == TokenState::Reserved {
            warn!(token = %uid, "Token removed while reserved");
        }
        removed.session.lock().close();
        debug!(token = %uid, "Token removed");
        Some(removed.token)
    }

    /// Reserve a free token
    pub fn get(&self, uid: &str) -> Result<ReservedToken, TokenPoolError> {
        let mut tokens = self.tokens.lock();
        let pooled = tokens
            .get_mut(uid)
            .ok_or_else(|| TokenPoolError::NotFound(uid.to_string()))?;

        if pooled.state == TokenState::Reserved {
            error!(token = %uid, "Invariant violation: token reserved twice");
            return Err(TokenPoolError::AlreadyReserved(uid.to_string()));
        }

        pooled.state = TokenState::Reserved;
        debug!(token = %uid, "Token reserved");
        Ok(ReservedToken {
            token: pooled.token.clone(),
            session: pooled.session.clone(),
        })
    }

    /// Give a reserved token back. The session is kept.
    pub fn return_token(&self, uid: &str) -> Result<(), TokenPoolError> {
        let mut tokens = self.tokens.lock();
        let pooled = tokens
            .get_mut(uid)
            .ok_or_else(|| TokenPoolError::NotFound(uid.to_string()))?;

        if pooled.state != TokenState::Reserved {
            error!(token = %uid, "Invariant violation: token returned while free");
            return Err(TokenPoolError::NotReserved(uid.to_string()));
        }

        pooled.state = TokenState::Free;
        pooled.last_touch = Instant::now();
        debug!(token = %uid, "Token returned");
        Ok(())
    }

    /// Start a new lease on a free token: same effect on the session as
    /// [`TokenPool::offer`] with the token's current configuration.
    pub fn renew_session(&self, uid: &str) -> Result<(), TokenPoolError> {
        let previous = {
            let mut tokens = self.tokens.lock();
            let pooled = tokens
                .get_mut(uid)
                .ok_or_else(|| TokenPoolError::NotFound(uid.to_string()))?;
            if pooled.state == TokenState::Reserved {
                return Err(TokenPoolError::AlreadyReserved(uid.to_string()));
            }
            pooled.last_touch = Instant::now();
            std::mem::replace(&mut pooled.session, Arc::new(Mutex::new(TokenSession::new())))
        };
        previous.lock().close();
        debug!(token = %uid, "Token session renewed");
        Ok(())
    }

    /// Detach the sessions of free tokens idle for longer than `threshold`
    pub fn evict_idle_sessions(&self, threshold: Duration) -> Vec<EvictedSession> {
        self.evict_idle_sessions_at(Instant::now(), threshold)
    }

    /// [`TokenPool::evict_idle_sessions`] with an explicit clock.
    ///
    /// Evicted tokens stay in the pool with a fresh session. Reserved tokens
    /// are never touched.
    pub fn evict_idle_sessions_at(&self, now: Instant, threshold: Duration) -> Vec<EvictedSession> {
        let mut tokens = self.tokens.lock();
        let mut evicted = Vec::new();

        for (uid, pooled) in tokens.iter_mut() {
            if pooled.state != TokenState::Free {
                continue;
            }
            if now.saturating_duration_since(pooled.last_touch) <= threshold {
                continue;
            }
            let session = std::mem::replace(&mut pooled.session, Arc::new(Mutex::new(TokenSession::new())));
            debug!(token = %uid, "Idle token session evicted");
            evicted.push(EvictedSession {
                token_id: uid.clone(),
                session,
            });
        }

        evicted
    }

    /// Reservation state of a token
    pub fn state(&self, uid: &str) -> Option<TokenState> {
        self.tokens.lock().get(uid).map(|pooled| pooled.state)
    }

    /// Current session of a token
    pub fn session(&self, uid: &str) -> Option<SharedSession> {
        self.tokens.lock().get(uid).map(|pooled| pooled.session.clone())
    }

    /// All tokens, sorted by uid
    pub fn tokens(&self) -> Vec<AgentToken> {
        let mut tokens: Vec<AgentToken> = self
            .tokens
            .lock()
            .values()
            .map(|pooled| pooled.token.clone())
            .collect();
        tokens.sort_by(|a, b| a.uid.cmp(&b.uid));
        tokens
    }

    /// Descriptors of all tokens, for registration with the grid
    pub fn token_descriptors(&self) -> Vec<TokenDescriptor> {
        self.tokens().iter().map(AgentToken::descriptor).collect()
    }

    /// Descriptors and reservation state of all tokens, sorted by uid
    pub fn token_statuses(&self) -> Vec<TokenStatus> {
        let mut statuses: Vec<TokenStatus> = self
            .tokens
            .lock()
            .values()
            .map(|pooled| TokenStatus {
                descriptor: pooled.token.descriptor(),
                reserved: pooled.state == TokenState::Reserved,
            })
            .collect();
        statuses.sort_by(|a, b| a.descriptor.uid.cmp(&b.descriptor.uid));
        statuses
    }

    /// Number of free tokens
    pub fn available_tokens(&self) -> usize {
        self.tokens
            .lock()
            .values()
            .filter(|pooled| pooled.state == TokenState::Free)
            .count()
    }

    /// Number of tokens
    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    /// Whether the pool holds no token
    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}
