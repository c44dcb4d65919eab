//! Token selection across all connected agents

use crate::error::SelectionError;
use ferrogrid_proto::{AgentRegistration, Interest, TokenDescriptor};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Attributes and interests of a token request
#[derive(Debug, Clone, Default)]
pub struct Pretender {
    /// Attributes of the requester, matched by the tokens' own patterns
    pub attributes: HashMap<String, String>,
    /// Interests the requester places on token attributes
    pub interests: HashMap<String, Interest>,
}

impl Pretender {
    /// Create a pretender
    pub fn new(attributes: HashMap<String, String>, interests: HashMap<String, Interest>) -> Self {
        Self { attributes, interests }
    }

    /// Add an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Add an interest
    pub fn with_interest(mut self, key: impl Into<String>, interest: Interest) -> Self {
        self.interests.insert(key.into(), interest);
        self
    }
}

fn evaluate(interests: &HashMap<String, Interest>, attributes: &HashMap<String, String>) -> Option<u32> {
    let mut score = 0;
    for (key, interest) in interests {
        if !interest.is_satisfied_by(attributes.get(key).map(String::as_str)) {
            return None;
        }
        if interest.must_match {
            score += 1;
        }
    }
    Some(score)
}

/// Affinity between a requester and a token, `None` when they do not match.
///
/// Matching is bidirectional: the requester's interests are evaluated against
/// the token's attributes and the token's patterns against the requester's
/// attributes. The score counts the satisfied required interests.
pub fn affinity_score(pretender: &Pretender, token: &TokenDescriptor) -> Option<u32> {
    let forward = evaluate(&pretender.interests, &token.attributes)?;
    let backward = evaluate(&token.selection_patterns, &pretender.attributes)?;
    Some(forward + backward)
}

/// How long [`TokenRegistry::select_with_timeout`] waits for a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionTimeouts {
    /// Wait when matching tokens exist but are all reserved
    pub match_exists: Duration,
    /// Wait when no registered token matches
    pub no_match_exists: Duration,
}

impl SelectionTimeouts {
    /// Separate waits for the two cases
    pub fn new(match_exists: Duration, no_match_exists: Duration) -> Self {
        Self {
            match_exists,
            no_match_exists,
        }
    }
}

impl From<Duration> for SelectionTimeouts {
    fn from(timeout: Duration) -> Self {
        Self::new(timeout, timeout)
    }
}

/// A token known to the grid
#[derive(Debug, Clone)]
pub struct RegisteredToken {
    /// Owning agent
    pub agent_id: String,
    /// Agent address, for diagnostics
    pub agent_url: String,
    /// Token as advertised
    pub descriptor: TokenDescriptor,
    /// Not currently selected by a requester
    pub available: bool,
    /// Removed as soon as it is no longer selected
    pub invalidated: bool,
    /// Last registration or keepalive
    pub last_touch: Instant,
}

impl RegisteredToken {
    /// Token identity
    pub fn uid(&self) -> &str {
        &self.descriptor.uid
    }
}

/// Registry of all tokens advertised to the grid.
///
/// Selection, return and invalidation are serialized on one lock. Requesters
/// waiting for a token are woken whenever a token is returned or added.
#[derive(Default)]
pub struct TokenRegistry {
    tokens: Mutex<HashMap<String, RegisteredToken>>,
    changed: Notify,
}

impl TokenRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh the tokens of an agent. Returns the number of new tokens.
    pub fn register(&self, registration: &AgentRegistration) -> usize {
        let now = Instant::now();
        let mut added = 0;
        {
            let mut tokens = self.tokens.lock();
            for descriptor in &registration.tokens {
                match tokens.get_mut(&descriptor.uid) {
                    Some(token) => {
                        token.last_touch = now;
                        token.descriptor = descriptor.clone();
                        token.agent_url = registration.agent_url.clone();
                    }
                    None => {
                        tokens.insert(
                            descriptor.uid.clone(),
                            RegisteredToken {
                                agent_id: registration.agent_id.clone(),
                                agent_url: registration.agent_url.clone(),
                                descriptor: descriptor.clone(),
                                available: true,
                                invalidated: false,
                                last_touch: now,
                            },
                        );
                        added += 1;
                    }
                }
            }
        }
        if added > 0 {
            debug!(agent = %registration.agent_id, added, "Tokens registered");
            self.changed.notify_waiters();
        }
        added
    }

    /// Refresh the keepalive of a token
    pub fn keepalive(&self, uid: &str) -> Result<(), SelectionError> {
        let mut tokens = self.tokens.lock();
        let token = tokens
            .get_mut(uid)
            .ok_or_else(|| SelectionError::UnknownToken(uid.to_string()))?;
        token.last_touch = Instant::now();
        Ok(())
    }

    /// Reserve the best available token for `pretender`.
    ///
    /// Among equally scored tokens the smallest uid wins.
    pub fn select(&self, pretender: &Pretender) -> Result<RegisteredToken, SelectionError> {
        let mut tokens = self.tokens.lock();
        let mut any_match = false;
        let mut best: Option<(u32, &String)> = None;
        for (uid, token) in tokens.iter() {
            if token.invalidated {
                continue;
            }
            let Some(score) = affinity_score(pretender, &token.descriptor) else {
                continue;
            };
            any_match = true;
            if !token.available {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_score, best_uid)) => score > best_score || (score == best_score && uid < best_uid),
            };
            if better {
                best = Some((score, uid));
            }
        }

        let uid = match best {
            Some((_, uid)) => uid.clone(),
            None if any_match => return Err(SelectionError::AllMatchingReserved),
            None => return Err(SelectionError::NoMatchingToken),
        };
        let token = tokens
            .get_mut(&uid)
            .ok_or_else(|| SelectionError::UnknownToken(uid.clone()))?;
        token.available = false;
        debug!(token = %uid, agent = %token.agent_id, "Token selected");
        Ok(token.clone())
    }

    /// Like [`select`](Self::select), waiting for a matching token to be
    /// returned or registered.
    ///
    /// The wait is bounded by `timeouts.match_exists` when a matching token is
    /// registered but reserved, and by `timeouts.no_match_exists` otherwise.
    /// A request waiting on reserved tokens fails early with
    /// [`SelectionError::NoMatchingToken`] once all of them are invalidated.
    pub async fn select_with_timeout(
        &self,
        pretender: &Pretender,
        timeouts: impl Into<SelectionTimeouts>,
    ) -> Result<RegisteredToken, SelectionError> {
        let timeouts = timeouts.into();
        let started = tokio::time::Instant::now();
        let mut deadline: Option<(bool, tokio::time::Instant)> = None;
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let error = match self.select(pretender) {
                Ok(token) => return Ok(token),
                Err(SelectionError::NoMatchingToken) if deadline.is_some_and(|(had_match, _)| had_match) => {
                    debug!("Matching tokens invalidated while waiting");
                    return Err(SelectionError::NoMatchingToken);
                }
                Err(SelectionError::UnknownToken(uid)) => return Err(SelectionError::UnknownToken(uid)),
                Err(e) => e,
            };
            let (_, wait_until) = *deadline.get_or_insert_with(|| {
                let had_match = error == SelectionError::AllMatchingReserved;
                let timeout = if had_match {
                    timeouts.match_exists
                } else {
                    timeouts.no_match_exists
                };
                (had_match, started + timeout)
            });
            if tokio::time::timeout_at(wait_until, changed).await.is_err() {
                warn!(error = %error, "Timeout while selecting token");
                return Err(error);
            }
        }
    }

    /// Make a selected token available again, or drop it if it was invalidated
    pub fn return_token(&self, uid: &str) -> Result<(), SelectionError> {
        {
            let mut tokens = self.tokens.lock();
            let token = tokens
                .get_mut(uid)
                .ok_or_else(|| SelectionError::UnknownToken(uid.to_string()))?;
            if token.invalidated {
                tokens.remove(uid);
                debug!(token = %uid, "Invalidated token removed on return");
                return Ok(());
            }
            token.available = true;
        }
        self.changed.notify_waiters();
        Ok(())
    }

    fn invalidate_locked(tokens: &mut HashMap<String, RegisteredToken>, uid: &str) -> bool {
        let Some(token) = tokens.get_mut(uid) else {
            return false;
        };
        token.invalidated = true;
        if token.available {
            tokens.remove(uid);
        }
        debug!(token = %uid, "Token invalidated");
        true
    }

    /// Invalidate a token. A selected token stays until it is returned.
    pub fn invalidate(&self, uid: &str) -> bool {
        let invalidated = Self::invalidate_locked(&mut self.tokens.lock(), uid);
        if invalidated {
            self.changed.notify_waiters();
        }
        invalidated
    }

    /// Invalidate every token of an agent
    pub fn invalidate_agent(&self, agent_id: &str) -> usize {
        let mut tokens = self.tokens.lock();
        let uids: Vec<String> = tokens
            .values()
            .filter(|token| token.agent_id == agent_id)
            .map(|token| token.descriptor.uid.clone())
            .collect();
        for uid in &uids {
            Self::invalidate_locked(&mut tokens, uid);
        }
        drop(tokens);
        if !uids.is_empty() {
            self.changed.notify_waiters();
        }
        uids.len()
    }

    /// Invalidate the tokens whose keepalive is older than `timeout`
    pub fn invalidate_expired(&self, timeout: Duration) -> usize {
        self.invalidate_expired_at(Instant::now(), timeout)
    }

    /// [`invalidate_expired`](Self::invalidate_expired) against an explicit clock
    pub fn invalidate_expired_at(&self, now: Instant, timeout: Duration) -> usize {
        let mut tokens = self.tokens.lock();
        let expired: Vec<String> = tokens
            .values()
            .filter(|token| !token.invalidated && now.saturating_duration_since(token.last_touch) > timeout)
            .map(|token| token.descriptor.uid.clone())
            .collect();
        for uid in &expired {
            Self::invalidate_locked(&mut tokens, uid);
        }
        drop(tokens);
        if !expired.is_empty() {
            warn!(count = expired.len(), "Tokens invalidated after keepalive timeout");
            self.changed.notify_waiters();
        }
        expired.len()
    }

    /// Whether an available token currently matches `pretender`
    pub fn exists_available_match(&self, pretender: &Pretender) -> bool {
        self.tokens
            .lock()
            .values()
            .any(|token| token.available && affinity_score(pretender, &token.descriptor).is_some())
    }

    /// Snapshot of a token
    pub fn get(&self, uid: &str) -> Option<RegisteredToken> {
        self.tokens.lock().get(uid).cloned()
    }

    /// Snapshot of all tokens, ordered by uid
    pub fn tokens(&self) -> Vec<RegisteredToken> {
        let mut tokens: Vec<_> = self.tokens.lock().values().cloned().collect();
        tokens.sort_by(|a, b| a.descriptor.uid.cmp(&b.descriptor.uid));
        tokens
    }

    /// Number of available tokens
    pub fn available_count(&self) -> usize {
        self.tokens.lock().values().filter(|token| token.available).count()
    }

    /// Number of registered tokens
    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    /// Whether no token is registered
    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn descriptor(uid: &str, attributes: &[(&str, &str)]) -> TokenDescriptor {
        TokenDescriptor {
            uid: uid.to_string(),
            agent_id: "agent-1".to_string(),
            attributes: attributes.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            selection_patterns: HashMap::new(),
            capacity: 1,
        }
    }

    fn registration(tokens: Vec<TokenDescriptor>) -> AgentRegistration {
        AgentRegistration {
            agent_id: "agent-1".to_string(),
            agent_url: "tcp://agent-1".to_string(),
            tokens,
        }
    }

    fn wants(key: &str, pattern: &str) -> Pretender {
        Pretender::default().with_interest(key, Interest::new(pattern, true).unwrap())
    }

    #[test]
    fn test_regex_interest_selects_token() {
        let registry = TokenRegistry::new();
        registry.register(&registration(vec![descriptor("t1", &[("att1", "val1")])]));

        let token = registry.select(&wants("att1", "val.*")).unwrap();
        assert_eq!(token.uid(), "t1");
        assert!(!registry.get("t1").unwrap().available);
    }

    #[test]
    fn test_no_match_vs_all_reserved() {
        let registry = TokenRegistry::new();
        registry.register(&registration(vec![descriptor("t1", &[("os", "linux")])]));

        assert_eq!(
            registry.select(&wants("os", "windows")).unwrap_err(),
            SelectionError::NoMatchingToken
        );
        registry.select(&wants("os", "linux")).unwrap();
        assert_eq!(
            registry.select(&wants("os", "linux")).unwrap_err(),
            SelectionError::AllMatchingReserved
        );
    }

    #[test]
    fn test_required_absent_interest() {
        let registry = TokenRegistry::new();
        registry.register(&registration(vec![
            descriptor("a", &[("os", "windows")]),
            descriptor("b", &[("os", "linux")]),
        ]));

        let pretender = Pretender::default().with_interest("os", Interest::new("win.*", false).unwrap());
        assert_eq!(registry.select(&pretender).unwrap().uid(), "b");
        assert_eq!(registry.select(&pretender).unwrap_err(), SelectionError::AllMatchingReserved);
    }

    #[test]
    fn test_token_patterns_match_requester() {
        let mut restricted = descriptor("a", &[]);
        restricted
            .selection_patterns
            .insert("team".to_string(), Interest::new("qa", true).unwrap());
        let registry = TokenRegistry::new();
        registry.register(&registration(vec![restricted]));

        assert_eq!(
            registry.select(&Pretender::default()).unwrap_err(),
            SelectionError::NoMatchingToken
        );
        let token = registry.select(&Pretender::default().with_attribute("team", "qa")).unwrap();
        assert_eq!(token.uid(), "a");
    }

    #[test]
    fn test_best_score_then_smallest_uid() {
        let registry = TokenRegistry::new();
        registry.register(&registration(vec![
            descriptor("c", &[("os", "linux"), ("gpu", "yes")]),
            descriptor("b", &[("os", "linux")]),
            descriptor("a", &[("os", "linux")]),
        ]));

        let with_gpu = wants("os", "linux").with_interest("gpu", Interest::new("yes", true).unwrap());
        assert_eq!(registry.select(&with_gpu).unwrap().uid(), "c");
        assert_eq!(registry.select(&wants("os", "linux")).unwrap().uid(), "a");
        assert_eq!(registry.select(&wants("os", "linux")).unwrap().uid(), "b");
    }

    #[test]
    fn test_return_and_invalidate() {
        let registry = TokenRegistry::new();
        registry.register(&registration(vec![descriptor("t1", &[]), descriptor("t2", &[])]));

        let selected = registry.select(&Pretender::default()).unwrap();
        assert_eq!(selected.uid(), "t1");
        assert!(registry.invalidate("t1"));
        assert!(registry.invalidate("t2"));
        // a selected token survives invalidation until it is returned
        assert_eq!(registry.len(), 1);

        registry.return_token("t1").unwrap();
        assert!(registry.is_empty());
        assert_eq!(
            registry.return_token("t1").unwrap_err(),
            SelectionError::UnknownToken("t1".to_string())
        );
    }

    #[test]
    fn test_keepalive_expiry() {
        let registry = TokenRegistry::new();
        registry.register(&registration(vec![descriptor("t1", &[]), descriptor("t2", &[])]));
        registry.select(&Pretender::default()).unwrap();

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(registry.invalidate_expired_at(later, Duration::from_secs(60)), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("t1").unwrap().invalidated);
        assert_eq!(registry.invalidate_expired_at(later, Duration::from_secs(60)), 0);

        // re-registration does not resurrect an invalidated token
        registry.register(&registration(vec![descriptor("t1", &[]), descriptor("t2", &[])]));
        assert!(registry.get("t1").unwrap().invalidated);
        assert!(!registry.get("t2").unwrap().invalidated);
    }

    #[test]
    fn test_invalidate_agent() {
        let registry = TokenRegistry::new();
        registry.register(&registration(vec![descriptor("t1", &[]), descriptor("t2", &[])]));
        assert_eq!(registry.invalidate_agent("agent-1"), 2);
        assert_eq!(registry.invalidate_agent("agent-2"), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_select_waits_for_returned_token() {
        let registry = Arc::new(TokenRegistry::new());
        registry.register(&registration(vec![descriptor("t1", &[("os", "linux")])]));
        registry.select(&wants("os", "linux")).unwrap();

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .select_with_timeout(&wants("os", "linux"), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.return_token("t1").unwrap();

        let token = waiter.await.unwrap().unwrap();
        assert_eq!(token.uid(), "t1");
        assert!(!registry.exists_available_match(&wants("os", "linux")));
    }

    #[tokio::test]
    async fn test_select_waits_for_registration() {
        let registry = Arc::new(TokenRegistry::new());
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .select_with_timeout(&wants("os", "linux"), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.register(&registration(vec![descriptor("late", &[("os", "linux")])]));

        assert_eq!(waiter.await.unwrap().unwrap().uid(), "late");
    }

    #[tokio::test]
    async fn test_select_timeout() {
        let registry = TokenRegistry::new();
        registry.register(&registration(vec![descriptor("t1", &[])]));
        registry.select(&Pretender::default()).unwrap();

        let result = registry
            .select_with_timeout(&Pretender::default(), Duration::from_millis(50))
            .await;
        assert_eq!(result.unwrap_err(), SelectionError::AllMatchingReserved);
    }

    #[tokio::test]
    async fn test_timeout_depends_on_match_existence() {
        let registry = TokenRegistry::new();
        registry.register(&registration(vec![descriptor("t1", &[("os", "linux")])]));
        registry.select(&wants("os", "linux")).unwrap();
        let timeouts = SelectionTimeouts::new(Duration::from_secs(30), Duration::from_millis(50));

        let started = Instant::now();
        let result = registry.select_with_timeout(&wants("os", "windows"), timeouts).await;
        assert_eq!(result.unwrap_err(), SelectionError::NoMatchingToken);
        assert!(started.elapsed() < Duration::from_secs(5));

        let timeouts = SelectionTimeouts::new(Duration::from_millis(50), Duration::from_secs(30));
        let started = Instant::now();
        let result = registry.select_with_timeout(&wants("os", "linux"), timeouts).await;
        assert_eq!(result.unwrap_err(), SelectionError::AllMatchingReserved);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_invalidation_wakes_waiters() {
        let registry = Arc::new(TokenRegistry::new());
        registry.register(&registration(vec![descriptor("t1", &[("os", "linux")])]));
        registry.select(&wants("os", "linux")).unwrap();

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let result = registry
                    .select_with_timeout(&wants("os", "linux"), Duration::from_secs(30))
                    .await;
                (result, started.elapsed())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.invalidate("t1"));

        let (result, elapsed) = waiter.await.unwrap();
        assert_eq!(result.unwrap_err(), SelectionError::NoMatchingToken);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_invalidated_token_no_longer_matches() {
        let registry = TokenRegistry::new();
        registry.register(&registration(vec![descriptor("t1", &[])]));
        registry.select(&Pretender::default()).unwrap();
        registry.invalidate_agent("agent-1");

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.select(&Pretender::default()).unwrap_err(),
            SelectionError::NoMatchingToken
        );
    }

    proptest! {
        #[test]
        fn prop_selected_token_satisfies_interests(
            values in proptest::collection::vec("[a-c]{1,2}", 1..8),
            pattern in "[a-c]\\.?\\*?",
        ) {
            let registry = TokenRegistry::new();
            let tokens = values
                .iter()
                .enumerate()
                .map(|(i, value)| descriptor(&format!("t{:02}", i), &[("key", value.as_str())]))
                .collect();
            registry.register(&registration(tokens));

            let interest = Interest::new(pattern.clone(), true).unwrap();
            let pretender = Pretender::default().with_interest("key", interest.clone());
            match registry.select(&pretender) {
                Ok(token) => {
                    prop_assert!(interest.pattern_matches(token.descriptor.attributes.get("key").map(String::as_str)));
                    // deterministic tie-break: no smaller matching uid was skipped
                    let smaller_match = values.iter().enumerate().any(|(i, value)| {
                        format!("t{:02}", i) < token.descriptor.uid && interest.pattern_matches(Some(value))
                    });
                    prop_assert!(!smaller_match);
                }
                Err(e) => {
                    prop_assert_eq!(e, SelectionError::NoMatchingToken);
                    prop_assert!(!values.iter().any(|value| interest.pattern_matches(Some(value))));
                }
            }
        }

        #[test]
        fn prop_a_token_is_never_selected_twice(count in 1usize..6, attempts in 1usize..10) {
            let registry = TokenRegistry::new();
            registry.register(&registration((0..count).map(|i| descriptor(&format!("t{}", i), &[])).collect()));

            let mut selected = std::collections::HashSet::new();
            for _ in 0..attempts {
                match registry.select(&Pretender::default()) {
                    Ok(token) => prop_assert!(selected.insert(token.descriptor.uid.clone())),
                    Err(e) => {
                        prop_assert_eq!(e, SelectionError::AllMatchingReserved);
                        prop_assert_eq!(selected.len(), count);
                    }
                }
            }
        }
    }
}
