//! Dispatching work to agent tokens

use crate::error::GridError;
use crate::grid::GridState;
use crate::local::{LocalAgent, LOCAL_AGENT_ID, LOCAL_AGENT_URL};
use crate::selector::{Pretender, RegisteredToken, SelectionTimeouts};
use ferrogrid_proto::{
    AgentError, AgentErrorCode, Attachment, FileVersionId, InputMessage, Interest, OutputMessage, ProtocolError,
    Request, Response, TokenDescriptor, TokenStatus,
};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use uuid::Uuid;

/// Extra time granted to an agent beyond the call timeout, so that the agent
/// reports its own timeout before the grid gives up on the call
const CALL_TIMEOUT_MARGIN: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleKind {
    Agent { has_session: bool },
    Local,
}

/// A token selected for one requester
#[derive(Debug, Clone)]
pub struct TokenHandle {
    token: RegisteredToken,
    kind: HandleKind,
}

impl TokenHandle {
    /// Token identity
    pub fn token_id(&self) -> &str {
        self.token.uid()
    }

    /// Owning agent
    pub fn agent_id(&self) -> &str {
        &self.token.agent_id
    }

    /// Address of the owning agent
    pub fn agent_url(&self) -> &str {
        &self.token.agent_url
    }

    /// Attributes of the token
    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.token.descriptor.attributes
    }

    /// Whether calls run inside the controller
    pub fn is_local(&self) -> bool {
        self.kind == HandleKind::Local
    }

    /// Whether a session was opened on the agent when the token was taken
    pub fn has_session(&self) -> bool {
        matches!(self.kind, HandleKind::Agent { has_session: true })
    }
}

/// Entry point for running input messages on the grid's agents
#[derive(Clone)]
pub struct GridClient {
    state: Arc<GridState>,
    local: Arc<OnceCell<LocalAgent>>,
}

impl GridClient {
    pub(crate) fn new(state: Arc<GridState>) -> Self {
        Self {
            state,
            local: Arc::new(OnceCell::new()),
        }
    }

    /// Input message using the grid's default call timeout
    pub fn input_message(&self, function: impl Into<String>, handler: impl Into<String>, argument: Value) -> InputMessage {
        InputMessage::new(function, handler, argument).with_call_timeout_ms(self.state.conf.call_timeout_ms)
    }

    /// Token selection waits from the grid configuration
    pub fn selection_timeouts(&self) -> SelectionTimeouts {
        self.state.conf.selection_timeouts()
    }

    /// Make a file or directory downloadable by agents
    pub fn register_file(&self, path: impl AsRef<Path>, cleanable: bool) -> Result<FileVersionId, GridError> {
        self.state.files.register_file(path, cleanable)
    }

    /// Forget a registered file
    pub fn unregister_file(&self, file_id: &str) -> Result<bool, GridError> {
        self.state.files.unregister_file(file_id)
    }

    /// Select a token matching `interests`, waiting as long as `timeouts`
    /// allows. With `create_session`, a new session is also opened on the
    /// token's agent.
    pub async fn get_token_handle(
        &self,
        attributes: HashMap<String, String>,
        interests: HashMap<String, Interest>,
        timeouts: impl Into<SelectionTimeouts>,
        create_session: bool,
    ) -> Result<TokenHandle, GridError> {
        let pretender = Pretender::new(attributes, interests);
        let token = self.state.tokens.select_with_timeout(&pretender, timeouts).await?;
        let handle = TokenHandle {
            token,
            kind: HandleKind::Agent {
                has_session: create_session,
            },
        };

        if create_session {
            if let Err(e) = self.reserve_on_agent(&handle).await {
                if let Err(return_error) = self.state.tokens.return_token(handle.token_id()) {
                    warn!(token = %handle.token_id(), error = %return_error, "Failed to return token after reservation failure");
                }
                return Err(e);
            }
        }
        debug!(token = %handle.token_id(), agent = %handle.agent_id(), create_session, "Token handle acquired");
        Ok(handle)
    }

    /// A token running its calls inside the controller, with a fresh
    /// session. Handler packages are read from the grid's file manager.
    pub async fn get_local_token_handle(&self) -> Result<TokenHandle, GridError> {
        let local = self.local_agent().await?;
        let uid = Uuid::new_v4().to_string();
        local.offer(&uid);

        let token = RegisteredToken {
            agent_id: LOCAL_AGENT_ID.to_string(),
            agent_url: LOCAL_AGENT_URL.to_string(),
            descriptor: TokenDescriptor {
                uid,
                agent_id: LOCAL_AGENT_ID.to_string(),
                attributes: HashMap::new(),
                selection_patterns: HashMap::new(),
                capacity: 1,
            },
            available: false,
            invalidated: false,
            last_touch: Instant::now(),
        };
        debug!(token = %token.uid(), "Local token handle created");
        Ok(TokenHandle {
            token,
            kind: HandleKind::Local,
        })
    }

    async fn local_agent(&self) -> Result<&LocalAgent, GridError> {
        self.local
            .get_or_try_init(|| async { LocalAgent::start(self.state.clone()) })
            .await
    }

    /// State of the tokens hosted by a connected agent, as the agent sees it
    pub async fn list_agent_tokens(&self, agent_id: &str) -> Result<Vec<TokenStatus>, GridError> {
        let peer = self.state.agent_peer(agent_id)?;
        let response = peer
            .call(Request::list_tokens(), self.state.conf.token_reservation_timeout())
            .await?;
        match response {
            Response::Tokens { tokens, .. } => Ok(tokens),
            other => Err(ProtocolError::UnexpectedResponse(format!("{:?}", other)).into()),
        }
    }

    async fn reserve_on_agent(&self, handle: &TokenHandle) -> Result<(), GridError> {
        let peer = self.state.agent_peer(handle.agent_id())?;
        let response = peer
            .call(
                Request::reserve_token(handle.token_id()),
                self.state.conf.token_reservation_timeout(),
            )
            .await
            .map_err(|e| GridError::token_request("reserving", e))?;
        match response {
            Response::Ack { .. } => Ok(()),
            other => Err(ProtocolError::UnexpectedResponse(format!("{:?}", other)).into()),
        }
    }

    /// Run `input` on the token of `handle`.
    ///
    /// Never fails: communication problems and agent-side failures are
    /// reported through the output's `error`, with the structured
    /// `agent_error` preserved.
    pub async fn call(&self, handle: &TokenHandle, input: InputMessage) -> OutputMessage {
        if handle.is_local() {
            return match self.local_agent().await {
                Ok(local) => {
                    let output = local.process(handle.token_id(), input).await;
                    self.describe_agent_error(output)
                }
                Err(e) => OutputMessage::error(e.to_string()),
            };
        }

        let timeout_ms = input.call_timeout_ms;
        let peer = match self.state.agent_peer(handle.agent_id()) {
            Ok(peer) => peer,
            Err(e) => return communication_error(&e),
        };

        let result = peer
            .call(
                Request::process(handle.token_id(), input),
                Duration::from_millis(timeout_ms) + CALL_TIMEOUT_MARGIN,
            )
            .await;
        match result {
            Ok(Response::Output { output, .. }) => self.describe_agent_error(output),
            Ok(other) => communication_error(&ProtocolError::UnexpectedResponse(format!("{:?}", other))),
            Err(ProtocolError::Timeout { .. }) => OutputMessage::error(format!(
                "Timeout after {}ms while calling the agent. You can increase the call timeout of the request",
                timeout_ms
            )),
            Err(e) => communication_error(&e),
        }
    }

    fn describe_agent_error(&self, mut output: OutputMessage) -> OutputMessage {
        let Some(agent_error) = &output.agent_error else {
            return output;
        };
        let message = self.agent_error_message(agent_error);
        debug!(code = ?agent_error.code, "Agent error reported");
        output.error = Some(message);
        output
    }

    fn agent_error_message(&self, agent_error: &AgentError) -> String {
        let detail = |key: &str| agent_error.details.get(key).cloned().unwrap_or_default();
        match agent_error.code {
            AgentErrorCode::TimeoutRequestInterrupted => format!(
                "Timeout after {}ms while executing the handler on the agent. The handler execution could be interrupted on the agent side. You can increase the call timeout of the request",
                detail(AgentError::DETAIL_TIMEOUT)
            ),
            AgentErrorCode::TimeoutRequestNotInterrupted => format!(
                "Timeout after {}ms while executing the handler on the agent. WARNING: The handler execution couldn't be interrupted on the agent side. You can increase the call timeout of the request",
                detail(AgentError::DETAIL_TIMEOUT)
            ),
            AgentErrorCode::TokenNotFound => "The agent token doesn't exist on the agent side".to_string(),
            AgentErrorCode::Unexpected => "Unexpected error while executing the handler on the agent".to_string(),
            AgentErrorCode::ContextBuilder => {
                "Unexpected error on the agent side while building the execution context of the handler".to_string()
            }
            AgentErrorCode::ContextBuilderFileDownloadError => {
                "Error while downloading a resource from the controller".to_string()
            }
            AgentErrorCode::ContextBuilderFileDownloadTimeout => {
                let resource = agent_error
                    .details
                    .get(AgentError::DETAIL_FILE_ID)
                    .and_then(|file_id| self.state.files.path_of(file_id))
                    .map(|path| format!("the following resource from the controller: {}", path.display()))
                    .unwrap_or_else(|| "a resource from the controller".to_string());
                format!(
                    "Timeout after {}ms while downloading {}. You can increase the download timeout by setting grid_read_timeout_ms in the agent configuration",
                    detail(AgentError::DETAIL_TIMEOUT),
                    resource
                )
            }
        }
    }

    /// Give a token back.
    ///
    /// The session opened on the agent, if any, is released first. The token
    /// is returned to the grid even when the agent cannot be reached. A local
    /// token is dropped along with its session.
    pub async fn return_token_handle(&self, handle: TokenHandle) -> Result<(), GridError> {
        let has_session = match handle.kind {
            HandleKind::Local => {
                if let Some(local) = self.local.get() {
                    local.remove(handle.token_id());
                }
                return Ok(());
            }
            HandleKind::Agent { has_session } => has_session,
        };

        let released = if has_session {
            self.release_on_agent(&handle).await
        } else {
            Ok(())
        };
        self.state.tokens.return_token(handle.token_id())?;
        debug!(token = %handle.token_id(), "Token handle returned");
        released
    }

    async fn release_on_agent(&self, handle: &TokenHandle) -> Result<(), GridError> {
        let peer = self.state.agent_peer(handle.agent_id())?;
        peer.call(
            Request::release_token(handle.token_id()),
            self.state.conf.token_reservation_timeout(),
        )
        .await
        .map(|_| ())
        .map_err(|e| GridError::token_request("releasing", e))
    }
}

fn communication_error(error: &dyn std::fmt::Debug) -> OutputMessage {
    let mut output =
        OutputMessage::error("Communication error between the controller and the agent while calling the agent");
    output.add_attachment(Attachment::text(Attachment::EXCEPTION_LOG, &format!("{:?}", error)));
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridConf;
    use crate::grid::Grid;
    use async_trait::async_trait;
    use ferrogrid_proto::{AgentRegistration, Peer, RequestHandler};
    use parking_lot::Mutex;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::net::TcpStream;

    /// Agent side answering with canned outputs
    #[derive(Default)]
    struct ScriptedAgent {
        output: Mutex<Option<OutputMessage>>,
        reserved: Mutex<Vec<String>>,
        released: Mutex<Vec<String>>,
        process_delay: Duration,
    }

    #[async_trait]
    impl RequestHandler for ScriptedAgent {
        async fn handle(&self, request: Request) -> Response {
            let request_id = request.id();
            match request {
                Request::Process { input, .. } => {
                    tokio::time::sleep(self.process_delay).await;
                    let output = self
                        .output
                        .lock()
                        .clone()
                        .unwrap_or_else(|| OutputMessage::with_payload(input.argument));
                    Response::Output { request_id, output }
                }
                Request::ReserveToken { token_id, .. } => {
                    self.reserved.lock().push(token_id);
                    Response::ack(request_id)
                }
                Request::ReleaseToken { token_id, .. } => {
                    self.released.lock().push(token_id);
                    Response::ack(request_id)
                }
                Request::ListTokens { .. } => Response::Tokens {
                    request_id,
                    tokens: vec![TokenStatus {
                        descriptor: descriptor(),
                        reserved: !self.reserved.lock().is_empty(),
                    }],
                },
                _ => Response::ack(request_id),
            }
        }
    }

    fn descriptor() -> TokenDescriptor {
        TokenDescriptor {
            uid: "t1".to_string(),
            agent_id: "a1".to_string(),
            attributes: HashMap::from([("att1".to_string(), "val1".to_string())]),
            selection_patterns: HashMap::new(),
            capacity: 1,
        }
    }

    async fn setup(agent: ScriptedAgent) -> (Grid, GridClient, Arc<ScriptedAgent>, Peer, TempDir) {
        let dir = TempDir::new().unwrap();
        let grid = Grid::bind(
            GridConf::default()
                .with_bind("127.0.0.1:0")
                .with_file_manager_dir(dir.path())
                .with_local_agent_dir(dir.path().join("local")),
        )
        .await
        .unwrap();
        let agent = Arc::new(agent);
        let stream = TcpStream::connect(grid.local_addr()).await.unwrap();
        let peer = Peer::spawn("grid", stream, agent.clone());
        peer.call(
            Request::register_tokens(AgentRegistration {
                agent_id: "a1".to_string(),
                agent_url: "test://a1".to_string(),
                tokens: vec![descriptor()],
            }),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let client = grid.client();
        (grid, client, agent, peer, dir)
    }

    fn interests() -> HashMap<String, Interest> {
        HashMap::from([("att1".to_string(), Interest::new("val.*", true).unwrap())])
    }

    #[tokio::test]
    async fn test_call_and_return() {
        let (grid, client, agent, _peer, _dir) = setup(ScriptedAgent::default()).await;

        let handle = client
            .get_token_handle(HashMap::new(), interests(), Duration::from_secs(1), true)
            .await
            .unwrap();
        assert_eq!(handle.token_id(), "t1");
        assert_eq!(handle.agent_url(), "test://a1");
        assert_eq!(grid.tokens().available_count(), 0);

        let output = client
            .call(&handle, client.input_message("f", "echo", json!({"arg1": "val1"})))
            .await;
        assert_eq!(output.payload, Some(json!({"arg1": "val1"})));
        assert!(output.error.is_none());

        client.return_token_handle(handle).await.unwrap();
        assert_eq!(agent.released.lock().as_slice(), ["t1".to_string()]);
        assert_eq!(grid.tokens().available_count(), 1);
    }

    #[tokio::test]
    async fn test_handle_without_session() {
        let (grid, client, agent, _peer, _dir) = setup(ScriptedAgent::default()).await;

        let handle = client
            .get_token_handle(HashMap::new(), interests(), Duration::from_secs(1), false)
            .await
            .unwrap();
        assert!(!handle.has_session());
        assert!(agent.reserved.lock().is_empty());

        let output = client.call(&handle, client.input_message("f", "echo", json!(1))).await;
        assert_eq!(output.payload, Some(json!(1)));

        client.return_token_handle(handle).await.unwrap();
        assert!(agent.released.lock().is_empty());
        assert_eq!(grid.tokens().available_count(), 1);
    }

    #[tokio::test]
    async fn test_session_opened_on_request() {
        let (_grid, client, agent, _peer, _dir) = setup(ScriptedAgent::default()).await;

        let handle = client
            .get_token_handle(HashMap::new(), interests(), client.selection_timeouts(), true)
            .await
            .unwrap();
        assert!(handle.has_session());
        assert!(!handle.is_local());
        assert_eq!(agent.reserved.lock().as_slice(), ["t1".to_string()]);
    }

    #[tokio::test]
    async fn test_local_token_runs_in_process() {
        let (grid, client, agent, _peer, dir) = setup(ScriptedAgent::default()).await;

        let handle = client.get_local_token_handle().await.unwrap();
        assert!(handle.is_local());
        assert!(!handle.has_session());
        assert_eq!(handle.agent_id(), LOCAL_AGENT_ID);
        assert_eq!(handle.agent_url(), LOCAL_AGENT_URL);
        assert!(handle.attributes().is_empty());

        let output = client
            .call(&handle, client.input_message("compute", "echo", json!({"x": 1})))
            .await;
        assert_eq!(output.payload, Some(json!({"x": 1})));
        assert!(output.error.is_none());
        assert!(output.measures.iter().any(|measure| measure.name == "compute"));

        let missing = client
            .call(&handle, client.input_message("compute", "does.not.Exist", json!({})))
            .await;
        assert!(missing.error.unwrap().contains("does.not.Exist"));

        // the grid's tokens are untouched
        assert_eq!(grid.tokens().available_count(), 1);
        assert!(agent.reserved.lock().is_empty());
        assert!(dir.path().join("local").is_dir());

        client.return_token_handle(handle.clone()).await.unwrap();
        let after_return = client.call(&handle, client.input_message("f", "echo", json!({}))).await;
        assert!(after_return.is_error());
    }

    #[tokio::test]
    async fn test_list_agent_tokens() {
        let (_grid, client, _agent, _peer, _dir) = setup(ScriptedAgent::default()).await;

        let tokens = client.list_agent_tokens("a1").await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].descriptor.uid, "t1");
        assert!(!tokens[0].reserved);

        let handle = client
            .get_token_handle(HashMap::new(), interests(), Duration::from_secs(1), true)
            .await
            .unwrap();
        assert!(client.list_agent_tokens("a1").await.unwrap()[0].reserved);
        client.return_token_handle(handle).await.unwrap();

        assert!(matches!(
            client.list_agent_tokens("unknown").await,
            Err(GridError::AgentUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_agent_error_mapped() {
        let output = OutputMessage::agent_error(
            "Timeout while processing request.",
            AgentError::new(AgentErrorCode::TimeoutRequestNotInterrupted)
                .with_detail(AgentError::DETAIL_TIMEOUT, "100"),
        );
        let scripted = ScriptedAgent {
            output: Mutex::new(Some(output)),
            ..Default::default()
        };
        let (_grid, client, _agent, _peer, _dir) = setup(scripted).await;

        let handle = client
            .get_token_handle(HashMap::new(), interests(), Duration::from_secs(1), true)
            .await
            .unwrap();
        let output = client.call(&handle, client.input_message("f", "h", json!({}))).await;
        let error = output.error.unwrap();
        assert!(error.starts_with("Timeout after 100ms while executing the handler on the agent. WARNING"));
        assert_eq!(
            output.agent_error.unwrap().code,
            AgentErrorCode::TimeoutRequestNotInterrupted
        );
    }

    #[tokio::test]
    async fn test_download_timeout_names_resource() {
        let (grid, client, _agent, _peer, dir) = setup(ScriptedAgent::default()).await;
        std::fs::write(dir.path().join("lib.wasm"), b"").unwrap();
        let file = client.register_file("lib.wasm", false).unwrap();

        let message = client.agent_error_message(
            &AgentError::new(AgentErrorCode::ContextBuilderFileDownloadTimeout)
                .with_detail(AgentError::DETAIL_TIMEOUT, "20000")
                .with_detail(AgentError::DETAIL_FILE_ID, file.file_id.clone()),
        );
        assert_eq!(
            message,
            format!(
                "Timeout after 20000ms while downloading the following resource from the controller: {}. You can increase the download timeout by setting grid_read_timeout_ms in the agent configuration",
                dir.path().join("lib.wasm").display()
            )
        );

        let message = client.agent_error_message(
            &AgentError::new(AgentErrorCode::ContextBuilderFileDownloadTimeout)
                .with_detail(AgentError::DETAIL_TIMEOUT, "20000"),
        );
        assert!(message.contains("while downloading a resource from the controller"));
        drop(grid);
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let scripted = ScriptedAgent {
            process_delay: Duration::from_secs(5),
            ..Default::default()
        };
        let (_grid, client, _agent, _peer, _dir) = setup(scripted).await;

        let handle = client
            .get_token_handle(HashMap::new(), interests(), Duration::from_secs(1), true)
            .await
            .unwrap();
        let output = client
            .call(&handle, InputMessage::new("f", "h", json!({})).with_call_timeout_ms(50))
            .await;
        assert_eq!(
            output.error.as_deref(),
            Some("Timeout after 50ms while calling the agent. You can increase the call timeout of the request")
        );
    }

    #[tokio::test]
    async fn test_disconnected_agent() {
        let (grid, client, _agent, peer, _dir) = setup(ScriptedAgent::default()).await;
        let handle = client
            .get_token_handle(HashMap::new(), interests(), Duration::from_secs(1), true)
            .await
            .unwrap();

        peer.close().await;
        for _ in 0..100 {
            if grid.connected_agents().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let output = client.call(&handle, client.input_message("f", "h", json!({}))).await;
        assert_eq!(
            output.error.as_deref(),
            Some("Communication error between the controller and the agent while calling the agent")
        );
        assert_eq!(output.attachments[0].name, Attachment::EXCEPTION_LOG);

        // the invalidated token disappears once returned
        assert!(matches!(
            client.return_token_handle(handle).await,
            Err(GridError::AgentUnavailable(_))
        ));
        assert!(grid.tokens().is_empty());
    }

    #[tokio::test]
    async fn test_no_matching_token() {
        let (_grid, client, _agent, _peer, _dir) = setup(ScriptedAgent::default()).await;
        let interests = HashMap::from([("att1".to_string(), Interest::exact("other"))]);

        let result = client
            .get_token_handle(HashMap::new(), interests, Duration::from_millis(20), true)
            .await;
        assert!(matches!(
            result,
            Err(GridError::Selection(crate::error::SelectionError::NoMatchingToken))
        ));
    }
}
