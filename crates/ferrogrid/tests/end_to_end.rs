//! Grid and agent running together over TCP

use ferrogrid::{Grid, GridClient, GridConf};
use ferrogrid_agent::token_pool::{TokenPool, TokenState};
use ferrogrid_agent::{Agent, AgentConf, TokenConf};
use ferrogrid_proto::{AgentErrorCode, Interest};
use ferrogrid_wasm::test_utils::test_modules::constant_handler_wasm;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Cluster {
    grid: Grid,
    client: GridClient,
    pool: Arc<TokenPool>,
    shutdown: Option<oneshot::Sender<()>>,
    agent: Option<JoinHandle<anyhow::Result<()>>>,
    grid_dir: TempDir,
    _agent_dir: TempDir,
}

impl Cluster {
    async fn start() -> Self {
        let grid_dir = TempDir::new().unwrap();
        let agent_dir = TempDir::new().unwrap();
        let grid = Grid::bind(
            GridConf::default()
                .with_bind("127.0.0.1:0")
                .with_file_manager_dir(grid_dir.path())
                .with_local_agent_dir(agent_dir.path().join("local")),
        )
        .await
        .unwrap();

        let conf = AgentConf::default()
            .with_grid_host(grid.local_addr().to_string())
            .with_working_dir(agent_dir.path())
            .with_token_group(1, TokenConf::default().with_attribute("att1", "val1"));
        let mut agent = Agent::new(conf).unwrap();
        let pool = agent.pool().clone();
        let shutdown = agent.shutdown_sender();
        let agent = tokio::spawn(async move { agent.run().await });

        for _ in 0..500 {
            if !grid.tokens().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(grid.tokens().len(), 1, "agent did not register");

        let client = grid.client();
        Self {
            grid,
            client,
            pool,
            shutdown,
            agent: Some(agent),
            grid_dir,
            _agent_dir: agent_dir,
        }
    }

    fn token_id(&self) -> String {
        self.pool.tokens()[0].uid.clone()
    }

    fn write_bundle(&self, name: &str, handlers: &[(&str, Vec<u8>)]) -> std::path::PathBuf {
        let dir = self.grid_dir.path().join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for (file, content) in handlers {
            write_touched(&dir.join(file), content);
        }
        dir
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(agent) = self.agent.take() {
            agent.await.unwrap().unwrap();
        }
        self.grid.shutdown().await;
    }
}

/// Write a file with a modification time later than any previous write
fn write_touched(path: &Path, content: &[u8]) {
    static TICK: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
    std::fs::write(path, content).unwrap();
    let offset = TICK.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(offset)).unwrap();
}

fn val_interest() -> HashMap<String, Interest> {
    HashMap::from([("att1".to_string(), Interest::new("val.*", true).unwrap())])
}

#[tokio::test(flavor = "multi_thread")]
async fn test_echo_round_trip() {
    let cluster = Cluster::start().await;
    let client = &cluster.client;

    let handle = client
        .get_token_handle(HashMap::new(), val_interest(), Duration::from_secs(5), true)
        .await
        .unwrap();
    assert_eq!(handle.attributes().get("att1"), Some(&"val1".to_string()));

    let output = client
        .call(&handle, client.input_message("f", "echo", json!({"arg1": "val1"})))
        .await;
    assert_eq!(output.payload, Some(json!({"arg1": "val1"})));
    assert!(output.error.is_none());
    assert!(output.measures.iter().any(|measure| measure.name == "f"));

    client.return_token_handle(handle).await.unwrap();
    assert_eq!(cluster.pool.state(&cluster.token_id()), Some(TokenState::Free));
    assert_eq!(cluster.grid.tokens().available_count(), 1);
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_list_agent_tokens() {
    let cluster = Cluster::start().await;
    let client = &cluster.client;
    let agent_id = cluster.pool.tokens()[0].agent_id.clone();

    let tokens = client.list_agent_tokens(&agent_id).await.unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].descriptor.uid, cluster.token_id());
    assert_eq!(tokens[0].descriptor.attributes.get("att1"), Some(&"val1".to_string()));
    assert!(!tokens[0].reserved);
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_local_token_runs_package_chain() {
    let cluster = Cluster::start().await;
    let client = &cluster.client;
    let bundle = cluster.write_bundle("local-pkg", &[("com.Bar.wasm", constant_handler_wasm(r#"{"local":true}"#))]);
    let package = client.register_file(&bundle, false).unwrap();

    let handle = client.get_local_token_handle().await.unwrap();
    let output = client
        .call(
            &handle,
            client
                .input_message("f", "ferrogrid.measure|com.Bar", json!({}))
                .with_handler_package(package),
        )
        .await;
    assert_eq!(output.payload, Some(json!({"local": true})), "error: {:?}", output.error);
    assert!(output.measures.iter().filter(|measure| measure.name == "f").count() >= 2);

    client.return_token_handle(handle).await.unwrap();
    assert_eq!(cluster.grid.tokens().available_count(), 1);
    assert_eq!(cluster.pool.state(&cluster.token_id()), Some(TokenState::Free));
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_handler_frees_token() {
    let cluster = Cluster::start().await;
    let client = &cluster.client;

    let handle = client
        .get_token_handle(HashMap::new(), val_interest(), Duration::from_secs(5), true)
        .await
        .unwrap();
    let output = client
        .call(&handle, client.input_message("f", "does.not.Exist", json!({})))
        .await;
    assert!(output.error.is_some());
    assert!(output.payload.is_none());
    assert_eq!(cluster.pool.state(&cluster.token_id()), Some(TokenState::Free));

    client.return_token_handle(handle).await.unwrap();
    assert_eq!(cluster.grid.tokens().available_count(), 1);
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handler_package_download_and_update() {
    let cluster = Cluster::start().await;
    let client = &cluster.client;
    let bundle = cluster.write_bundle("pkg", &[("com.Foo.wasm", constant_handler_wasm(r#"{"v":1}"#))]);
    let v1 = client.register_file(&bundle, false).unwrap();

    let handle = client
        .get_token_handle(HashMap::new(), val_interest(), Duration::from_secs(5), true)
        .await
        .unwrap();
    let output = client
        .call(
            &handle,
            client.input_message("f", "com.Foo", json!({})).with_handler_package(v1.clone()),
        )
        .await;
    assert_eq!(output.payload, Some(json!({"v": 1})), "error: {:?}", output.error);

    write_touched(&bundle.join("com.Foo.wasm"), &constant_handler_wasm(r#"{"v":2}"#));
    let v2 = client.register_file(&bundle, false).unwrap();
    assert_eq!(v2.file_id, v1.file_id);
    assert_ne!(v2.version, v1.version);

    let output = client
        .call(
            &handle,
            client.input_message("f", "com.Foo", json!({})).with_handler_package(v2),
        )
        .await;
    assert_eq!(output.payload, Some(json!({"v": 2})), "error: {:?}", output.error);

    client.return_token_handle(handle).await.unwrap();
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unregistered_package_reports_download_error() {
    let cluster = Cluster::start().await;
    let client = &cluster.client;
    let bundle = cluster.write_bundle("gone", &[("h.wasm", constant_handler_wasm("{}"))]);
    let file = client.register_file(&bundle, true).unwrap();
    assert!(client.unregister_file(&file.file_id).unwrap());

    let handle = client
        .get_token_handle(HashMap::new(), val_interest(), Duration::from_secs(5), true)
        .await
        .unwrap();
    let output = client
        .call(&handle, client.input_message("f", "h", json!({})).with_handler_package(file))
        .await;
    assert_eq!(
        output.error.as_deref(),
        Some("Error while downloading a resource from the controller")
    );
    assert_eq!(
        output.agent_error.unwrap().code,
        AgentErrorCode::ContextBuilderFileDownloadError
    );

    client.return_token_handle(handle).await.unwrap();
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interrupted_timeout() {
    let cluster = Cluster::start().await;
    let client = &cluster.client;

    let handle = client
        .get_token_handle(HashMap::new(), val_interest(), Duration::from_secs(5), true)
        .await
        .unwrap();
    let output = client
        .call(
            &handle,
            client
                .input_message("f", "ferrogrid.sleep", json!({"durationMs": 10_000}))
                .with_call_timeout_ms(200),
        )
        .await;
    assert_eq!(
        output.agent_error.as_ref().map(|error| error.code),
        Some(AgentErrorCode::TimeoutRequestInterrupted)
    );
    assert!(output
        .error
        .unwrap()
        .starts_with("Timeout after 200ms while executing the handler on the agent."));
    assert_eq!(cluster.pool.state(&cluster.token_id()), Some(TokenState::Free));

    client.return_token_handle(handle).await.unwrap();
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_agent_shutdown_invalidates_tokens() {
    let cluster = Cluster::start().await;
    let Cluster {
        grid,
        client,
        shutdown,
        agent,
        ..
    } = cluster;

    let _ = shutdown.unwrap().send(());
    agent.unwrap().await.unwrap().unwrap();
    assert!(grid.tokens().is_empty());
    assert!(grid.connected_agents().is_empty());

    let result = client
        .get_token_handle(HashMap::new(), val_interest(), Duration::from_millis(50), true)
        .await;
    assert!(matches!(
        result,
        Err(ferrogrid::GridError::Selection(ferrogrid::SelectionError::NoMatchingToken))
    ));
}
