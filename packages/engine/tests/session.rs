//! End-to-end protocol scenarios driven through an in-memory transport
//! against a /bin/sh-backed runtime.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine::error::TransportError;
use engine::runtime::{RuntimeDescriptor, RuntimeRegistry, StageLimits};
use engine::sandbox::SandboxPool;
use engine::session::{Session, SessionTransport};
use engine::EngineConfig;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug)]
enum ClientEvent {
    Frame(Value),
    Closed(u16),
}

struct ChannelTransport {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<ClientEvent>,
}

#[async_trait]
impl SessionTransport for ChannelTransport {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let value = serde_json::from_str(&frame).map_err(|e| TransportError(e.to_string()))?;
        self.outbound
            .send(ClientEvent::Frame(value))
            .map_err(|e| TransportError(e.to_string()))
    }

    async fn close(&mut self, code: u16) -> Result<(), TransportError> {
        let _ = self.outbound.send(ClientEvent::Closed(code));
        Ok(())
    }
}

struct TestClient {
    to_session: Option<mpsc::UnboundedSender<String>>,
    from_session: mpsc::UnboundedReceiver<ClientEvent>,
    session: JoinHandle<()>,
    pool: Arc<SandboxPool>,
    _scratch: tempfile::TempDir,
}

fn stage_limits(timeout_ms: i64) -> StageLimits {
    StageLimits {
        timeout_ms,
        cpu_time_ms: timeout_ms,
        memory_bytes: -1,
    }
}

fn shell_runtime() -> RuntimeDescriptor {
    RuntimeDescriptor {
        language: "shell".into(),
        version: semver::Version::new(1, 0, 0),
        aliases: vec!["sh".into()],
        compiled: false,
        compile_cmd: None,
        run_cmd: vec!["/bin/sh".into(), "{file}".into()],
        compile_limits: stage_limits(10_000),
        run_limits: stage_limits(5_000),
    }
}

/// "Compiled" shell: the submitted build script must produce `app.sh`.
fn compiled_shell_runtime() -> RuntimeDescriptor {
    RuntimeDescriptor {
        language: "shellc".into(),
        aliases: Vec::new(),
        version: semver::Version::new(1, 0, 0),
        compiled: true,
        compile_cmd: Some(vec!["/bin/sh".into(), "{file}".into()]),
        run_cmd: vec!["/bin/sh".into(), "app.sh".into()],
        compile_limits: stage_limits(10_000),
        run_limits: stage_limits(5_000),
    }
}

impl TestClient {
    fn spawn(init_timeout_ms: u64) -> Self {
        let scratch = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::load().unwrap();
        config.sandbox_root = scratch.path().to_string_lossy().to_string();
        config.max_concurrent_jobs = 2;
        config.init_timeout = init_timeout_ms;
        let config = Arc::new(config);

        let mut registry = RuntimeRegistry::new();
        registry.insert(shell_runtime());
        registry.insert(compiled_shell_runtime());

        let pool = SandboxPool::new(&config);
        let (to_session, inbound) = mpsc::unbounded_channel();
        let (outbound, from_session) = mpsc::unbounded_channel();
        let transport = ChannelTransport { inbound, outbound };
        let session = Session::new(transport, Arc::new(registry), Arc::clone(&pool), config);
        let session = tokio::spawn(session.run());
        Self {
            to_session: Some(to_session),
            from_session,
            session,
            pool,
            _scratch: scratch,
        }
    }

    fn send(&self, message: Value) {
        self.to_session
            .as_ref()
            .expect("client still connected")
            .send(message.to_string())
            .expect("session alive");
    }

    async fn next(&mut self) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(30), self.from_session.recv())
            .await
            .expect("session response within deadline")
            .expect("session did not hang up silently")
    }

    async fn expect_frame(&mut self, kind: &str) -> Value {
        match self.next().await {
            ClientEvent::Frame(frame) => {
                assert_eq!(frame["type"], kind, "unexpected frame: {frame}");
                frame
            }
            ClientEvent::Closed(code) => panic!("expected {kind} frame, got close {code}"),
        }
    }

    async fn expect_close(&mut self, code: u16) {
        match self.next().await {
            ClientEvent::Closed(actual) => assert_eq!(actual, code),
            ClientEvent::Frame(frame) => panic!("expected close {code}, got frame {frame}"),
        }
    }

    /// Drop the inbound channel, simulating abrupt transport loss.
    fn disconnect(&mut self) {
        self.to_session = None;
    }

    async fn join(self) -> Arc<SandboxPool> {
        tokio::time::timeout(Duration::from_secs(30), self.session)
            .await
            .expect("session task should finish")
            .expect("session task should not panic");
        self.pool
    }
}

fn doubler_init() -> Value {
    json!({
        "type": "init",
        "language": "sh",
        "version": "*",
        "files": [{"content": "read x; echo $((x * 2))"}]
    })
}

async fn init_doubler(client: &mut TestClient) {
    client.send(doubler_init());
    let ready = client.expect_frame("ready").await;
    assert_eq!(ready["language"], "shell");
    assert_eq!(ready["compiled"], false);
    let compiled = client.expect_frame("compiled").await;
    assert_eq!(compiled["success"], true);
    assert_eq!(compiled["time"], 0);
    assert_eq!(compiled["stdout"], "");
    assert_eq!(compiled["stderr"], "");
    assert_eq!(compiled["error"], Value::Null);
}

#[tokio::test]
async fn doubler_session_runs_and_closes() {
    let mut client = TestClient::spawn(5_000);
    init_doubler(&mut client).await;

    client.send(json!({"type": "run_test", "stdin": "5\n", "test_id": 1}));
    let result = client.expect_frame("result").await;
    assert_eq!(result["test_id"], 1);
    assert_eq!(result["stdout"], "10\n");
    assert_eq!(result["stderr"], "");
    assert_eq!(result["code"], 0);
    assert_eq!(result["signal"], Value::Null);
    assert_eq!(result["status"], "OK");
    let time = result["time"].as_u64().unwrap();

    client.send(json!({"type": "close"}));
    let done = client.expect_frame("done").await;
    assert_eq!(done["total_tests"], 1);
    assert_eq!(done["total_time"].as_u64().unwrap(), time);
    client.expect_close(4999).await;
    client.join().await;
}

#[tokio::test]
async fn missing_test_id_counts_from_one() {
    let mut client = TestClient::spawn(5_000);
    init_doubler(&mut client).await;

    client.send(json!({"type": "run_test", "stdin": "1\n"}));
    assert_eq!(client.expect_frame("result").await["test_id"], 1);
    client.send(json!({"type": "run_test", "stdin": "2\n"}));
    assert_eq!(client.expect_frame("result").await["test_id"], 2);
    // A client-supplied id is echoed verbatim without advancing the counter.
    client.send(json!({"type": "run_test", "stdin": "3\n", "test_id": "custom"}));
    assert_eq!(client.expect_frame("result").await["test_id"], "custom");
    client.send(json!({"type": "run_test", "stdin": "4\n"}));
    assert_eq!(client.expect_frame("result").await["test_id"], 3);

    client.send(json!({"type": "close"}));
    client.expect_frame("done").await;
    client.expect_close(4999).await;
    client.join().await;
}

#[tokio::test]
async fn batch_returns_one_aggregated_record() {
    let mut client = TestClient::spawn(5_000);
    init_doubler(&mut client).await;

    client.send(json!({
        "type": "run_batch",
        "test_cases": [{"stdin": "1\n"}, {"stdin": "2\n"}, {"stdin": "3\n"}]
    }));
    let batch = client.expect_frame("batch_result").await;
    assert_eq!(batch["total_tests"], 3);
    assert_eq!(batch["success"], true);
    assert_eq!(batch["stderr"], "");
    let results = batch["results"].as_array().unwrap();
    let outputs: Vec<&str> = results.iter().map(|r| r["stdout"].as_str().unwrap()).collect();
    assert_eq!(outputs, ["2\n", "4\n", "6\n"]);
    let times: u64 = results.iter().map(|r| r["time"].as_u64().unwrap()).sum();
    assert_eq!(batch["total_time"].as_u64().unwrap(), times);

    client.send(json!({"type": "close"}));
    let done = client.expect_frame("done").await;
    assert_eq!(done["total_tests"], 3);
    client.expect_close(4999).await;
    client.join().await;
}

#[tokio::test]
async fn empty_batch_is_rejected_without_closing() {
    let mut client = TestClient::spawn(5_000);
    init_doubler(&mut client).await;

    client.send(json!({"type": "run_batch", "test_cases": []}));
    let error = client.expect_frame("error").await;
    assert!(error["message"].as_str().unwrap().contains("test_cases"));

    // Session is still serving.
    client.send(json!({"type": "run_test", "stdin": "2\n"}));
    assert_eq!(client.expect_frame("result").await["stdout"], "4\n");
    client.send(json!({"type": "close"}));
    client.expect_frame("done").await;
    client.expect_close(4999).await;
    client.join().await;
}

#[tokio::test]
async fn command_before_init_closes_4003_with_no_prior_output() {
    let mut client = TestClient::spawn(5_000);
    client.send(json!({"type": "run_test", "stdin": ""}));
    client.expect_close(4003).await;
    client.join().await;
}

#[tokio::test]
async fn second_init_closes_4000() {
    let mut client = TestClient::spawn(5_000);
    init_doubler(&mut client).await;
    client.send(doubler_init());
    client.expect_close(4000).await;
    client.join().await;
}

#[tokio::test]
async fn init_timeout_closes_4001() {
    let mut client = TestClient::spawn(100);
    client.expect_close(4001).await;
    client.join().await;
}

#[tokio::test]
async fn unknown_type_before_init_keeps_the_grace_period_open() {
    let mut client = TestClient::spawn(5_000);
    client.send(json!({"type": "bogus"}));
    let error = client.expect_frame("error").await;
    assert_eq!(
        error["message"],
        "Unknown message type: bogus"
    );
    init_doubler(&mut client).await;
    client.send(json!({"type": "close"}));
    client.expect_frame("done").await;
    client.expect_close(4999).await;
    client.join().await;
}

#[tokio::test]
async fn invalid_init_payload_closes_4002() {
    let mut client = TestClient::spawn(5_000);
    client.send(json!({
        "type": "init",
        "language": "sh",
        "version": "*",
        "files": []
    }));
    let error = client.expect_frame("error").await;
    assert!(error["message"].as_str().unwrap().contains("files"));
    client.expect_close(4002).await;
    client.join().await;
}

#[tokio::test]
async fn unknown_runtime_closes_4002() {
    let mut client = TestClient::spawn(5_000);
    client.send(json!({
        "type": "init",
        "language": "cobol",
        "version": "*",
        "files": [{"content": "DISPLAY 'HI'."}]
    }));
    let error = client.expect_frame("error").await;
    assert!(error["message"].as_str().unwrap().contains("cobol"));
    client.expect_close(4002).await;
    client.join().await;
}

#[tokio::test]
async fn limit_above_configured_maximum_is_rejected_at_init() {
    let mut client = TestClient::spawn(5_000);
    client.send(json!({
        "type": "init",
        "language": "sh",
        "version": "*",
        "files": [{"content": "true"}],
        "run_timeout": 999_999
    }));
    let error = client.expect_frame("error").await;
    assert!(error["message"].as_str().unwrap().contains("exceeds"));
    client.expect_close(4002).await;
    client.join().await;
}

#[tokio::test]
async fn compile_failure_reports_and_closes_4006() {
    let mut client = TestClient::spawn(5_000);
    client.send(json!({
        "type": "init",
        "language": "shellc",
        "version": "*",
        "files": [{"content": "echo no such tool >&2; exit 1"}]
    }));
    let ready = client.expect_frame("ready").await;
    assert_eq!(ready["compiled"], true);
    let compiled = client.expect_frame("compiled").await;
    assert_eq!(compiled["success"], false);
    assert_eq!(compiled["stderr"], "no such tool\n");
    assert!(compiled["error"].is_string());
    client.expect_close(4006).await;
    client.join().await;
}

#[tokio::test]
async fn compiled_runtime_round_trip() {
    let mut client = TestClient::spawn(5_000);
    client.send(json!({
        "type": "init",
        "language": "shellc",
        "version": "*",
        "files": [{"content": "printf 'read x\\necho $((x + 1))\\n' > app.sh"}]
    }));
    client.expect_frame("ready").await;
    let compiled = client.expect_frame("compiled").await;
    assert_eq!(compiled["success"], true, "stderr: {}", compiled["stderr"]);

    client.send(json!({"type": "run_test", "stdin": "41\n"}));
    assert_eq!(client.expect_frame("result").await["stdout"], "42\n");
    client.send(json!({"type": "close"}));
    client.expect_frame("done").await;
    client.expect_close(4999).await;
    client.join().await;
}

#[tokio::test]
async fn time_limited_test_reports_time_limit_status() {
    let mut client = TestClient::spawn(5_000);
    client.send(json!({
        "type": "init",
        "language": "sh",
        "version": "*",
        "files": [{"content": "sleep 30"}]
    }));
    client.expect_frame("ready").await;
    client.expect_frame("compiled").await;

    client.send(json!({"type": "run_test", "stdin": "", "timeout": 200}));
    let result = client.expect_frame("result").await;
    assert_eq!(result["status"], "TimeLimit");
    assert_eq!(result["code"], Value::Null);
    let signal = result["signal"].as_str().unwrap();
    assert!(signal == "SIGTERM" || signal == "SIGKILL", "signal: {signal}");
    let time = result["time"].as_u64().unwrap();
    assert!((200..5_000).contains(&time), "time: {time}");

    client.send(json!({"type": "close"}));
    client.expect_frame("done").await;
    client.expect_close(4999).await;
    client.join().await;
}

#[tokio::test]
async fn malformed_frame_after_init_is_not_fatal() {
    let mut client = TestClient::spawn(5_000);
    init_doubler(&mut client).await;

    client.send(json!({"type": "run_test", "stdin": 42}));
    let error = client.expect_frame("error").await;
    assert!(error["message"].as_str().unwrap().contains("invalid message"));

    client.send(json!({"type": "run_test", "stdin": "10\n"}));
    assert_eq!(client.expect_frame("result").await["stdout"], "20\n");
    client.send(json!({"type": "close"}));
    client.expect_frame("done").await;
    client.expect_close(4999).await;
    client.join().await;
}

#[tokio::test]
async fn disconnect_releases_the_sandbox_identity() {
    let mut client = TestClient::spawn(5_000);
    init_doubler(&mut client).await;
    client.send(json!({"type": "run_test", "stdin": "1\n"}));
    client.expect_frame("result").await;

    client.disconnect();
    let pool = client.join().await;

    // Cleanup ran: the full pool of two identities is available at once.
    let mut first = tokio::time::timeout(Duration::from_secs(5), pool.acquire())
        .await
        .expect("identity available after cleanup")
        .unwrap();
    let mut second = tokio::time::timeout(Duration::from_secs(5), pool.acquire())
        .await
        .expect("second identity available after cleanup")
        .unwrap();
    pool.release(&mut first).await;
    pool.release(&mut second).await;
}
