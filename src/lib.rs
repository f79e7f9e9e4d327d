pub mod config;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod mcp;
pub mod server;
pub mod transport;

pub use errors::{McpError, TransportError};
pub use mcp::{Session, SessionConfig, SessionState, SessionStats};

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use serde_json::{json, Value};
    use tokio::{
        io::{
            duplex, split, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream,
            Lines, ReadHalf, WriteHalf,
        },
        task::JoinHandle,
        time::timeout,
    };

    use crate::domain::tools::ToolRegistry;
    use crate::errors::codes;
    use crate::transport::{Framing, StreamTransport, TransportConfig};

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    struct TestClient {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl TestClient {
        async fn send(&mut self, message: Value) {
            let mut line = message.to_string();
            line.push('\n');
            self.send_raw(line.as_bytes()).await;
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.expect("client write");
        }

        async fn recv(&mut self) -> Value {
            let line = timeout(WAIT, self.lines.next_line())
                .await
                .expect("message in time")
                .expect("client read")
                .expect("connection open");
            serde_json::from_str(&line).expect("server sent valid json")
        }

        async fn recv_response(&mut self) -> Value {
            loop {
                let message = self.recv().await;
                if message.get("id").is_some() {
                    return message;
                }
            }
        }

        async fn request(&mut self, message: Value) -> Value {
            self.send(message).await;
            self.recv_response().await
        }

        async fn expect_closed(&mut self) {
            let next = timeout(WAIT, self.lines.next_line())
                .await
                .expect("close in time")
                .expect("client read");
            assert!(next.is_none(), "expected EOF, got {next:?}");
        }

        async fn handshake(&mut self) {
            let response = self
                .request(json!({
                    "jsonrpc": "2.0",
                    "id": "init",
                    "method": "initialize",
                    "params": {
                        "protocolVersion": "2024-11-05",
                        "clientInfo": {"name": "t", "version": "1"}
                    }
                }))
                .await;
            assert!(response.get("result").is_some(), "initialize failed: {response}");
            self.send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
                .await;
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            enable_keep_alive: false,
            ..SessionConfig::default()
        }
    }

    type Running = (Arc<Session>, JoinHandle<Result<(), McpError>>, TestClient);

    fn start_with(config: SessionConfig, transport_config: TransportConfig) -> Running {
        start_with_capacity(config, transport_config, 64 * 1024)
    }

    fn start_with_capacity(
        config: SessionConfig,
        transport_config: TransportConfig,
        capacity: usize,
    ) -> Running {
        let (server, client) = duplex(capacity);
        let (read, write) = split(server);
        let transport = StreamTransport::new(read, write, "duplex", transport_config);
        let registry = Arc::new(ToolRegistry::with_default_tools().expect("registry"));

        let session = Arc::new(Session::new(Arc::new(transport), config, registry));
        session.initialize().expect("initialize session");
        let runner = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.run().await }
        });

        let (read, writer) = split(client);
        let client = TestClient {
            lines: BufReader::new(read).lines(),
            writer,
        };
        (session, runner, client)
    }

    fn start(config: SessionConfig) -> Running {
        start_with(config, TransportConfig::new(Framing::Newline))
    }

    fn error_code(response: &Value) -> i64 {
        response["error"]["code"].as_i64().expect("error response")
    }

    fn call_tool(id: &str, name: &str, arguments: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {"name": name, "arguments": arguments}
        })
    }

    #[tokio::test]
    async fn initialize_reports_server_info_and_protocol_version() {
        let (session, _runner, mut client) = start(test_config());
        session.set_server_info("bench-device", "9.9.9");

        let response = client
            .request(json!({
                "jsonrpc": "2.0",
                "id": "1",
                "method": "initialize",
                "params": {
                    "protocolVersion": "2024-11-05",
                    "clientInfo": {"name": "t", "version": "1"}
                }
            }))
            .await;

        assert_eq!(response["jsonrpc"], "2.0");
        assert_eq!(response["id"], "1");
        assert_eq!(response["result"]["protocolVersion"], "2024-11-05");
        assert_eq!(response["result"]["serverInfo"]["name"], "bench-device");
        assert_eq!(response["result"]["serverInfo"]["version"], "9.9.9");
        assert_eq!(response["result"]["capabilities"]["tools"]["listChanged"], false);
        assert!(response["result"]["capabilities"]["logging"].is_object());
        assert_eq!(session.state(), SessionState::Initialized);
    }

    #[tokio::test]
    async fn tools_are_refused_until_initialized_notification() {
        let (session, _runner, mut client) = start(test_config());

        let response = client
            .request(json!({"jsonrpc": "2.0", "id": "2", "method": "tools/list"}))
            .await;
        assert_eq!(error_code(&response), codes::NOT_INITIALIZED as i64);

        client
            .request(json!({
                "jsonrpc": "2.0",
                "id": "init",
                "method": "initialize",
                "params": {
                    "protocolVersion": "2024-11-05",
                    "clientInfo": {"name": "t", "version": "1"}
                }
            }))
            .await;
        let response = client
            .request(call_tool("3", "echo", json!({"text": "early"})))
            .await;
        assert_eq!(response["id"], "3");
        assert_eq!(error_code(&response), -32001);
        assert!(response.get("result").is_none());

        client
            .send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        let response = client
            .request(json!({"jsonrpc": "2.0", "id": "4", "method": "tools/list"}))
            .await;
        assert_eq!(response["result"]["tools"].as_array().map(Vec::len), Some(5));
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn initialized_notification_before_initialize_is_ignored() {
        let (session, _runner, mut client) = start(test_config());
        client
            .send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        let response = client
            .request(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .await;

        assert_eq!(response, json!({"jsonrpc": "2.0", "id": 1, "result": {}}));
        assert_eq!(session.state(), SessionState::Initialized);
    }

    #[tokio::test]
    async fn echo_tool_after_handshake() {
        let (_session, _runner, mut client) = start(test_config());
        client.handshake().await;

        let response = client
            .request(call_tool("3", "echo", json!({"text": "hi"})))
            .await;
        assert_eq!(response["id"], "3");
        assert_eq!(response["result"]["content"][0]["type"], "text");
        assert_eq!(response["result"]["content"][0]["text"], "Echo: hi");

        let response = client
            .request(call_tool("5", "gpio_control", json!({"pin": 2, "state": "high"})))
            .await;
        assert_eq!(response["result"]["content"][0]["text"], "GPIO pin 2 set to high");

        let response = client.request(call_tool("6", "echo", json!({}))).await;
        assert_eq!(error_code(&response), codes::INVALID_PARAMS as i64);
    }

    #[tokio::test]
    async fn unknown_tool_is_reported() {
        let (_session, _runner, mut client) = start(test_config());
        client.handshake().await;

        let response = client.request(call_tool("4", "nope", json!({}))).await;
        assert_eq!(response["id"], "4");
        assert_eq!(error_code(&response), codes::TOOL_NOT_FOUND as i64);
        assert_eq!(response["error"]["data"], "nope");
    }

    #[tokio::test]
    async fn unknown_method_echoes_request_id() {
        let (_session, _runner, mut client) = start(test_config());

        let response = client
            .request(json!({"jsonrpc": "2.0", "id": 42, "method": "resources/list"}))
            .await;
        assert_eq!(response["id"], 42);
        assert_eq!(error_code(&response), codes::METHOD_NOT_FOUND as i64);
        assert_eq!(response["error"]["message"], "Method not found");
    }

    #[tokio::test]
    async fn malformed_input_is_answered_and_connection_survives() {
        let (_session, _runner, mut client) = start(test_config());

        client.send_raw(b"{this is not json\n").await;
        let response = client.recv_response().await;
        assert_eq!(response["id"], Value::Null);
        assert_eq!(error_code(&response), codes::PARSE_ERROR as i64);

        let response = client
            .request(json!({"id": 8, "method": "ping"}))
            .await;
        assert_eq!(response["id"], 8);
        assert_eq!(error_code(&response), codes::INVALID_REQUEST as i64);

        let response = client
            .request(json!([{"jsonrpc": "2.0", "id": 9, "method": "ping"}]))
            .await;
        assert_eq!(response["id"], Value::Null);
        assert_eq!(error_code(&response), codes::INVALID_REQUEST as i64);

        let response = client
            .request(json!({"jsonrpc": "2.0", "id": 10, "method": "ping"}))
            .await;
        assert_eq!(response["result"], json!({}));
    }

    #[tokio::test]
    async fn oversized_frame_gets_null_id_error() {
        let transport_config = TransportConfig {
            max_message_size: 256,
            ..TransportConfig::new(Framing::Newline)
        };
        let (_session, _runner, mut client) = start_with(test_config(), transport_config);

        let padding = "x".repeat(400);
        client
            .send(json!({"jsonrpc": "2.0", "id": 1, "method": "ping", "params": {"pad": padding}}))
            .await;
        let response = client.recv_response().await;
        assert_eq!(response["id"], Value::Null);
        assert_eq!(error_code(&response), codes::MESSAGE_TOO_LARGE as i64);

        let response = client
            .request(json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}))
            .await;
        assert_eq!(response["id"], 2);
    }

    #[tokio::test]
    async fn http_probe_closes_connection_without_reply() {
        let (session, runner, mut client) = start(test_config());

        client
            .send_raw(b"GET / HTTP/1.1\r\nHost: device.local\r\n\r\n")
            .await;
        client.expect_closed().await;

        timeout(WAIT, runner)
            .await
            .expect("run returns")
            .expect("join")
            .expect("run ok");
        assert_eq!(session.state(), SessionState::Shutdown);
    }

    #[tokio::test]
    async fn long_running_task_reports_progress() {
        let (session, _runner, mut client) = start(test_config());
        client.handshake().await;

        client
            .send(json!({
                "jsonrpc": "2.0",
                "id": "job",
                "method": "tools/call",
                "params": {
                    "name": "long_running_task",
                    "arguments": {"steps": 3},
                    "_meta": {"progressToken": "p1"}
                }
            }))
            .await;

        let mut progress = Vec::new();
        let response = loop {
            let message = client.recv().await;
            if message["method"] == "notifications/progress" {
                assert_eq!(message["params"]["progressToken"], "p1");
                assert_eq!(message["params"]["total"], 3);
                progress.push(message["params"]["progress"].as_u64().expect("progress"));
            } else {
                break message;
            }
        };

        assert_eq!(progress, vec![1, 2, 3]);
        assert_eq!(response["id"], "job");
        assert_eq!(response["result"]["content"][0]["text"], "Completed 3 steps");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(session.pending_task_count(), 0);
        assert_eq!(session.stats().tasks_completed, 1);
    }

    #[tokio::test]
    async fn cancelled_task_is_never_answered() {
        let (session, _runner, mut client) = start(test_config());
        client.handshake().await;

        client
            .send(call_tool("slow", "long_running_task", json!({"steps": 100})))
            .await;
        client
            .send(json!({
                "jsonrpc": "2.0",
                "method": "notifications/cancelled",
                "params": {"requestId": "slow", "reason": "user abort"}
            }))
            .await;

        let response = client
            .request(json!({"jsonrpc": "2.0", "id": "after", "method": "ping"}))
            .await;
        assert_eq!(response["id"], "after");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(session.pending_task_count(), 0);
        assert_eq!(session.stats().tasks_cancelled, 1);
    }

    #[tokio::test]
    async fn excess_tasks_hit_resource_limit() {
        let config = SessionConfig {
            max_pending_tasks: 1,
            ..test_config()
        };
        let (session, _runner, mut client) = start(config);
        client.handshake().await;

        client
            .send(call_tool("t1", "long_running_task", json!({"steps": 100})))
            .await;
        let response = client
            .request(call_tool("t2", "long_running_task", json!({"steps": 100})))
            .await;
        assert_eq!(response["id"], "t2");
        assert_eq!(error_code(&response), codes::RESOURCE_LIMIT as i64);
        assert_eq!(session.pending_task_count(), 1);
    }

    #[tokio::test]
    async fn slow_task_times_out() {
        let config = SessionConfig {
            task_timeout: Duration::from_millis(150),
            ..test_config()
        };
        let (_session, _runner, mut client) = start(config);
        client.handshake().await;

        let response = client
            .request(call_tool("late", "long_running_task", json!({"steps": 100})))
            .await;
        assert_eq!(response["id"], "late");
        assert_eq!(error_code(&response), codes::TIMEOUT as i64);
    }

    #[tokio::test]
    async fn tools_list_paginates_when_enabled() {
        let config = SessionConfig {
            enable_tools_pagination: true,
            ..test_config()
        };
        let (_session, _runner, mut client) = start(config);
        client.handshake().await;

        let first = client
            .request(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "tools/list",
                "params": {"maxResults": 2}
            }))
            .await;
        let names: Vec<&str> = first["result"]["tools"]
            .as_array()
            .expect("tools")
            .iter()
            .filter_map(|tool| tool["name"].as_str())
            .collect();
        assert_eq!(names, vec!["echo", "gpio_control"]);
        assert_eq!(first["result"]["nextCursor"], "2");
        assert!(first["result"]["tools"][0]["inputSchema"].is_object());

        let second = client
            .request(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/list",
                "params": {"cursor": "2"}
            }))
            .await;
        let names: Vec<&str> = second["result"]["tools"]
            .as_array()
            .expect("tools")
            .iter()
            .filter_map(|tool| tool["name"].as_str())
            .collect();
        assert_eq!(names, vec!["long_running_task", "system_info", "network_scan"]);
        assert!(second["result"].get("nextCursor").is_none());

        let invalid = client
            .request(json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/list",
                "params": {"cursor": "abc"}
            }))
            .await;
        assert_eq!(error_code(&invalid), codes::INVALID_PARAMS as i64);
    }

    #[tokio::test]
    async fn keep_alive_pings_an_idle_client() {
        let config = SessionConfig {
            enable_keep_alive: true,
            keep_alive_interval: Duration::from_millis(50),
            keep_alive_idle: Duration::from_millis(20),
            ..SessionConfig::default()
        };
        let (_session, _runner, mut client) = start(config);

        let ping = client.recv().await;
        assert_eq!(ping["method"], "ping");
        assert_eq!(ping["id"], "keepalive-1");

        client
            .send(json!({"jsonrpc": "2.0", "id": "keepalive-1", "result": {}}))
            .await;
    }

    #[tokio::test]
    async fn short_garbage_line_is_a_parse_error() {
        let (session, _runner, mut client) = start(test_config());

        client.send_raw(b"H\n").await;
        let response = client.recv_response().await;
        assert_eq!(response["id"], Value::Null);
        assert_eq!(error_code(&response), codes::PARSE_ERROR as i64);

        let response = client
            .request(json!({"jsonrpc": "2.0", "id": "still-open", "method": "ping"}))
            .await;
        assert_eq!(response["id"], "still-open");
        assert_eq!(session.state(), SessionState::Initialized);
    }

    #[tokio::test]
    async fn network_scan_reports_progress_and_results() {
        let (_session, _runner, mut client) = start(test_config());
        client.handshake().await;

        client
            .send(json!({
                "jsonrpc": "2.0",
                "id": "scan",
                "method": "tools/call",
                "params": {
                    "name": "network_scan",
                    "arguments": {"max_results": 2, "include_rssi": true},
                    "_meta": {"progressToken": 11}
                }
            }))
            .await;

        let mut progress = Vec::new();
        let response = loop {
            let message = client.recv().await;
            if message["method"] == "notifications/progress" {
                assert_eq!(message["params"]["progressToken"], "11");
                progress.push(message["params"]["progress"].as_u64().expect("progress"));
            } else {
                break message;
            }
        };

        assert_eq!(progress, vec![0, 50, 100]);
        assert_eq!(response["id"], "scan");
        let networks = response["result"]["structuredContent"]["networks"]
            .as_array()
            .expect("networks");
        assert_eq!(networks.len(), 2);
        assert!(networks[0]["rssi"].is_i64());
        assert!(networks[0].get("bssid").is_none());
        assert_eq!(response["result"]["content"][0]["text"], "Found 2 networks");
    }

    #[tokio::test]
    async fn system_info_answers_immediately() {
        let (_session, _runner, mut client) = start(test_config());
        client.handshake().await;

        let response = client
            .request(call_tool("info", "system_info", json!({})))
            .await;
        let structured = &response["result"]["structuredContent"];
        assert_eq!(structured["system"]["server"], env!("CARGO_PKG_NAME"));
        assert!(structured["tasks"]["runtime_workers"].is_u64());
    }

    #[tokio::test]
    async fn idle_session_times_out_and_closes() {
        let config = SessionConfig {
            session_timeout: Duration::from_millis(100),
            receive_poll: Duration::from_millis(20),
            ..test_config()
        };
        let (session, runner, mut client) = start(config);

        client.expect_closed().await;
        timeout(WAIT, runner)
            .await
            .expect("run returns")
            .expect("join")
            .expect("run ok");
        assert_eq!(session.state(), SessionState::Shutdown);
    }

    #[tokio::test]
    async fn full_message_queue_answers_with_resource_limit() {
        let config = SessionConfig {
            message_queue_depth: 1,
            queue_send_timeout: Duration::from_millis(1),
            ..test_config()
        };
        // a small pipe stalls the processor on its replies while the client is not reading
        let (_session, _runner, client) =
            start_with_capacity(config, TransportConfig::new(Framing::Newline), 256);
        let TestClient { mut lines, mut writer } = client;

        let requests = 30;
        let flood = tokio::spawn(async move {
            for n in 0..requests {
                let ping = json!({"jsonrpc": "2.0", "id": format!("q{n}"), "method": "ping"});
                let mut line = ping.to_string();
                line.push('\n');
                writer.write_all(line.as_bytes()).await.expect("client write");
            }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut rejected = None;
        for _ in 0..requests {
            let line = timeout(WAIT, lines.next_line())
                .await
                .expect("reply in time")
                .expect("client read")
                .expect("connection open");
            let response: Value = serde_json::from_str(&line).expect("json");
            if response["error"]["code"] == codes::RESOURCE_LIMIT {
                rejected = Some(response);
                break;
            }
        }

        let rejected = rejected.expect("a request rejected by the full queue");
        assert!(rejected["id"].as_str().is_some_and(|id| id.starts_with('q')));
        flood.abort();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_closes_the_stream() {
        let (session, runner, mut client) = start(test_config());
        client.handshake().await;

        session.shutdown().await;
        session.shutdown().await;
        assert_eq!(session.state(), SessionState::Shutdown);
        client.expect_closed().await;

        timeout(WAIT, runner)
            .await
            .expect("run returns")
            .expect("join")
            .expect("run ok");
        assert_eq!(session.state(), SessionState::Shutdown);
    }

    #[tokio::test]
    async fn length_prefixed_session_round_trip() {
        let (server, client) = duplex(16 * 1024);
        let (read, write) = split(server);
        let transport_config = TransportConfig::new(Framing::LengthPrefixed);
        let transport = StreamTransport::new(read, write, "duplex", transport_config);
        let registry = Arc::new(ToolRegistry::with_default_tools().expect("registry"));
        let session = Arc::new(Session::new(Arc::new(transport), test_config(), registry));
        session.initialize().expect("initialize session");
        let _runner = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.run().await }
        });

        let (mut read, mut write) = split(client);
        let body = json!({"jsonrpc": "2.0", "id": 7, "method": "ping"}).to_string();
        write
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .expect("header");
        write.write_all(body.as_bytes()).await.expect("body");

        let mut header = [0u8; 4];
        timeout(WAIT, read.read_exact(&mut header))
            .await
            .expect("response in time")
            .expect("header");
        let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
        read.read_exact(&mut payload).await.expect("payload");
        let response: Value = serde_json::from_slice(&payload).expect("json");
        assert_eq!(response, json!({"jsonrpc": "2.0", "id": 7, "result": {}}));
        assert_eq!(session.stats().messages_received, 1);
    }
}
