//! Integration tests for qwenchat
//!
//! The chat completions endpoint is served by wiremock, so no API key or
//! network access is needed.

use futures::StreamExt;
use qwenchat::storage::memory::InMemoryStorage;
use qwenchat::{
    HistoryStorage, LogFilter, LogKind, LogStorage, Message, QwenClient, QwenError, Role,
    SessionKey, Settings,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

const COMPLETIONS: &str = "/chat/completions";

fn settings(server: &MockServer) -> Settings {
    let mut settings = Settings::default().with_api_key("test-key");
    settings.api.base_url = server.uri();
    settings.api.max_retries = 0;
    settings.api.retry_delay_ms = 1;
    settings
}

fn completion(content: &str) -> Value {
    json!({
        "id": "chatcmpl-1",
        "model": "qwen-plus",
        "created": 1_700_000_000,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12}
    })
}

fn sse_body(fragments: &[&str]) -> String {
    let mut body = String::new();
    for fragment in fragments {
        let chunk = json!({"choices": [{"delta": {"content": fragment}, "finish_reason": null}]});
        body.push_str(&format!("data: {}\n\n", chunk));
    }
    body.push_str(
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":3,\"total_tokens\":8}}\n\n",
    );
    body.push_str("data: [DONE]\n\n");
    body
}

async fn mount_completion(server: &MockServer, content: &str) {
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(content)))
        .mount(server)
        .await;
}

async fn request_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.body_json::<Value>().unwrap())
        .collect()
}

fn message_texts(body: &Value) -> Vec<String> {
    body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"].as_str().unwrap_or_default().to_string())
        .collect()
}

/// Matches on whether the JSON body carries `stream_options`.
struct StreamOptionsPresent(bool);

impl Match for StreamOptionsPresent {
    fn matches(&self, request: &Request) -> bool {
        serde_json::from_slice::<Value>(&request.body)
            .map(|body| body.get("stream_options").is_some() == self.0)
            .unwrap_or(false)
    }
}

#[tokio::test]
async fn test_ask_remembers_turn_and_logs_correlated_entries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .and(header("Authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("Hi Alice")))
        .mount(&server)
        .await;

    let client = QwenClient::connect(settings(&server)).await.unwrap();
    let chat = client.chat(Some("alice"), Some("s1"));

    let reply = chat.ask("Hello").await.unwrap();
    assert_eq!(reply.content(), Some("Hi Alice"));

    let history = chat.history(None).await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].content.as_text(), "Hello");
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].content.as_text(), "Hi Alice");

    let logs = client.logs(&LogFilter::for_session(&chat.key()), 10).await;
    assert_eq!(logs.len(), 2);
    let request = logs.iter().find(|e| e.kind == LogKind::Request).unwrap();
    let response = logs.iter().find(|e| e.kind == LogKind::Response).unwrap();
    assert!(request.request_id.is_some());
    assert_eq!(request.request_id, response.request_id);
    assert_eq!(response.payload["usage"]["total_tokens"], 12);

    // Remembered messages join back to the log entries
    let request_id = request.request_id.clone().unwrap();
    for message in &history {
        assert_eq!(message.metadata["request_id"], json!(request_id));
    }

    client.close().await;
}

#[tokio::test]
async fn test_history_window_sends_most_recent_messages() {
    let server = MockServer::start().await;
    mount_completion(&server, "ok").await;

    let storage = Arc::new(InMemoryStorage::new());
    let key = SessionKey::new("alice", "s1");
    for text in ["t1", "t2", "t3"] {
        storage.save(&Message::new(&key, Role::User, text)).await.unwrap();
    }

    let mut settings = settings(&server);
    settings.memory.max_history_length = 2;
    settings.memory = settings.memory.with_custom_storage(storage);
    let client = QwenClient::connect(settings).await.unwrap();

    client
        .chat(Some("alice"), Some("s1"))
        .system("Be brief")
        .ask("new")
        .await
        .unwrap();

    let bodies = request_bodies(&server).await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(message_texts(&bodies[0]), vec!["Be brief", "t2", "t3", "new"]);
    assert_eq!(bodies[0]["messages"][0]["role"], "system");
    assert_eq!(bodies[0]["model"], "qwen-plus");
    assert!(bodies[0].get("tools").is_none());
}

#[tokio::test]
async fn test_stream_accumulates_fragments_into_remembered_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&["Hel", "lo, ", "world!"]), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let client = QwenClient::connect(settings(&server)).await.unwrap();
    let chat = client.chat(Some("alice"), Some("stream"));

    let fragments: Vec<String> = chat
        .stream("Greet the world")
        .map(|fragment| fragment.unwrap())
        .collect()
        .await;
    assert_eq!(fragments, vec!["Hel", "lo, ", "world!"]);

    let history = chat.history(None).await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content.as_text(), "Hello, world!");
    assert_eq!(history[1].content.as_text(), fragments.concat());

    let bodies = request_bodies(&server).await;
    assert_eq!(bodies[0]["stream"], true);
    assert_eq!(bodies[0]["stream_options"]["include_usage"], true);

    let logs = client.logs(&LogFilter::for_session(&chat.key()), 10).await;
    let response = logs.iter().find(|e| e.kind == LogKind::Response).unwrap();
    assert_eq!(response.payload["content"], "Hello, world!");
    assert_eq!(response.payload["stream"], true);
    assert_eq!(response.payload["usage"]["total_tokens"], 8);
}

#[tokio::test]
async fn test_stream_error_frame_fails_turn() {
    let server = MockServer::start().await;
    let body = format!(
        "data: {}\n\ndata: {}\n\ndata: [DONE]\n\n",
        json!({"choices": [{"delta": {"content": "Partial "}, "finish_reason": null}]}),
        json!({"error": {
            "message": "Input data may contain inappropriate content.",
            "code": "data_inspection_failed"
        }}),
    );
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let client = QwenClient::connect(settings(&server)).await.unwrap();
    let chat = client.chat(Some("alice"), Some("inspected"));

    let items: Vec<_> = chat.stream("hi").collect().await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap(), "Partial ");
    match &items[1] {
        Err(QwenError::Api(api)) => {
            assert_eq!(api.code.as_deref(), Some("data_inspection_failed"));
        }
        other => panic!("expected an API error, got {:?}", other),
    }

    assert!(chat.history(None).await.is_empty());

    let logs = client.logs(&LogFilter::for_session(&chat.key()), 10).await;
    assert!(logs.iter().all(|e| e.kind != LogKind::Response));
    let error = logs.iter().find(|e| e.kind == LogKind::Error).unwrap();
    assert_eq!(error.payload["error_type"], "ProviderError");
    assert_eq!(error.payload["error_code"], "data_inspection_failed");
}

#[tokio::test]
async fn test_dropping_stream_early_discards_turn() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&["Hel", "lo, ", "world!"]), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let client = QwenClient::connect(settings(&server)).await.unwrap();
    let chat = client.chat(Some("alice"), Some("abandoned"));

    {
        let mut fragments = chat.stream("Greet the world");
        assert_eq!(fragments.next().await.unwrap().unwrap(), "Hel");
    }

    assert!(chat.history(None).await.is_empty());

    let logs = client.logs(&LogFilter::for_session(&chat.key()), 10).await;
    assert!(logs.iter().all(|e| e.kind == LogKind::Request));
    assert_eq!(logs.len(), 1);
}

#[tokio::test]
async fn test_stream_retries_once_without_stream_options() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .and(StreamOptionsPresent(true))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"message": "Unrecognized request argument: stream_options", "code": "invalid_parameter"}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .and(StreamOptionsPresent(false))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body(&["fine"]), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = QwenClient::connect(settings(&server)).await.unwrap();
    let chat = client.chat(Some("alice"), Some("fallback"));

    let fragments: Vec<String> = chat
        .stream("hi")
        .map(|fragment| fragment.unwrap())
        .collect()
        .await;
    assert_eq!(fragments, vec!["fine"]);
    assert_eq!(chat.history(None).await.len(), 2);

    // The capability probe is not an error
    let logs = client.logs(&LogFilter::for_session(&chat.key()), 10).await;
    assert!(logs.iter().all(|e| e.kind != LogKind::Error));
}

#[tokio::test]
async fn test_api_failure_logs_error_and_remembers_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": {"message": "internal failure", "code": "InternalError"}
        })))
        .mount(&server)
        .await;

    let client = QwenClient::connect(settings(&server)).await.unwrap();
    let chat = client.chat(Some("alice"), Some("broken"));

    let err = chat.ask("Hello").await.unwrap_err();
    match err {
        QwenError::Api(api) => {
            assert_eq!(api.status(), Some(500));
            assert_eq!(api.code.as_deref(), Some("InternalError"));
            assert_eq!(api.message, "internal failure");
        }
        other => panic!("expected an API error, got {:?}", other),
    }

    assert!(chat.history(None).await.is_empty());

    let logs = client.logs(&LogFilter::for_session(&chat.key()), 10).await;
    assert!(logs.iter().all(|e| e.kind != LogKind::Response));
    let error = logs.iter().find(|e| e.kind == LogKind::Error).unwrap();
    assert_eq!(error.payload["error_type"], "StatusError");
    assert_eq!(error.payload["error_code"], "InternalError");
    assert_eq!(error.payload["request_params"]["messages"][0]["content"], "Hello");
}

#[tokio::test]
async fn test_transient_status_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_completion(&server, "recovered").await;

    let mut settings = settings(&server);
    settings.api.max_retries = 2;
    let client = QwenClient::connect(settings).await.unwrap();

    let reply = client.chat(None, None).ask("hi").await.unwrap();
    assert_eq!(reply.content(), Some("recovered"));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_disabled_memory_sends_no_history() {
    let server = MockServer::start().await;
    mount_completion(&server, "ok").await;

    let mut settings = settings(&server);
    settings.memory.enabled = false;
    let client = QwenClient::connect(settings).await.unwrap();
    let chat = client.chat(Some("alice"), Some("s1"));

    chat.ask("first").await.unwrap();
    chat.ask("second").await.unwrap();

    let bodies = request_bodies(&server).await;
    assert_eq!(message_texts(&bodies[1]), vec!["second"]);
    assert!(chat.history(None).await.is_empty());
    assert!(chat.clear_memory().await);
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let server = MockServer::start().await;
    mount_completion(&server, "ok").await;

    let client = QwenClient::connect(settings(&server)).await.unwrap();
    let first = client.chat(Some("alice"), Some("s1"));
    let second = client.chat(Some("alice"), Some("s2"));
    let other_user = client.chat(Some("bob"), Some("s1"));

    first.ask("for s1").await.unwrap();
    second.ask("for s2").await.unwrap();

    let bodies = request_bodies(&server).await;
    assert_eq!(message_texts(&bodies[1]), vec!["for s2"]);
    assert!(other_user.history(None).await.is_empty());

    assert!(first.clear_memory().await);
    assert!(first.history(None).await.is_empty());
    assert_eq!(second.history(None).await.len(), 2);
}

#[tokio::test]
async fn test_custom_log_storage_receives_entries() {
    let server = MockServer::start().await;
    mount_completion(&server, "ok").await;

    let logs = Arc::new(InMemoryStorage::new());
    let mut settings = settings(&server);
    settings.log.storage_type = "sqlite".to_string();
    settings.log = settings.log.with_custom_storage(logs.clone());
    let client = QwenClient::connect(settings).await.unwrap();

    client.chat(Some("alice"), Some("s1")).ask("hi").await.unwrap();

    let entries = LogStorage::logs(logs.as_ref(), &LogFilter::default(), 10)
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    // Newest first
    assert_eq!(entries[0].kind, LogKind::Response);
}

#[tokio::test]
async fn test_search_attaches_web_search_tool() {
    let server = MockServer::start().await;
    mount_completion(&server, "ok").await;

    let client = QwenClient::connect(settings(&server)).await.unwrap();
    client
        .chat(None, None)
        .search(true)
        .temperature(1.7)
        .param("top_p", 0.8)
        .ask("news?")
        .await
        .unwrap();

    let bodies = request_bodies(&server).await;
    assert_eq!(
        bodies[0]["tools"],
        json!([{"type": "web_search", "web_search": {"enable": true}}])
    );
    assert_eq!(bodies[0]["temperature"], 1.0);
    assert_eq!(bodies[0]["top_p"], 0.8);
}

#[tokio::test]
async fn test_image_is_sent_as_data_url() {
    let server = MockServer::start().await;
    mount_completion(&server, "a cat").await;

    let dir = TempDir::new().unwrap();
    let image = dir.path().join("cat.png");
    std::fs::write(&image, b"not really a png").unwrap();

    let client = QwenClient::connect(settings(&server)).await.unwrap();
    let chat = client.chat(Some("alice"), Some("vision")).model("qwen-vl-plus");
    chat.image("What is this?", &image).await.unwrap();

    let bodies = request_bodies(&server).await;
    let content = &bodies[0]["messages"][0]["content"];
    assert_eq!(content[0], json!({"type": "text", "text": "What is this?"}));
    assert_eq!(content[1]["type"], "image_url");
    assert!(content[1]["image_url"]["url"]
        .as_str()
        .unwrap()
        .starts_with("data:image/png;base64,"));

    let history = chat.history(None).await;
    assert_eq!(history[0].content.as_text(), "What is this?");
}

#[tokio::test]
async fn test_missing_image_fails_before_any_request() {
    let server = MockServer::start().await;
    mount_completion(&server, "unused").await;

    let client = QwenClient::connect(settings(&server)).await.unwrap();
    let err = client
        .chat(None, None)
        .image("What is this?", "/no/such/image.jpg")
        .await
        .unwrap_err();

    assert!(matches!(err, QwenError::InvalidInput(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_choices_are_not_remembered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "x", "choices": []})))
        .mount(&server)
        .await;

    let client = QwenClient::connect(settings(&server)).await.unwrap();
    let chat = client.chat(Some("alice"), Some("empty"));

    let reply = chat.ask("anything?").await.unwrap();
    assert!(reply.content().is_none());
    assert!(chat.history(None).await.is_empty());
}

#[tokio::test]
async fn test_file_memory_survives_client_restart() {
    let server = MockServer::start().await;
    mount_completion(&server, "noted").await;

    let dir = TempDir::new().unwrap();
    let mut settings = settings(&server);
    settings.memory.storage_type = "file".to_string();
    settings.memory.file_storage_path = dir.path().join("memory").display().to_string();

    QwenClient::scoped(settings.clone(), |client| async move {
        client.chat(Some("alice"), Some("s1")).ask("remember me").await?;
        Ok(())
    })
    .await
    .unwrap();

    let client = QwenClient::connect(settings).await.unwrap();
    let history = client.chat(Some("alice"), Some("s1")).history(None).await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content.as_text(), "noted");
}
