//! Integration tests for the language-model providers
//!
//! Each provider talks to a wiremock server standing in for the real API.

use rhythm_engine::config::OpenAIConfig;
use rhythm_engine::llm::{OllamaProvider, OpenAIProvider};
use sdk::errors::ModelError;
use sdk::model::{GenerationParams, LanguageModel};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn openai_at(server: &MockServer, api_key: Option<&str>) -> OpenAIProvider {
    let config = OpenAIConfig {
        base_url: server.uri(),
        ..OpenAIConfig::default()
    };
    OpenAIProvider::new(config, api_key.map(str::to_string))
}

#[tokio::test]
async fn test_ollama_returns_message_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({"model": "llama3.1:8b", "stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "llama3.1:8b",
            "message": {"role": "assistant", "content": "{\"valid\": true}"},
            "done": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OllamaProvider::new(server.uri(), "llama3.1:8b");
    let reply = provider
        .generate("Is this task valid?", &GenerationParams::default())
        .await
        .unwrap();
    assert_eq!(reply, "{\"valid\": true}");
}

#[tokio::test]
async fn test_ollama_server_error_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
        .mount(&server)
        .await;

    let provider = OllamaProvider::new(server.uri(), "llama3.1:8b");
    let err = provider
        .generate("hello", &GenerationParams::default())
        .await
        .unwrap_err();
    match err {
        ModelError::ProviderUnavailable(msg) => assert!(msg.contains("model not loaded")),
        other => panic!("Expected ProviderUnavailable, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_ollama_malformed_body_is_parse_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"done": true})))
        .mount(&server)
        .await;

    let provider = OllamaProvider::new(server.uri(), "llama3.1:8b");
    let err = provider
        .generate("hello", &GenerationParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::ParseError(_)));
}

#[tokio::test]
async fn test_ollama_health_check() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models": []})))
        .mount(&server)
        .await;

    assert!(OllamaProvider::new(server.uri(), "llama3.1:8b").check_health().await);

    // nothing listens on port 9 locally
    assert!(!OllamaProvider::new("http://127.0.0.1:9", "llama3.1:8b").check_health().await);
}

#[tokio::test]
async fn test_openai_sends_bearer_and_reads_choice() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Take a short walk."},
                "finish_reason": "stop"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = openai_at(&server, Some("sk-test"));
    let reply = provider
        .generate(
            "Motivate me",
            &GenerationParams::default().with_system("Be kind"),
        )
        .await
        .unwrap();
    assert_eq!(reply, "Take a short walk.");
}

#[tokio::test]
async fn test_openai_status_mapping() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer revoked"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer busy"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let err = openai_at(&server, Some("revoked"))
        .generate("hi", &GenerationParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::AuthenticationFailed(_)));

    let err = openai_at(&server, Some("busy"))
        .generate("hi", &GenerationParams::default())
        .await
        .unwrap_err();
    assert_eq!(err, ModelError::RateLimitExceeded);
}

#[tokio::test]
async fn test_openai_without_key_makes_no_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let provider = openai_at(&server, None);
    assert!(!provider.check_health().await);
    let err = provider
        .generate("hi", &GenerationParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::AuthenticationFailed(_)));
}
