//! Ollama client against a mock HTTP server

use futures::StreamExt;
use inference_core::backend::{BackendError, BackendRequest, InferenceBackend, OllamaBackend};
use inference_core::config::BackendConfig;
use inference_core::Message;
use mockito::Matcher;
use serde_json::json;

fn backend(url: String) -> OllamaBackend {
    OllamaBackend::new(BackendConfig {
        base_url: url,
        circuit_breaker_failures: 2,
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_warm_sends_keep_alive() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api/generate")
        .match_body(Matcher::PartialJson(json!({
            "model": "llama3.2",
            "stream": false,
            "keep_alive": "5m"
        })))
        .with_status(200)
        .with_body(r#"{"model":"llama3.2","response":"hi","done":true}"#)
        .create_async()
        .await;

    backend(server.url()).warm("llama3.2").await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn test_generate_chat() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api/chat")
        .match_body(Matcher::PartialJson(json!({
            "model": "llama3.2",
            "stream": false,
            "options": {"num_predict": 64}
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "model": "llama3.2",
                "message": {"role": "assistant", "content": "Paris."},
                "done": true,
                "done_reason": "stop",
                "prompt_eval_count": 12,
                "eval_count": 3,
                "eval_duration": 1_500_000_000u64
            })
            .to_string(),
        )
        .create_async()
        .await;

    let mut request = BackendRequest::chat("llama3.2", vec![Message::user("Capital of France?")]);
    request.options.insert("num_predict".to_string(), json!(64));

    let response = backend(server.url()).generate(request).await.unwrap();
    mock.assert_async().await;
    assert_eq!(response.content(), "Paris.");
    assert_eq!(response.prompt_tokens(), 12);
    assert_eq!(response.completion_tokens(), 3);
    assert_eq!(response.tokens_per_second(), Some(2.0));
}

#[tokio::test]
async fn test_upstream_errors_open_the_breaker() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api/chat")
        .with_status(500)
        .with_body("model crashed")
        .expect(2)
        .create_async()
        .await;

    let backend = backend(server.url());
    for _ in 0..2 {
        let err = backend
            .generate(BackendRequest::chat("llama3.2", vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Upstream(ref m) if m.contains("model crashed")));
    }

    let err = backend
        .generate(BackendRequest::chat("llama3.2", vec![Message::user("hi")]))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::CircuitOpen(_)));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_stream_yields_ndjson_in_order() {
    let mut server = mockito::Server::new_async().await;
    let body = [
        r#"{"model":"llama3.2","message":{"role":"assistant","content":"Hel"},"done":false}"#,
        "",
        r#"{"model":"llama3.2","message":{"role":"assistant","content":"lo"},"done":false}"#,
        r#"{"model":"llama3.2","message":{"role":"assistant","content":""},"done":true,"eval_count":2}"#,
    ]
    .join("\n");
    server
        .mock("POST", "/api/chat")
        .match_body(Matcher::PartialJson(json!({"stream": true})))
        .with_status(200)
        .with_body(body + "\n")
        .create_async()
        .await;

    let stream = backend(server.url())
        .generate_stream(BackendRequest::chat("llama3.2", vec![Message::user("hi")]))
        .await
        .unwrap();
    let items: Vec<_> = stream.collect().await;

    assert_eq!(items.len(), 3);
    let text: String = items
        .iter()
        .map(|i| i.as_ref().unwrap().content().to_string())
        .collect();
    assert_eq!(text, "Hello");
    let last = items.last().unwrap().as_ref().unwrap();
    assert!(last.done);
    assert_eq!(last.completion_tokens(), 2);
}

#[tokio::test]
async fn test_stream_error_line_ends_stream() {
    let mut server = mockito::Server::new_async().await;
    let body = concat!(
        r#"{"model":"llama3.2","message":{"role":"assistant","content":"par"},"done":false}"#,
        "\n",
        r#"{"error":"out of memory"}"#,
        "\n",
        r#"{"model":"llama3.2","message":{"role":"assistant","content":"never"},"done":true}"#,
        "\n"
    );
    server
        .mock("POST", "/api/chat")
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;

    let stream = backend(server.url())
        .generate_stream(BackendRequest::chat("llama3.2", vec![Message::user("hi")]))
        .await
        .unwrap();
    let items: Vec<_> = stream.collect().await;

    assert_eq!(items.len(), 2);
    assert!(items[0].is_ok());
    assert!(matches!(items[1], Err(BackendError::Upstream(ref m)) if m == "out of memory"));
}

#[tokio::test]
async fn test_embed() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/embeddings")
        .match_body(Matcher::PartialJson(json!({
            "model": "nomic-embed-text",
            "prompt": "hello"
        })))
        .with_status(200)
        .with_body(r#"{"embedding":[0.1,0.2,0.3]}"#)
        .create_async()
        .await;

    let vector = backend(server.url())
        .embed("nomic-embed-text", "hello")
        .await
        .unwrap();
    assert_eq!(vector, vec![0.1, 0.2, 0.3]);
}

#[tokio::test]
async fn test_list_models_reads_tags() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/api/tags")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "models": [
                    {"name": "llama3.2:latest", "size": 2019393189u64},
                    {"name": "qwen2.5-coder:7b", "size": 4683087332u64}
                ]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let models = backend(server.url()).list_models().await.unwrap();
    mock.assert_async().await;
    assert_eq!(models, vec!["llama3.2:latest", "qwen2.5-coder:7b"]);
}

#[tokio::test]
async fn test_list_models_unreachable_backend() {
    let err = backend("http://127.0.0.1:1".to_string())
        .list_models()
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::RequestFailed(_) | BackendError::Timeout(_)));
}
