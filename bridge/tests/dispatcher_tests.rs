use std::net::SocketAddr;
use std::sync::Arc;

use bridge::descriptor::{MethodSignature, Param};
use bridge::dispatcher::{bind_local, serve};
use bridge::errors::MethodError;
use bridge::protocol::JsonMap;
use bridge::registry::{MethodCall, MethodRegistry};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    async fn start(registry: MethodRegistry) -> Self {
        let listener = bind_local(0).await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(serve(listener, Arc::new(registry), shutdown.clone()));
        Self {
            addr,
            shutdown,
            handle,
        }
    }

    fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.expect("join").expect("serve");
    }
}

fn registry() -> MethodRegistry {
    let mut registry = MethodRegistry::new();
    registry.register_fn(
        "working_dir",
        MethodSignature::new("Report a fixed directory."),
        |_call: MethodCall| async move {
            let mut result = JsonMap::new();
            result.insert("dir".to_string(), json!("/srv/jobs"));
            Ok::<_, MethodError>(result)
        },
    );
    registry.register_fn(
        "greet",
        MethodSignature::new("Greet someone.")
            .param(Param::required("name").with_type("str"))
            .param(Param::optional("punctuation", "!")),
        |call: MethodCall| async move {
            let mut result = JsonMap::new();
            result.insert(
                "greeting".to_string(),
                json!(format!("hello {}{}", call.str("name")?, call.str("punctuation")?)),
            );
            Ok::<_, MethodError>(result)
        },
    );
    registry.register_fn(
        "explode",
        MethodSignature::new("Always raises."),
        |_call: MethodCall| async move { Err::<JsonMap, _>(MethodError::value("bad input")) },
    );
    registry
}

async fn post(server: &TestServer, body: Value) -> (StatusCode, Value) {
    let response = reqwest::Client::new()
        .post(server.url())
        .json(&body)
        .send()
        .await
        .expect("request");
    let status = response.status();
    let body = response.json::<Value>().await.expect("json body");
    (status, body)
}

#[tokio::test]
async fn get_serves_registry_with_batch() {
    let server = TestServer::start(registry()).await;
    let response = reqwest::get(server.url()).await.expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/json"
    );
    let body: Value = response.json().await.unwrap();
    let names: Vec<&String> = body.as_object().unwrap().keys().collect();
    assert!(names.iter().any(|name| name.as_str() == "batch"));
    assert_eq!(body["greet"]["args"], json!([["name", "str"]]));
    assert_eq!(
        body["greet"]["kwargs"]["punctuation"],
        json!({"type": "unspecified", "default": "\"!\""})
    );
    server.stop().await;
}

#[tokio::test]
async fn successful_call_returns_result_verbatim() {
    let server = TestServer::start(registry()).await;
    let (status, body) = post(&server, json!({"cmd": "greet", "args": ["ada"]})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"greeting": "hello ada!"}));
    server.stop().await;
}

#[tokio::test]
async fn non_json_content_type_is_rejected_without_body() {
    let server = TestServer::start(registry()).await;
    let response = reqwest::Client::new()
        .post(server.url())
        .header("content-type", "text/plain")
        .body(r#"{"cmd": "working_dir"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.bytes().await.unwrap().is_empty());
    server.stop().await;
}

#[tokio::test]
async fn missing_command_is_reported_with_ok_status() {
    let server = TestServer::start(registry()).await;
    let (status, body) = post(&server, json!({"args": []})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"error": "You must provide a command name with the key \"cmd\"!"})
    );
    server.stop().await;
}

#[tokio::test]
async fn non_object_bodies_are_type_errors() {
    let server = TestServer::start(registry()).await;
    for payload in [json!(["working_dir"]), json!("working_dir"), json!(3)] {
        let (status, body) = post(&server, payload).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("must be a JSON object"));
        assert!(body["traceback"].as_str().unwrap().contains("TypeError"));
    }
    server.stop().await;
}

#[tokio::test]
async fn unknown_command_is_reported_with_ok_status() {
    let server = TestServer::start(registry()).await;
    let (status, body) = post(&server, json!({"cmd": "frobnicate"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"error": "No registered server method with the name frobnicate"})
    );
    server.stop().await;
}

#[tokio::test]
async fn raising_method_answers_bad_request_with_traceback() {
    let server = TestServer::start(registry()).await;
    let (status, body) = post(&server, json!({"cmd": "explode"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("bad input"));
    assert!(body["traceback"].as_str().unwrap().contains("ValueError"));
    server.stop().await;
}

#[tokio::test]
async fn binding_errors_are_type_errors() {
    let server = TestServer::start(registry()).await;
    let (status, body) = post(&server, json!({"cmd": "greet", "kwargs": {"nom": "x"}})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["traceback"].as_str().unwrap().contains("TypeError"));

    let (status, body) = post(&server, json!({"cmd": "greet", "args": "ada"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.get("traceback").is_some());
    server.stop().await;
}

#[tokio::test]
async fn batch_returns_partial_results_up_to_unknown_name() {
    let server = TestServer::start(registry()).await;
    let (status, body) = post(
        &server,
        json!({
            "cmd": "batch",
            "args": [[
                ["working_dir", [], {}],
                ["frobnicate", [], {}],
                ["working_dir", [], {}]
            ]]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["0: working_dir"], json!({"dir": "/srv/jobs"}));
    assert_eq!(body["1: frobnicate"], json!({}));
    assert_eq!(body["error"], json!("Unrecognised function name: frobnicate"));
    assert!(body.get("2: working_dir").is_none());
    assert_eq!(body.as_object().unwrap().len(), 3);
    server.stop().await;
}
