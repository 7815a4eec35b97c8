use sandbox_session::provider::SandboxProvider;
use sandbox_session::router::ApiDoc;
use sandbox_session::store::SessionRecord;
use utoipa::OpenApi;

use super::*;

#[tokio::test]
async fn v1_health_and_unknown_routes() {
    let test_app = TestApp::new();

    let (status, _, body) = send_request(&test_app.app, Method::GET, "/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    let health = parse_json(&body);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["activeSessions"], 0);

    let (status, _, body) = send_request(&test_app.app, Method::GET, "/v1/anything").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let problem = parse_json(&body);
    assert_eq!(problem["type"], "urn:sandbox-session:error:not_found");
    assert_eq!(problem["status"], 404);
}

#[tokio::test]
async fn root_without_upgrade_describes_the_server() {
    let test_app = TestApp::new();

    let (status, _, body) = send_request(&test_app.app, Method::GET, "/").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).expect("utf8");
    assert!(text.contains("/v1/connect"), "{text}");
}

#[tokio::test]
async fn connect_requires_a_websocket_upgrade() {
    let test_app = TestApp::new();

    let (status, _, _) = send_request(&test_app.app, Method::GET, "/v1/connect").await;
    assert!(status.is_client_error(), "unexpected status {status}");
    assert_eq!(test_app.provider.create_calls().await, 0);
}

#[tokio::test]
async fn v1_sessions_list_and_get() {
    let test_app = TestApp::new();

    let (status, _, body) = send_request(&test_app.app, Method::GET, "/v1/sessions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body), json!({"sessions": []}));

    let handle = test_app
        .provider
        .create(&ImageRef::new("alpine:3"))
        .await
        .expect("create sandbox");
    test_app
        .state
        .store()
        .insert(SessionRecord::for_sandbox(&handle))
        .await
        .expect("register");

    let (status, _, body) = send_request(&test_app.app, Method::GET, "/v1/sessions").await;
    assert_eq!(status, StatusCode::OK);
    let sessions = parse_json(&body)["sessions"].clone();
    assert_eq!(sessions.as_array().map(Vec::len), Some(1));
    assert_eq!(sessions[0]["sessionId"], "mock-1");
    assert_eq!(sessions[0]["status"], "Running");
    assert_eq!(sessions[0]["image"], "alpine:3");

    let (status, _, body) = send_request(&test_app.app, Method::GET, "/v1/sessions/mock-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)["results"], json!([]));

    let (status, _, body) = send_request(&test_app.app, Method::GET, "/v1/sessions/mock-404").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let problem = parse_json(&body);
    assert_eq!(problem["type"], "urn:sandbox-session:error:session_not_found");
    assert_eq!(problem["sessionId"], "mock-404");
}

#[tokio::test]
async fn v1_session_logs_tail() {
    let test_app = TestApp::new();
    let handle = test_app
        .provider
        .create(&ImageRef::new("alpine:3"))
        .await
        .expect("create sandbox");
    test_app
        .provider
        .push_log(handle.id(), "installing tools\nready\n")
        .await;
    test_app
        .state
        .store()
        .insert(SessionRecord::for_sandbox(&handle))
        .await
        .expect("register");

    let (status, _, body) =
        send_request(&test_app.app, Method::GET, "/v1/sessions/mock-1/logs").await;
    assert_eq!(status, StatusCode::OK);
    let logs = parse_json(&body);
    assert_eq!(logs["sessionId"], "mock-1");
    assert_eq!(logs["lines"], 3);
    assert!(logs["content"]
        .as_str()
        .unwrap_or_default()
        .starts_with("mock sandbox mock-1 started"));

    let (status, _, body) =
        send_request(&test_app.app, Method::GET, "/v1/sessions/mock-1/logs?tail=1").await;
    assert_eq!(status, StatusCode::OK);
    let logs = parse_json(&body);
    assert_eq!(logs["content"], "ready\n");
    assert_eq!(logs["lines"], 1);
}

#[tokio::test]
async fn v1_session_logs_only_for_live_sessions() {
    let test_app = TestApp::new();
    // The sandbox exists but no session owns it.
    test_app
        .provider
        .create(&ImageRef::new("alpine:3"))
        .await
        .expect("create sandbox");

    let (status, _, body) =
        send_request(&test_app.app, Method::GET, "/v1/sessions/mock-1/logs").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        parse_json(&body)["type"],
        "urn:sandbox-session:error:session_not_found"
    );
}

#[test]
fn openapi_document_lists_routes() {
    let doc = serde_json::to_value(ApiDoc::openapi()).expect("serialize openapi");
    let paths = doc["paths"].as_object().expect("paths");
    for path in [
        "/v1/connect",
        "/v1/health",
        "/v1/sessions",
        "/v1/sessions/{session_id}",
        "/v1/sessions/{session_id}/logs",
    ] {
        assert!(paths.contains_key(path), "missing {path}");
    }
    let schemas = doc["components"]["schemas"].as_object().expect("schemas");
    assert!(schemas.contains_key("SessionRecord"));
    assert!(schemas.contains_key("ProblemDetails"));
}
