use super::*;

#[tokio::test]
async fn websocket_session_end_to_end() {
    let server = LiveServer::start().await;
    let mut client = server.connect().await;

    client.send_json(json!({"op": "ping"})).await;
    let first = client.next_json().await.expect("first response");
    assert_eq!(first["sandboxId"], "mock-1");
    assert_eq!(first["status"], "Running");
    assert_eq!(first["results"], json!([{"message": "pong"}]));

    // The session is visible over HTTP while the connection is open.
    let listed: Value = reqwest::get(server.url("/v1/sessions"))
        .await
        .expect("list sessions")
        .json()
        .await
        .expect("sessions json");
    assert_eq!(listed["sessions"].as_array().map(Vec::len), Some(1));
    assert_eq!(listed["sessions"][0]["sessionId"], "mock-1");
    assert_eq!(server.state.active_connections(), 1);

    client.send_json(json!({"op": "echo", "value": 1})).await;
    let second = client.next_json().await.expect("second response");
    assert_eq!(second["results"][1]["message"], r#"{"value":1}"#);

    client.send_text("definitely not json").await;
    let error = client.next_json().await.expect("error envelope");
    assert_eq!(error["sandboxId"], "mock-1");
    assert_eq!(error["error"]["status"], 400);

    client.send_json(json!({"note": "no op"})).await;
    let third = client.next_json().await.expect("third response");
    let results = third["results"].as_array().expect("results");
    assert_eq!(results.len(), 3);
    assert_eq!(results[2]["message"], "request received");

    client.close().await;

    let id = SandboxId::new("mock-1");
    wait_for_removal(&server.provider, &id).await;
    assert_eq!(server.provider.stop_calls(&id).await, 1);
    assert_eq!(server.provider.remove_calls(&id).await, 1);
    assert!(server.state.store().is_empty().await);
    assert!(server.provider.live_sandboxes().await.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn websocket_provision_failure_closes_connection() {
    let provider = Arc::new(MockProvider::new());
    provider.fail_next_create("image alpine:3 not found").await;
    let server = LiveServer::start_with(provider).await;
    let mut client = server.connect().await;

    let error = client.next_json().await.expect("error envelope");
    assert_eq!(error["error"]["status"], 503);
    assert_eq!(
        error["error"]["type"],
        "urn:sandbox-session:error:provision_failed"
    );
    assert!(error.get("sandboxId").is_none());
    assert!(client.next_json().await.is_none(), "server should close the socket");

    assert!(server.state.store().is_empty().await);
    assert_eq!(server.provider.calls().await.len(), 1);

    // A failed session does not stop the server from accepting new ones.
    let mut next = server.connect().await;
    next.send_json(json!({"op": "ping"})).await;
    let response = next.next_json().await.expect("response");
    assert_eq!(response["sandboxId"], "mock-1");
    next.close().await;
    wait_for_removal(&server.provider, &SandboxId::new("mock-1")).await;

    server.stop().await;
}

#[tokio::test]
async fn websocket_sessions_are_isolated() {
    let server = LiveServer::start().await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    a.send_json(json!({"op": "echo", "from": "a"})).await;
    let from_a = a.next_json().await.expect("a response");
    b.send_json(json!({"op": "echo", "from": "b"})).await;
    b.send_json(json!({"op": "ping"})).await;
    b.next_json().await.expect("b response");
    let from_b = b.next_json().await.expect("b response");

    assert_ne!(from_a["sandboxId"], from_b["sandboxId"]);
    assert_eq!(from_a["results"].as_array().map(Vec::len), Some(1));
    assert_eq!(from_b["results"].as_array().map(Vec::len), Some(2));
    assert_eq!(server.state.store().len().await, 2);

    let a_id = SandboxId::new(from_a["sandboxId"].as_str().expect("a id"));
    a.close().await;
    wait_for_removal(&server.provider, &a_id).await;

    // b keeps working after a is gone.
    b.send_json(json!({"op": "ping"})).await;
    let after = b.next_json().await.expect("b response");
    assert_eq!(after["results"].as_array().map(Vec::len), Some(3));
    assert_eq!(server.state.store().len().await, 1);

    let b_id = SandboxId::new(from_b["sandboxId"].as_str().expect("b id"));
    b.close().await;
    wait_for_removal(&server.provider, &b_id).await;
    assert!(server.provider.live_sandboxes().await.is_empty());
    server.stop().await;
}

#[tokio::test]
async fn shutdown_cleans_up_open_sessions() {
    let server = LiveServer::start().await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    a.send_json(json!({"op": "ping"})).await;
    b.send_json(json!({"op": "ping"})).await;
    let a_id = SandboxId::new(a.next_json().await.expect("a")["sandboxId"].as_str().expect("id"));
    let b_id = SandboxId::new(b.next_json().await.expect("b")["sandboxId"].as_str().expect("id"));

    let provider = server.provider.clone();
    let state = server.state.clone();
    server.stop().await;

    // Shutdown only returns once every session finished its cleanup.
    for id in [&a_id, &b_id] {
        assert_eq!(provider.stop_calls(id).await, 1);
        assert_eq!(provider.remove_calls(id).await, 1);
    }
    assert!(state.store().is_empty().await);
    assert_eq!(state.active_connections(), 0);
    assert!(state.is_shutting_down());

    assert!(a.next_json().await.is_none());
    assert!(b.next_json().await.is_none());
}

#[tokio::test]
async fn upgrades_are_refused_while_shutting_down() {
    let server = LiveServer::start().await;
    sandbox_session::router::begin_shutdown(&server.state);

    let err = tokio_tungstenite::connect_async(format!("ws://{}/v1/connect", server.addr))
        .await
        .expect_err("upgrade refused");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 503);
            // The client only keeps the body bytes that arrived with the head.
            if let Some(body) = response.body().as_ref().filter(|body| !body.is_empty()) {
                let problem: Value = serde_json::from_slice(body).expect("problem json");
                assert_eq!(problem["type"], "urn:sandbox-session:error:shutting_down");
            }
        }
        other => panic!("expected http error, got {other:?}"),
    }
    assert_eq!(server.provider.create_calls().await, 0);

    server.stop().await;
}
