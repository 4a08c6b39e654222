mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use editor_bridge::{
    BridgeClient, BridgeConfig, BridgeError, ConnectionState, MAX_RECONNECT_REASON,
    RequestOptions, Request,
};
use serde_json::{Value, json};
use tokio::task::JoinHandle;

use support::mock_editor::{MockEditorServer, STEP_TIMEOUT};

fn resilient_test_config(server: &MockEditorServer) -> BridgeConfig {
    let mut config = BridgeConfig::new();
    config.host = "127.0.0.1".into();
    config.port = server.port();
    config.request_timeout_ms = 2000;
    config.connect_timeout_ms = 500;
    config.heartbeat.enabled = false;
    config.reconnect.enabled = true;
    config.reconnect.base_delay_ms = 20;
    config.reconnect.max_delay_ms = 40;
    config.reconnect.max_attempts = 200;
    config
}

fn request_id(request: &Value) -> String {
    request
        .get("id")
        .and_then(Value::as_str)
        .expect("request missing string id")
        .to_string()
}

async fn start_server_or_skip(test_name: &str) -> Option<MockEditorServer> {
    support::init_tracing();
    match MockEditorServer::start().await {
        Ok(server) => Some(server),
        Err(err) => {
            eprintln!("Skipping {test_name}: unable to start mock editor: {err}");
            None
        }
    }
}

async fn wait_for_state(client: &BridgeClient, state: ConnectionState) {
    tokio::time::timeout(STEP_TIMEOUT, async {
        while client.connection_state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("client never reached {state}"));
}

async fn wait_for_queue_size(client: &BridgeClient, size: usize) {
    tokio::time::timeout(STEP_TIMEOUT, async {
        while client.queue_stats().size != size {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("queue never reached {size} items"));
}

/// Issue `method` in the background and wait until it sits in the queue.
async fn queue_call(
    client: &Arc<BridgeClient>,
    method: &str,
) -> JoinHandle<editor_bridge::BridgeResult<Value>> {
    let depth = client.queue_stats().size;
    let handle = {
        let client = Arc::clone(client);
        let method = method.to_string();
        tokio::spawn(async move { client.call(&method, json!({})).await })
    };
    wait_for_queue_size(client, depth + 1).await;
    handle
}

/// Start a client, then drop the socket with the editor refusing reconnects.
async fn client_in_outage(server: &mut MockEditorServer, config: BridgeConfig) -> Arc<BridgeClient> {
    let client = Arc::new(BridgeClient::new(config));
    client.start("integration-test").await.unwrap();
    let connection = server.accept_connection().await;

    server.set_accepting(false);
    connection.force_close();
    wait_for_state(&client, ConnectionState::Reconnecting).await;
    client
}

#[tokio::test]
async fn queued_requests_replay_in_order_one_at_a_time() {
    let Some(mut server) =
        start_server_or_skip("queued_requests_replay_in_order_one_at_a_time").await
    else {
        return;
    };
    let config = resilient_test_config(&server);
    let client = client_in_outage(&mut server, config).await;

    let b = queue_call(&client, "step_b").await;
    let c = queue_call(&client, "step_c").await;
    assert_eq!(client.queue_stats().enqueued, 2);

    server.set_accepting(true);
    let mut connection = server.accept_connection().await;
    assert_eq!(connection.index(), 1);

    let first = connection.recv_request_method("step_b").await;
    // C waits until B settles.
    assert!(
        connection
            .try_recv_request(Duration::from_millis(200))
            .await
            .is_none()
    );
    connection.send_result(&request_id(&first), json!("b"));

    let second = connection.recv_request_method("step_c").await;
    connection.send_result(&request_id(&second), json!("c"));

    assert_eq!(b.await.unwrap().unwrap(), json!("b"));
    assert_eq!(c.await.unwrap().unwrap(), json!("c"));

    let stats = client.queue_stats();
    assert_eq!(stats.replayed, 2);
    assert_eq!(stats.size, 0);
    assert_eq!(stats.rejected, 0);
    client.stop();
}

#[tokio::test]
async fn replayed_failure_is_not_requeued() {
    let Some(mut server) = start_server_or_skip("replayed_failure_is_not_requeued").await else {
        return;
    };
    let config = resilient_test_config(&server);
    let client = client_in_outage(&mut server, config).await;
    let queued = queue_call(&client, "compile_scripts").await;

    server.set_accepting(true);
    let mut connection = server.accept_connection().await;
    let request = connection.recv_request_method("compile_scripts").await;
    connection.send_error(&request_id(&request), "TOOL_EXECUTION", "compile failed");

    let err = queued.await.unwrap().unwrap_err();
    assert!(matches!(err, BridgeError::ToolExecution { .. }));
    assert_eq!(client.queue_stats().size, 0);
    assert!(
        connection
            .try_recv_request(Duration::from_millis(150))
            .await
            .is_none()
    );
    client.stop();
}

#[tokio::test]
async fn retry_exhaustion_clears_the_queue() {
    let Some(mut server) = start_server_or_skip("retry_exhaustion_clears_the_queue").await else {
        return;
    };
    let mut config = resilient_test_config(&server);
    config.reconnect.max_attempts = 8;
    config.reconnect.base_delay_ms = 50;
    config.reconnect.max_delay_ms = 50;
    let client = client_in_outage(&mut server, config).await;

    let reasons = Arc::new(Mutex::new(Vec::new()));
    let _subscription = {
        let reasons = Arc::clone(&reasons);
        client.on_connection_state_change(move |change| {
            if change.current == ConnectionState::Disconnected {
                reasons.lock().unwrap().push(change.reason.clone());
            }
        })
    };

    let queued = queue_call(&client, "manage_gameobject").await;
    wait_for_state(&client, ConnectionState::Disconnected).await;

    match queued.await.unwrap() {
        Err(BridgeError::ConnectionLost { reason }) => assert_eq!(reason, MAX_RECONNECT_REASON),
        other => panic!("unexpected outcome: {other:?}"),
    }
    let stats = client.queue_stats();
    assert_eq!(stats.size, 0);
    assert_eq!(stats.rejected, 1);
    assert_eq!(
        *reasons.lock().unwrap(),
        vec![Some(MAX_RECONNECT_REASON.to_string())]
    );
}

#[tokio::test]
async fn full_queue_drops_the_third_request() {
    let Some(mut server) = start_server_or_skip("full_queue_drops_the_third_request").await else {
        return;
    };
    let mut config = resilient_test_config(&server);
    config.queue.capacity = 2;
    let client = client_in_outage(&mut server, config).await;

    let first = queue_call(&client, "first").await;
    let second = queue_call(&client, "second").await;

    let err = client.call("third", json!({})).await.unwrap_err();
    assert!(matches!(err, BridgeError::QueueFull { capacity: 2 }));

    let stats = client.queue_stats();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.enqueued, 2);
    assert_eq!(stats.size, 2);

    client.stop();
    for handle in [first, second] {
        assert!(matches!(
            handle.await.unwrap(),
            Err(BridgeError::ConnectionLost { .. })
        ));
    }
}

#[tokio::test]
async fn drop_during_replay_rejects_the_unsent_tail() {
    let Some(mut server) = start_server_or_skip("drop_during_replay_rejects_the_unsent_tail").await
    else {
        return;
    };
    let config = resilient_test_config(&server);
    let client = client_in_outage(&mut server, config).await;

    let b = queue_call(&client, "step_b").await;
    let c = queue_call(&client, "step_c").await;
    let d = queue_call(&client, "step_d").await;

    server.set_accepting(true);
    let mut connection = server.accept_connection().await;
    connection.recv_request_method("step_b").await;

    server.set_accepting(false);
    connection.force_close();

    assert!(matches!(
        b.await.unwrap(),
        Err(BridgeError::ConnectionLost { .. })
    ));
    for handle in [c, d] {
        match handle.await.unwrap() {
            Err(BridgeError::ConnectionLost { reason }) => {
                assert_eq!(reason, "connection lost during replay");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    let stats = client.queue_stats();
    assert_eq!(stats.replayed, 1);
    assert_eq!(stats.rejected, 2);
    assert_eq!(stats.size, 0);
    client.stop();
}

#[tokio::test]
async fn no_queue_request_fails_fast_during_outage() {
    let Some(mut server) = start_server_or_skip("no_queue_request_fails_fast_during_outage").await
    else {
        return;
    };
    let config = resilient_test_config(&server);
    let client = client_in_outage(&mut server, config).await;

    let err = tokio::time::timeout(
        Duration::from_millis(200),
        client.send_request(
            Request::new("manage_editor", json!({"action": "play"})),
            RequestOptions::default().without_queue(),
        ),
    )
    .await
    .expect("fail-fast request waited")
    .unwrap_err();
    assert!(matches!(err, BridgeError::NotConnected));
    assert_eq!(client.queue_stats().enqueued, 0);
    client.stop();
}

#[tokio::test]
async fn wait_for_reconnect_resolves_after_cycle() {
    let Some(mut server) = start_server_or_skip("wait_for_reconnect_resolves_after_cycle").await
    else {
        return;
    };
    let client = BridgeClient::new(resilient_test_config(&server));
    client.start("integration-test").await.unwrap();
    let connection = server.accept_connection().await;

    let (waited, replacement) = tokio::join!(
        client.wait_for_reconnect(Duration::from_secs(3)),
        async {
            connection.force_close();
            server.accept_connection().await
        }
    );
    waited.unwrap();
    assert_eq!(replacement.index(), 1);
    assert!(client.is_connected());
    client.stop();
}

#[tokio::test]
async fn wait_for_reconnect_counts_an_outage_already_in_progress() {
    let Some(mut server) =
        start_server_or_skip("wait_for_reconnect_counts_an_outage_already_in_progress").await
    else {
        return;
    };
    let config = resilient_test_config(&server);
    let client = client_in_outage(&mut server, config).await;

    let (waited, _replacement) = tokio::join!(
        client.wait_for_reconnect(Duration::from_secs(3)),
        async {
            server.set_accepting(true);
            server.accept_connection().await
        }
    );
    waited.unwrap();
    client.stop();
}

#[tokio::test]
async fn wait_for_reconnect_times_out_on_a_stable_link() {
    let Some(mut server) =
        start_server_or_skip("wait_for_reconnect_times_out_on_a_stable_link").await
    else {
        return;
    };
    let client = BridgeClient::new(resilient_test_config(&server));
    client.start("integration-test").await.unwrap();
    let _connection = server.accept_connection().await;

    let err = client
        .wait_for_reconnect(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::ReconnectTimeout { millis: 100 }));
    assert!(client.is_connected());
}

#[tokio::test]
async fn missed_heartbeat_triggers_reconnect() {
    let Some(mut server) = start_server_or_skip("missed_heartbeat_triggers_reconnect").await else {
        return;
    };
    let mut config = resilient_test_config(&server);
    config.heartbeat.enabled = true;
    config.heartbeat.interval_ms = 50;
    config.heartbeat.timeout_ms = 100;

    let client = BridgeClient::new(config);
    let losses = Arc::new(Mutex::new(Vec::new()));
    let _subscription = {
        let losses = Arc::clone(&losses);
        client.on_connection_state_change(move |change| {
            if change.is_loss() {
                losses.lock().unwrap().push(change.reason.clone().unwrap_or_default());
            }
        })
    };

    client.start("integration-test").await.unwrap();
    let _first = server.accept_connection().await;
    server.set_answer_pings(false);

    wait_for_state(&client, ConnectionState::Reconnecting).await;
    server.set_answer_pings(true);

    let _second = server.accept_connection().await;
    wait_for_state(&client, ConnectionState::Connected).await;

    assert!(server.pings_seen() > 0);
    let losses = losses.lock().unwrap().clone();
    assert!(
        losses.first().is_some_and(|reason| reason.contains("heartbeat")),
        "unexpected loss reasons: {losses:?}"
    );
    client.stop();
}

#[tokio::test]
async fn explicit_force_reconnect_cycles_the_link() {
    let Some(mut server) = start_server_or_skip("explicit_force_reconnect_cycles_the_link").await
    else {
        return;
    };
    let client = BridgeClient::new(resilient_test_config(&server));
    client.start("integration-test").await.unwrap();
    let _first = server.accept_connection().await;

    let states = Arc::new(Mutex::new(Vec::new()));
    let _subscription = {
        let states = Arc::clone(&states);
        client.on_connection_state_change(move |change| states.lock().unwrap().push(change.current))
    };

    client.force_reconnect().await.unwrap();
    let second = server.accept_connection().await;
    assert_eq!(second.index(), 1);
    assert_eq!(
        *states.lock().unwrap(),
        vec![ConnectionState::Reconnecting, ConnectionState::Connected]
    );
    client.stop();
}

#[tokio::test]
async fn queued_while_disconnected_replays_when_editor_returns() {
    let Some(mut server) =
        start_server_or_skip("queued_while_disconnected_replays_when_editor_returns").await
    else {
        return;
    };
    server.set_accepting(false);
    let client = Arc::new(BridgeClient::new(resilient_test_config(&server)));

    // The connect made on behalf of the call fails, so the call waits in
    // the queue while the client keeps dialing.
    let queued = queue_call(&client, "refresh_assets").await;
    assert!(!client.is_connected());

    server.set_accepting(true);
    let mut connection = server.accept_connection().await;
    assert_eq!(connection.index(), 0);
    let request = connection.recv_request_method("refresh_assets").await;
    connection.send_result(&request_id(&request), json!({"refreshed": true}));

    assert_eq!(queued.await.unwrap().unwrap(), json!({"refreshed": true}));
    let stats = client.queue_stats();
    assert_eq!(stats.replayed, 1);
    assert_eq!(stats.size, 0);
    client.stop();
}

#[tokio::test]
async fn queued_request_times_out_while_editor_stays_away() {
    let Some(server) =
        start_server_or_skip("queued_request_times_out_while_editor_stays_away").await
    else {
        return;
    };
    server.set_accepting(false);
    let client = BridgeClient::new(resilient_test_config(&server));

    let started = tokio::time::Instant::now();
    let err = client
        .send_request(
            Request::new("manage_scene", json!({})),
            RequestOptions::default().with_timeout(Duration::from_millis(300)),
        )
        .await
        .unwrap_err();
    match err {
        BridgeError::Timeout { method, millis } => {
            assert_eq!(method, "manage_scene");
            assert_eq!(millis, 300);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(started.elapsed() < STEP_TIMEOUT);

    let stats = client.queue_stats();
    assert_eq!(stats.size, 0);
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.replayed, 0);
    client.stop();
}

#[tokio::test]
async fn request_during_first_connect_is_queued_and_replayed() {
    let Some(mut server) =
        start_server_or_skip("request_during_first_connect_is_queued_and_replayed").await
    else {
        return;
    };
    server.set_handshake_delay(Duration::from_millis(300));
    let client = Arc::new(BridgeClient::new(resilient_test_config(&server)));

    let starting = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.start("integration-test").await })
    };
    wait_for_state(&client, ConnectionState::Connecting).await;
    let queued = queue_call(&client, "manage_scene").await;

    starting.await.unwrap().unwrap();
    let mut connection = server.accept_connection().await;
    let request = connection.recv_request_method("manage_scene").await;
    connection.send_result(&request_id(&request), json!(["Main Camera"]));

    assert_eq!(queued.await.unwrap().unwrap(), json!(["Main Camera"]));
    let stats = client.queue_stats();
    assert_eq!(stats.enqueued, 1);
    assert_eq!(stats.replayed, 1);
    client.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listener_may_stop_the_client_when_the_link_drops() {
    let Some(mut server) =
        start_server_or_skip("listener_may_stop_the_client_when_the_link_drops").await
    else {
        return;
    };
    let client = Arc::new(BridgeClient::new(resilient_test_config(&server)));
    let _subscription = {
        let client_ref = Arc::downgrade(&client);
        client.on_connection_state_change(move |change| {
            if change.current == ConnectionState::Reconnecting {
                if let Some(client) = client_ref.upgrade() {
                    client.stop();
                }
            }
        })
    };

    client.start("integration-test").await.unwrap();
    let connection = server.accept_connection().await;
    connection.force_close();

    wait_for_state(&client, ConnectionState::Disconnected).await;
    assert!(
        server
            .try_accept_connection(Duration::from_millis(200))
            .await
            .is_none()
    );

    // The client is still usable after stopping itself.
    client.start("integration-test").await.unwrap();
    let second = server.accept_connection().await;
    assert_eq!(second.index(), 1);
    client.stop();
}
