//! Azure Relay transport tests against the in-process mock relay

use std::time::Duration;

use azhexgate::{ClientTunnel, GatewayClient};
use azhexgate_e2e::{
    init_test, MockHttpService, MockRelay, MockTcpService, TestGateway, TEST_KEY, TEST_KEY_NAME,
};
use azhexgate_protocol::TransportMode;
use azhexgate_relay::sas::{generate_sas_token, is_shared_access_signature};
use azhexgate_relay::{forward, AzureListener, AzureSender, Connection, ControlState, RelayError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn sas_for(relay: &MockRelay, name: &str) -> String {
    generate_sas_token(
        &relay.endpoint().resource_uri(name),
        TEST_KEY_NAME,
        TEST_KEY,
        Duration::from_secs(3600),
    )
    .unwrap()
}

/// Start accepting on `listener` and wait until the relay sees its control channel
async fn accept_in_background(
    relay: &MockRelay,
    listener: &AzureListener,
) -> JoinHandle<Result<Connection, RelayError>> {
    let accepting = listener.clone();
    let handle = tokio::spawn(async move { accepting.accept(&CancellationToken::new()).await });
    assert!(
        relay.wait_for_listener(listener.name()).await,
        "listener never connected"
    );
    handle
}

async fn accepted(handle: JoinHandle<Result<Connection, RelayError>>) -> Connection {
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("accept timed out")
        .unwrap()
        .expect("accept failed")
}

#[tokio::test]
async fn test_azure_accept_and_dial() {
    init_test();

    let relay = MockRelay::start().await;
    let listener_token = sas_for(&relay, "hc1");
    let listener = AzureListener::new(relay.endpoint(), "hc1", Some(listener_token.clone()));
    let pending = accept_in_background(&relay, &listener).await;
    assert_eq!(listener.state(), ControlState::Connected);

    let sender = AzureSender::new(relay.endpoint(), "hc1", Some(sas_for(&relay, "hc1")));
    let mut outbound = sender.dial(&CancellationToken::new()).await.unwrap();
    let mut inbound = accepted(pending).await;

    outbound.write_all(b"hello relay").await.unwrap();
    outbound.flush().await.unwrap();
    let mut buf = [0u8; 11];
    inbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello relay");

    inbound.write_all(b"hi back").await.unwrap();
    inbound.flush().await.unwrap();
    let mut buf = [0u8; 7];
    outbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi back");

    let listen = relay.handshakes_for("listen");
    assert_eq!(listen.len(), 1);
    assert_eq!(listen[0].name, "hc1");
    assert_eq!(listen[0].id.as_deref(), Some(listener.listener_id()));
    assert_eq!(listen[0].service_bus_auth.as_deref(), Some(listener_token.as_str()));
    assert_eq!(relay.handshakes_for("accept").len(), 1);

    outbound.close().await;
    listener.close().await;
}

#[tokio::test]
async fn test_azure_large_payload() {
    init_test();

    let relay = MockRelay::start().await;
    let listener = AzureListener::new(relay.endpoint(), "bulk", None);
    let pending = accept_in_background(&relay, &listener).await;

    let sender = AzureSender::new(relay.endpoint(), "bulk", None);
    let mut outbound = sender.dial(&CancellationToken::new()).await.unwrap();
    let mut inbound = accepted(pending).await;

    let payload: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 253) as u8).collect();
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
        outbound.write_all(&payload).await.unwrap();
        outbound.flush().await.unwrap();
        outbound.close().await;
    });

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(20), inbound.read_to_end(&mut received))
        .await
        .expect("transfer timed out")
        .unwrap();
    writer.await.unwrap();

    assert_eq!(received.len(), expected.len());
    assert!(received == expected, "payload corrupted in transit");
    listener.close().await;
}

#[tokio::test]
async fn test_azure_close_propagates() {
    init_test();

    let relay = MockRelay::start().await;
    let listener = AzureListener::new(relay.endpoint(), "closing", None);
    let sender = AzureSender::new(relay.endpoint(), "closing", None);

    // Sender side closes: the listener side sees EOF
    let pending = accept_in_background(&relay, &listener).await;
    let outbound = sender.dial(&CancellationToken::new()).await.unwrap();
    let mut inbound = accepted(pending).await;
    outbound.close().await;

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(WAIT, inbound.read(&mut buf))
        .await
        .expect("EOF never arrived")
        .unwrap();
    assert_eq!(n, 0);

    // Listener side closes: the sender side sees EOF
    let pending = tokio::spawn({
        let listener = listener.clone();
        async move { listener.accept(&CancellationToken::new()).await }
    });
    let mut outbound = sender.dial(&CancellationToken::new()).await.unwrap();
    let inbound = accepted(pending).await;
    inbound.close().await;

    let n = tokio::time::timeout(WAIT, outbound.read(&mut buf))
        .await
        .expect("EOF never arrived")
        .unwrap();
    assert_eq!(n, 0);

    listener.close().await;
}

#[tokio::test]
async fn test_sender_token_placement() {
    init_test();

    let relay = MockRelay::start().await;
    let listener = AzureListener::new(relay.endpoint(), "tokens", None);
    let _pending = accept_in_background(&relay, &listener).await;

    let sas = sas_for(&relay, "tokens");
    let sas_sender = AzureSender::new(relay.endpoint(), "tokens", Some(sas.clone()));
    let conn = sas_sender.dial(&CancellationToken::new()).await.unwrap();
    conn.close().await;

    let bearer_sender = AzureSender::new(relay.endpoint(), "tokens", Some("opaque-token".to_string()));
    let conn = bearer_sender.dial(&CancellationToken::new()).await.unwrap();
    conn.close().await;

    let connects = relay.handshakes_for("connect");
    assert_eq!(connects.len(), 2);

    assert_eq!(connects[0].query_token.as_deref(), Some(sas.as_str()));
    assert!(connects[0].authorization.is_none());

    assert!(connects[1].query_token.is_none());
    assert_eq!(connects[1].authorization.as_deref(), Some("Bearer opaque-token"));

    listener.close().await;
}

#[tokio::test]
async fn test_dial_without_listener_fails() {
    init_test();

    let relay = MockRelay::start().await;
    let sender = AzureSender::new(relay.endpoint(), "nobody", None);

    let result = sender.dial(&CancellationToken::new()).await;
    assert!(matches!(result, Err(RelayError::WebSocket(_))));
}

#[tokio::test]
async fn test_listener_closes_on_relay_loss() {
    init_test();

    let relay = MockRelay::start().await;
    let listener = AzureListener::new(relay.endpoint(), "fragile", None);
    let pending = accept_in_background(&relay, &listener).await;

    relay.drop_listeners("fragile");

    let result = tokio::time::timeout(WAIT, pending)
        .await
        .expect("accept never returned")
        .unwrap();
    assert!(matches!(result, Err(RelayError::ListenerClosed)));
    assert!(listener.is_closed());
    assert_eq!(listener.state(), ControlState::Closed);

    // No reconnect: later accepts fail straight away
    let again = listener.accept(&CancellationToken::new()).await;
    assert!(matches!(again, Err(RelayError::ListenerClosed)));
}

#[tokio::test]
async fn test_malformed_control_message_is_ignored() {
    init_test();

    let relay = MockRelay::start().await;
    let listener = AzureListener::new(relay.endpoint(), "noisy", None);
    let pending = accept_in_background(&relay, &listener).await;

    relay.send_control_text("noisy", "this is not json");
    relay.send_control_text("noisy", r#"{"renewToken":{"token":"x"}}"#);

    let sender = AzureSender::new(relay.endpoint(), "noisy", None);
    let mut outbound = sender.dial(&CancellationToken::new()).await.unwrap();
    let mut inbound = accepted(pending).await;
    assert!(!listener.is_closed());

    outbound.write_all(b"still works").await.unwrap();
    outbound.flush().await.unwrap();
    let mut buf = [0u8; 11];
    inbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still works");

    listener.close().await;
}

#[tokio::test]
async fn test_forward_serve_over_relay() {
    init_test();

    let relay = MockRelay::start().await;
    let echo = MockTcpService::start().await;
    let listener = AzureListener::new(relay.endpoint(), "echo", None);

    let cancel = CancellationToken::new();
    let server = tokio::spawn(forward::serve(
        listener.clone().into(),
        echo.addr_string(),
        cancel.clone(),
    ));
    assert!(relay.wait_for_listener("echo").await);

    let sender = AzureSender::new(relay.endpoint(), "echo", None);
    for round in 0..3 {
        let mut conn = sender.dial(&CancellationToken::new()).await.unwrap();
        let message = format!("round {}", round);
        conn.write_all(message.as_bytes()).await.unwrap();
        conn.flush().await.unwrap();

        let mut buf = vec![0u8; message.len()];
        tokio::time::timeout(WAIT, conn.read_exact(&mut buf))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(buf, message.as_bytes());
        conn.close().await;
    }

    cancel.cancel();
    assert!(server.await.unwrap().is_ok());
    listener.close().await;
}

#[tokio::test]
async fn test_remote_gateway_end_to_end() {
    init_test();

    let relay = MockRelay::start().await;
    let gateway = TestGateway::start_remote(&relay).await;
    let mock = MockHttpService::start().await;
    mock.set_response_body(b"served over the relay".to_vec());

    let client = GatewayClient::new(&gateway.api_url()).unwrap();
    let grant = client
        .create_tunnel(mock.port(), Some("myapp"))
        .await
        .unwrap();
    assert_eq!(grant.mode, TransportMode::Remote);
    assert_eq!(grant.hybrid_connection_name, "myapp");
    assert_eq!(grant.relay_endpoint, relay.endpoint().to_string());
    assert!(is_shared_access_signature(&grant.listener_token));

    let tunnel = ClientTunnel::from_response(&grant).unwrap();
    let cancel = CancellationToken::new();
    let runner = tokio::spawn({
        let cancel = cancel.clone();
        let local_addr = mock.addr_string();
        async move { tunnel.run(&local_addr, cancel).await }
    });
    assert!(relay.wait_for_listener("myapp").await);

    let resp = gateway.get("myapp", "/hello").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "served over the relay");
    assert_eq!(mock.last_request().unwrap().uri, "/hello");

    let listen = relay.handshakes_for("listen");
    assert_eq!(listen[0].service_bus_auth.as_deref(), Some(grant.listener_token.as_str()));
    let connect = relay.handshakes_for("connect");
    assert!(connect[0]
        .query_token
        .as_deref()
        .is_some_and(is_shared_access_signature));

    cancel.cancel();
    assert!(runner.await.unwrap().is_ok());
    client.delete_tunnel("myapp").await.unwrap();
}

#[tokio::test]
async fn test_remote_gateway_without_client_returns_502() {
    init_test();

    let relay = MockRelay::start().await;
    let gateway = TestGateway::start_remote(&relay).await;
    let client = GatewayClient::new(&gateway.api_url()).unwrap();
    client.create_tunnel(3000, Some("idle")).await.unwrap();

    // Tunnel registered but nobody listens on the relay
    let resp = gateway.get("idle", "/").await;
    assert_eq!(resp.status(), 502);
}
