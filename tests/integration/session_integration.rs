//! Session lifecycle integration tests
//!
//! A real broker, real clients, loopback TCP end to end.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use revport::client::session::{connect_server, sync_services};
use revport::error::RpcError;
use revport::mux::MuxConnection;
use revport::proto::{self, BaseReply, HandshakeArgs};
use revport::rpc::RpcClient;

use super::support;

#[tokio::test]
async fn test_happy_path_end_to_end() {
    let echo = support::spawn_echo_server().await;
    let (state, broker_addr) = support::spawn_broker(62100).await;

    let client = support::client_state(
        broker_addr,
        "c1",
        vec![support::service("s1", echo.port())],
    );
    connect_server(client.clone()).await.unwrap();
    sync_services(&client).await.unwrap();

    let registry_id = support::loopback_id("c1");
    support::wait_for(
        || state.get_client(&registry_id).is_some(),
        "client registration",
    )
    .await;
    support::wait_for(
        || support::assigned_ports(&state, &registry_id).first().is_some_and(|p| *p != 0),
        "port allocation",
    )
    .await;

    let port = support::assigned_ports(&state, &registry_id)[0];
    assert!(port >= 62100);
    support::wait_for(|| state.has_listener(port), "public listener").await;

    // A user connection on the public port reaches the echo service that
    // lives on the client's side of the tunnel.
    let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    user.write_all(b"hello tunnel").await.unwrap();
    let mut buf = [0u8; 12];
    user.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello tunnel");

    // A second user connection gets its own stream.
    let mut other = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    other.write_all(b"again").await.unwrap();
    let mut buf = [0u8; 5];
    other.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"again");
}

#[tokio::test]
async fn test_disconnect_cleans_up_registry_and_listeners() {
    let echo = support::spawn_echo_server().await;
    let (state, broker_addr) = support::spawn_broker(62200).await;

    let client = support::client_state(
        broker_addr,
        "c1",
        vec![support::service("s1", echo.port())],
    );
    connect_server(client.clone()).await.unwrap();
    sync_services(&client).await.unwrap();

    let registry_id = support::loopback_id("c1");
    support::wait_for(
        || support::assigned_ports(&state, &registry_id).first().is_some_and(|p| *p != 0),
        "port allocation",
    )
    .await;
    let port = support::assigned_ports(&state, &registry_id)[0];

    // Kill the client's session.
    let link = client.link().expect("connected");
    link.mux.close().await;

    support::wait_for(
        || state.get_client(&registry_id).is_none(),
        "registry cleanup",
    )
    .await;
    support::wait_for(|| !state.has_listener(port), "listener cleanup").await;
    support::wait_for(
        || std::net::TcpListener::bind(("0.0.0.0", port)).is_ok(),
        "port release",
    )
    .await;
    support::wait_for(|| !client.is_connected(), "client disconnect flag").await;

    // The freed port is allocatable again.
    assert_eq!(state.allocate_port().unwrap(), port);
}

#[tokio::test]
async fn test_version_mismatch_is_rejected() {
    let (state, broker_addr) = support::spawn_broker(62300).await;

    // Hand-rolled session so we can announce a stale version.
    let conn = TcpStream::connect(broker_addr).await.unwrap();
    let mux = MuxConnection::client(conn);
    let forward = mux.handle().open_stream().await.unwrap();
    let rpc = RpcClient::new(forward);

    let args = HandshakeArgs {
        client_id: "old-client".into(),
        version: "0.9".into(),
        name: String::new(),
        phone: String::new(),
        project_name: String::new(),
        remark: String::new(),
    };
    let result: Result<BaseReply, RpcError> =
        rpc.call(proto::methods::HANDSHAKE, &args).await;

    match result {
        Err(RpcError::Remote(message)) => assert!(message.contains("version mismatch")),
        other => panic!("expected version mismatch, got {other:?}"),
    }

    // Nothing was registered.
    assert!(state.clients_snapshot().is_empty());
}

#[tokio::test]
async fn test_duplicate_id_replaces_previous_session() {
    let (state, broker_addr) = support::spawn_broker(62400).await;
    let registry_id = support::loopback_id("dup");

    let first = support::client_state(broker_addr, "dup", Vec::new());
    connect_server(first.clone()).await.unwrap();
    support::wait_for(|| state.get_client(&registry_id).is_some(), "first session").await;
    let first_session = state.get_client(&registry_id).unwrap().mux.id();

    let second = support::client_state(broker_addr, "dup", Vec::new());
    connect_server(second.clone()).await.unwrap();
    support::wait_for(
        || {
            state
                .get_client(&registry_id)
                .is_some_and(|s| s.mux.id() != first_session)
        },
        "session replacement",
    )
    .await;

    // One registry entry, owned by the new session; the old client
    // observes its session dying.
    assert_eq!(state.clients_snapshot().len(), 1);
    support::wait_for(|| !first.is_connected(), "old client disconnect").await;
    assert!(second.is_connected());
}

#[tokio::test]
async fn test_push_config_reaches_client() {
    let (state, broker_addr) = support::spawn_broker(62500).await;

    let client = support::client_state(broker_addr, "pushed", Vec::new());
    connect_server(client.clone()).await.unwrap();

    let registry_id = support::loopback_id("pushed");
    support::wait_for(|| state.get_client(&registry_id).is_some(), "registration").await;

    // Admin adds a service on the server side, then pushes the list back.
    state
        .clone()
        .update_services(&registry_id, vec![support::service("admin-added", 9999)]);
    let reply = state.push_config(&registry_id).await.unwrap();
    assert!(reply.success);

    support::wait_for(
        || client.services().iter().any(|s| s.id == "admin-added"),
        "pushed service list",
    )
    .await;
    // The pushed copy carries the allocated public port.
    let pushed = client
        .services()
        .into_iter()
        .find(|s| s.id == "admin-added")
        .unwrap();
    assert_ne!(pushed.remote_port, 0);
}

#[tokio::test]
async fn test_user_connection_to_unadvertised_port_is_refused() {
    let (state, broker_addr) = support::spawn_broker(62600).await;

    let client = support::client_state(broker_addr, "quiet", Vec::new());
    connect_server(client.clone()).await.unwrap();

    let registry_id = support::loopback_id("quiet");
    support::wait_for(|| state.get_client(&registry_id).is_some(), "registration").await;

    // No services advertised: the allocator's first candidate port has no
    // listener, so a user connection there is refused outright.
    let port = state.allocate_port().unwrap();
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}
