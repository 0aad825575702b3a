//! Listener reconciliation across syncs and reconnects

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use revport::client::session::{connect_server, sync_services};

use super::support;

#[tokio::test]
async fn test_reconnect_preserves_ports_by_allocation_order() {
    let echo = support::spawn_echo_server().await;
    let (state, broker_addr) = support::spawn_broker(62700).await;
    let registry_id = support::loopback_id("c1");

    let client = support::client_state(
        broker_addr,
        "c1",
        vec![
            support::service("s1", echo.port()),
            support::service("s2", echo.port()),
        ],
    );
    connect_server(client.clone()).await.unwrap();
    sync_services(&client).await.unwrap();

    support::wait_for(
        || support::assigned_ports(&state, &registry_id).iter().all(|p| *p != 0)
            && support::assigned_ports(&state, &registry_id).len() == 2,
        "initial allocation",
    )
    .await;
    let before = support::assigned_ports(&state, &registry_id);

    // Kill the session and wait for a full teardown.
    client.link().expect("connected").mux.close().await;
    support::wait_for(|| state.get_client(&registry_id).is_none(), "teardown").await;
    support::wait_for(|| !client.is_connected(), "client disconnect flag").await;
    for port in &before {
        let port = *port;
        support::wait_for(
            move || std::net::TcpListener::bind(("0.0.0.0", port)).is_ok(),
            "port release",
        )
        .await;
    }

    // Reconnect with the same configured id; the local list still has no
    // assigned ports. Scanning from port_start reassigns the same ports in
    // service order.
    connect_server(client.clone()).await.unwrap();
    sync_services(&client).await.unwrap();

    support::wait_for(
        || support::assigned_ports(&state, &registry_id).iter().all(|p| *p != 0)
            && support::assigned_ports(&state, &registry_id).len() == 2,
        "re-allocation",
    )
    .await;
    let after = support::assigned_ports(&state, &registry_id);
    assert_eq!(before, after);
    for port in after {
        assert!(state.has_listener(port));
    }
}

#[tokio::test]
async fn test_resync_with_forgotten_ports_keeps_allocations() {
    let echo = support::spawn_echo_server().await;
    let (state, broker_addr) = support::spawn_broker(62800).await;
    let registry_id = support::loopback_id("c1");

    let client = support::client_state(
        broker_addr,
        "c1",
        vec![
            support::service("s1", echo.port()),
            support::service("s2", echo.port()),
        ],
    );
    connect_server(client.clone()).await.unwrap();
    sync_services(&client).await.unwrap();

    support::wait_for(
        || support::assigned_ports(&state, &registry_id).iter().all(|p| *p != 0)
            && support::assigned_ports(&state, &registry_id).len() == 2,
        "initial allocation",
    )
    .await;
    let before = support::assigned_ports(&state, &registry_id);

    // The local list still carries remote_port == 0 for both services; a
    // re-sync on the live session must not move the listeners.
    sync_services(&client).await.unwrap();
    let after = support::assigned_ports(&state, &registry_id);
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_removing_a_service_closes_only_its_port() {
    let echo = support::spawn_echo_server().await;
    let (state, broker_addr) = support::spawn_broker(62900).await;
    let registry_id = support::loopback_id("c1");

    let client = support::client_state(
        broker_addr,
        "c1",
        vec![
            support::service("s1", echo.port()),
            support::service("s2", echo.port()),
        ],
    );
    connect_server(client.clone()).await.unwrap();
    sync_services(&client).await.unwrap();

    support::wait_for(
        || support::assigned_ports(&state, &registry_id).iter().all(|p| *p != 0)
            && support::assigned_ports(&state, &registry_id).len() == 2,
        "initial allocation",
    )
    .await;
    let ports = support::assigned_ports(&state, &registry_id);
    let (p1, p2) = (ports[0], ports[1]);

    // Drop s2 locally and re-sync the full list.
    assert!(client.remove_target("s2"));
    sync_services(&client).await.unwrap();

    support::wait_for(|| !state.has_listener(p2), "removed listener").await;
    support::wait_for(
        || std::net::TcpListener::bind(("0.0.0.0", p2)).is_ok(),
        "port release",
    )
    .await;
    assert!(state.has_listener(p1));

    // The surviving service still bridges.
    let mut user = TcpStream::connect(("127.0.0.1", p1)).await.unwrap();
    user.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    user.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still here");

    // New user connections to the removed port are refused.
    support::wait_for(
        || {
            std::net::TcpStream::connect_timeout(
                &std::net::SocketAddr::from(([127, 0, 0, 1], p2)),
                std::time::Duration::from_millis(200),
            )
            .is_err()
        },
        "removed port refuses connections",
    )
    .await;
}
