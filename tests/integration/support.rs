//! Shared helpers for the integration tests

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use revport::client::ClientState;
use revport::config::ClientConfig;
use revport::proto::TargetService;
use revport::server::{Broker, CoreState};

/// Spawn a TCP echo server on an ephemeral loopback port
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = conn.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

/// Spawn a broker on an ephemeral loopback port
pub async fn spawn_broker(port_start: u16) -> (Arc<CoreState>, SocketAddr) {
    let state = CoreState::new(port_start);
    let broker = Broker::bind("127.0.0.1:0".parse().unwrap(), state.clone())
        .await
        .unwrap();
    let addr = broker.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = broker.run().await;
    });
    (state, addr)
}

/// Build a client state pointed at the broker, without persistence
pub fn client_state(
    server_addr: SocketAddr,
    client_id: &str,
    services: Vec<TargetService>,
) -> Arc<ClientState> {
    let config = ClientConfig {
        server_addr: server_addr.to_string(),
        client_id: client_id.to_string(),
        services,
        ..ClientConfig::default()
    };
    ClientState::new(config, None)
}

/// A service advertising the given local port, no assigned public port
pub fn service(id: &str, local_port: u16) -> TargetService {
    TargetService {
        id: id.to_string(),
        local_ip: "127.0.0.1".to_string(),
        local_port,
        remote_port: 0,
        remark: String::new(),
    }
}

/// Poll a condition until it holds or a five-second deadline passes
pub async fn wait_for<F>(mut condition: F, what: &str)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// The rewritten registry id of a loopback client
pub fn loopback_id(client_id: &str) -> String {
    format!("{client_id}@127.0.0.1")
}

/// The assigned public ports of a client's services, in list order
pub fn assigned_ports(state: &Arc<CoreState>, registry_id: &str) -> Vec<u16> {
    state
        .get_client(registry_id)
        .map(|session| session.services().iter().map(|s| s.remote_port).collect())
        .unwrap_or_default()
}
