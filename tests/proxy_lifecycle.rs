use std::net::TcpListener;
use std::time::Duration;

use serial_test::serial;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tproxy_core::api::proxy_api::{
    create_default_config, destroy_connection, get_proxy_status, init_core, list_connections,
    start_proxy, stop_proxy,
};
use tproxy_core::proxy::SessionPhase;

fn available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "Requires ability to bind to localhost sockets"]
#[serial]
async fn proxy_start_stop_transitions_state() {
    let log_dir = tempfile::tempdir().unwrap();
    init_core(Some(log_dir.path().to_string_lossy().to_string()), false).unwrap();

    let mut config = create_default_config();
    config.port = available_port();

    start_proxy(config.clone()).await.expect("proxy starts");
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = get_proxy_status();
    assert!(status.is_running);
    assert_eq!(status.port, config.port);

    stop_proxy().await.expect("proxy stops");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!get_proxy_status().is_running);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "Requires ability to bind to localhost sockets"]
#[serial]
async fn live_tunnels_are_listed_and_destroyable() {
    let origin = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_port = origin.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = origin.accept().await.unwrap();
        let mut buf = [0u8; 16];
        while let Ok(n) = socket.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    });

    let mut config = create_default_config();
    config.port = available_port();
    start_proxy(config.clone()).await.expect("proxy starts");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut client = TcpStream::connect(("127.0.0.1", get_proxy_status().port))
        .await
        .unwrap();
    client
        .write_all(format!("CONNECT 127.0.0.1:{origin_port} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut ack = [0u8; 19];
    client.read_exact(&mut ack).await.unwrap();
    assert_eq!(&ack, b"HTTP/1.0 200 OK\r\n\r\n");

    // The phase flips right after the acknowledgement is written
    let mut sessions = list_connections();
    for _ in 0..50 {
        if sessions.iter().all(|s| s.phase == SessionPhase::Relaying) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        sessions = list_connections();
    }
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].phase, SessionPhase::Relaying);
    assert_eq!(get_proxy_status().active_connections, 1);

    assert!(destroy_connection(sessions[0].id.clone()));
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .expect("proxy closed the client")
        .unwrap();
    assert!(rest.is_empty());

    stop_proxy().await.expect("proxy stops");
}
