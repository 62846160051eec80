//! Client and server transports over loopback sockets

use commlink_core::{ClientParams, KnownPeers, ParameterStore, RetryPolicy, ServerParams, Status};
use commlink_transport::{ClientTransport, CommLink, ServerTransport};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

type Messages = Arc<Mutex<Vec<(Status, String)>>>;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn record_status<T: CommLink>(transport: &T) -> Messages {
    let messages = Messages::default();
    let sink = messages.clone();
    transport.on_status(move |_, status, message| sink.lock().push((status, message.to_string())));
    messages
}

fn record_data<T: CommLink>(transport: &T) -> Arc<Mutex<Vec<u8>>> {
    let data = Arc::new(Mutex::new(Vec::new()));
    let sink = data.clone();
    transport.on_data(move |_, payload| sink.lock().extend_from_slice(payload));
    data
}

fn count(messages: &Messages, text: &str) -> usize {
    messages.lock().iter().filter(|(_, message)| message == text).count()
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn server_on(port: u16, dir: &TempDir) -> ServerTransport {
    ServerTransport::from_params(ServerParams::new(&port.to_string()).unwrap(), dir.path())
}

fn client_to(port: u16, dir: &TempDir) -> ClientTransport {
    let params = ClientParams::new("127.0.0.1", &port.to_string()).unwrap();
    ClientTransport::from_params(params, dir.path())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ping_pong() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let server = server_on(port, &dir);
    let client = client_to(port, &dir);
    let server_data = record_data(&server);
    let client_data = record_data(&client);

    assert!(server.open().await);
    assert!(client.open().await);
    assert!(wait_until(|| server.is_connected()).await);

    assert!(client.send_str("PING").await);
    assert!(wait_until(|| server_data.lock().len() >= 4).await);
    assert_eq!(String::from_utf8_lossy(&server_data.lock()), "PING");

    assert!(server.send_str("PONG").await);
    assert!(wait_until(|| client_data.lock().len() >= 4).await);
    assert_eq!(String::from_utf8_lossy(&client_data.lock()), "PONG");
    assert!(wait_until(|| server.is_send() && client.is_send()).await);

    client.close().await;
    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_payloads_arrive_in_order() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let server = server_on(port, &dir);
    let client = client_to(port, &dir);
    let received = record_data(&server);

    assert!(server.open().await);
    assert!(client.open().await);
    assert!(wait_until(|| server.is_connected()).await);

    let mut expected = Vec::new();
    for i in 0..200 {
        let payload = format!("<{:03}>", i);
        expected.extend_from_slice(payload.as_bytes());
        assert!(client.send_str(&payload).await);
    }
    assert!(wait_until(|| received.lock().len() >= expected.len()).await);
    assert_eq!(*received.lock(), expected);
    assert_eq!(server.receive_message().as_bytes(), &expected[..]);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_client_retry_without_listener() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let policy = RetryPolicy::new(3, Duration::from_millis(500));
    let deadline = policy.timeout + policy.interval;
    let params = ClientParams::new("127.0.0.1", &port.to_string())
        .unwrap()
        .with_retry(policy);
    let client = ClientTransport::from_params(params, dir.path());
    let messages = record_status(&client);

    let started = Instant::now();
    assert!(!client.open_with_retry().await);
    assert!(client.is_retry_open());
    assert!(wait_until(|| !client.is_retrying()).await);
    let elapsed = started.elapsed();
    assert!(elapsed <= deadline, "retry ran for {:?}", elapsed);

    // The attempt from open is announced, the retry attempts are counted
    assert_eq!(count(&messages, &format!("Connection Attempt : 127.0.0.1:{}", port)), 1);
    for attempt in 1..=3 {
        assert_eq!(count(&messages, &format!("Connection Retry Attempt : {}/3", attempt)), 1);
    }
    assert_eq!(count(&messages, "Connection Retry Start"), 1);
    let (status, last) = messages.lock().last().cloned().unwrap();
    assert_eq!(status, Status::Error);
    assert_eq!(last, "Connection Retry Failure : Attempts Exhausted");
    assert!(!client.is_retry_open());
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_peer_close_starts_one_retry() {
    let dir = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let client = client_to(port, &dir);
    let messages = record_status(&client);

    assert!(client.open().await);
    let (peer, _) = listener.accept().await.unwrap();
    drop(peer);

    assert!(wait_until(|| count(&messages, "Receive Failure : Disconnection") == 1).await);
    assert!(wait_until(|| client.is_connected()).await);
    assert!(wait_until(|| !client.is_retrying()).await);
    assert_eq!(count(&messages, "Connection Retry Start"), 1);
    assert_eq!(count(&messages, "Connection Retry Success"), 1);

    client.close().await;
    assert!(!client.is_connected());
    assert!(!client.is_retrying());
}

#[tokio::test]
async fn test_send_on_dead_connection_reports_once() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let params = ClientParams::new("127.0.0.1", &port.to_string())
        .unwrap()
        .with_retry(RetryPolicy::new(1, Duration::from_millis(200)));
    let client = ClientTransport::from_params(params, dir.path());
    let messages = record_status(&client);
    let received = record_data(&client);

    assert!(!client.send(b"PING").await);
    assert!(!client.is_send());
    assert!(received.lock().is_empty());
    assert_eq!(count(&messages, "Send Failure : Connection Fail"), 1);

    client.close().await;
}

#[tokio::test]
async fn test_known_peers_deduplicated() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let server = server_on(port, &dir);
    assert!(server.open().await);

    for _ in 0..2 {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let local = stream.local_addr().unwrap();
        assert!(wait_until(|| server.peer_addr() == Some(local)).await);
    }

    let persisted = KnownPeers::load(&ParameterStore::new(dir.path())).unwrap();
    assert_eq!(persisted.to_vec(), vec!["127.0.0.1".to_string()]);
    assert_eq!(server.known_peers().len(), 1);

    server.close().await;
}

#[tokio::test]
async fn test_new_peer_replaces_active_peer() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let server = server_on(port, &dir);
    let messages = record_status(&server);
    assert!(server.open().await);

    let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let first_addr = first.local_addr().unwrap();
    assert!(wait_until(|| server.peer_addr() == Some(first_addr)).await);

    let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let second_addr = second.local_addr().unwrap();
    assert!(wait_until(|| server.peer_addr() == Some(second_addr)).await);

    // The replaced peer is dropped without any message
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), first.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read, 0);
    let replaced = format!("Active Peer Replaced : {} -> {}", first_addr, second_addr);
    assert!(wait_until(|| count(&messages, &replaced) == 1).await);

    assert!(server.send_str("ONLY-SECOND").await);
    let mut buf = [0u8; 11];
    second.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ONLY-SECOND");

    server.close().await;
}

#[tokio::test]
async fn test_close_then_open_restarts() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let server = server_on(port, &dir);
    let client = client_to(port, &dir);

    for round in 0..2 {
        assert!(server.open().await, "server round {}", round);
        assert!(client.open().await, "client round {}", round);
        assert!(wait_until(|| server.is_connected()).await);
        assert!(client.send_str("HELLO").await);
        assert!(wait_until(|| server.receive_message() == "HELLO").await);

        client.close().await;
        server.close().await;
        assert_eq!(server.receive_message(), "");
        assert_eq!(client.receive_message(), "");
        assert!(!server.is_listening());
        assert!(!server.is_connected());
        assert!(!client.is_connected());
        assert!(!client.is_retry_open());
        assert!(!client.is_retrying());
    }

    let reloaded = ServerTransport::with_root(dir.path());
    assert_eq!(reloaded.port(), port.to_string());
    let reloaded = ClientTransport::with_root(dir.path());
    assert_eq!(reloaded.port(), port.to_string());
}

#[tokio::test]
async fn test_server_recovers_listener_after_peer_loss() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let server = server_on(port, &dir);
    let messages = record_status(&server);
    assert!(server.open().await);

    let peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    assert!(wait_until(|| server.is_connected()).await);
    drop(peer);

    assert!(wait_until(|| count(&messages, "Receive Failure : Disconnection") == 1).await);
    assert!(wait_until(|| !server.is_retrying()).await);
    assert_eq!(count(&messages, "Listen Retry Start"), 1);
    assert!(server.is_listening());
    assert!(!server.is_connected());

    let mut again = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    assert!(wait_until(|| server.is_connected()).await);
    assert!(server.send_str("BACK").await);
    let mut buf = [0u8; 4];
    again.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"BACK");
    again.write_all(b"!").await.unwrap();
    assert!(wait_until(|| server.receive_message() == "!").await);

    server.close().await;
}
