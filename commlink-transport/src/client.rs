//! Outbound TCP client transport
//!
//! `Idle -> Connecting -> Connected -> Disconnected -> (retry -> Connecting)`.
//! A connect attempt is given [`CONNECT_WAIT`] to complete; a slower attempt
//! is abandoned and counted as a failure. Losing the connection (peer close,
//! read error, or a send on a dead link) hands recovery to the retry task.

use crate::contract::CommLink;
use crate::link::{Link, LinkHandler, LinkSlot};
use crate::retry::Reconnect;
use crate::state::TransportState;
use async_trait::async_trait;
use bytes::Bytes;
use commlink_core::fs::default_root;
use commlink_core::{
    parse_ip_address, parse_tcp_port, ClientParams, CommResult, EventSink, ParameterSection, Source, Status,
    TransportKind,
};
use parking_lot::RwLock;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;

/// Time a connect attempt is given before it is abandoned
pub const CONNECT_WAIT: Duration = Duration::from_millis(100);

/// TCP client transport
///
/// # Example
///
/// ```no_run
/// use commlink_transport::{ClientTransport, CommLink};
///
/// # async fn run() {
/// let client = ClientTransport::new();
/// client.on_data(|source, payload| println!("{}: {:?}", source, payload));
/// if client.open_with_retry().await {
///     client.send_str("PING").await;
/// }
/// # }
/// ```
pub struct ClientTransport {
    shared: Arc<ClientShared>,
}

struct ClientShared {
    me: Weak<ClientShared>,
    params: RwLock<ClientParams>,
    state: TransportState,
    link: LinkSlot,
    /// Serializes connect attempts from the application and the retry task
    connect_lock: tokio::sync::Mutex<()>,
}

impl ClientTransport {
    /// Client rooted at `<current dir>/commlink`, with persisted parameters loaded
    pub fn new() -> Self {
        Self::with_root(default_root())
    }

    /// Client persisting under `root`, with persisted parameters loaded
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let client = Self::from_params(ClientParams::default(), root);
        client.load_parameter();
        client
    }

    /// Client with explicit parameters; nothing is read from disk
    pub fn from_params(params: ClientParams, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let shared = Arc::new_cyclic(|me| ClientShared {
            me: me.clone(),
            params: RwLock::new(params),
            state: TransportState::new(root),
            link: LinkSlot::default(),
            connect_lock: tokio::sync::Mutex::new(()),
        });
        Self { shared }
    }

    pub fn params(&self) -> ClientParams {
        self.shared.params.read().clone()
    }

    /// Replace all parameters; used by the next connect
    pub fn set_params(&self, params: ClientParams) -> CommResult<()> {
        params.validate()?;
        *self.shared.params.write() = params;
        Ok(())
    }

    pub fn set_address(&self, address: &str) -> CommResult<()> {
        let address = parse_ip_address(address)?;
        self.shared.params.write().address = address;
        Ok(())
    }

    /// Single connect attempt with the current parameters
    pub async fn connect(&self) -> bool {
        self.shared.connect().await
    }

    /// Validate and adopt `address:port`, then connect
    ///
    /// A malformed endpoint is reported as an error event and leaves the
    /// parameters unchanged.
    pub async fn connect_to(&self, address: &str, port: &str) -> bool {
        match ClientParams::new(address, port) {
            Ok(endpoint) => {
                let mut params = self.shared.params.write();
                params.address = endpoint.address;
                params.port = endpoint.port;
            }
            Err(e) => {
                self.shared
                    .report(Status::Error, &format!("Connection Failure : {}", e));
                return false;
            }
        }
        self.shared.connect().await
    }

    /// Drop the connection without stopping a running retry task
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.link.get().and_then(|link| link.local_addr())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.link.get().map(|link| link.peer_addr())
    }

    /// Close this client and adopt the configuration of `other`
    ///
    /// The live connection of `other` is not touched.
    pub async fn copy_from(&self, other: &ClientTransport) {
        self.close().await;
        *self.shared.params.write() = other.params();
        self.shared.state.set_root(&other.root_directory());
    }

    /// A new, unopened client with the same configuration
    pub fn clone_config(&self) -> ClientTransport {
        Self::from_params(self.params(), self.root_directory())
    }
}

impl Default for ClientTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTransport")
            .field("endpoint", &self.shared.params.read().endpoint())
            .field("connected", &self.is_connected())
            .field("retry_open", &self.is_retry_open())
            .finish()
    }
}

impl Drop for ClientTransport {
    fn drop(&mut self) {
        self.shared.state.events.clear();
        self.shared.state.set_retry_open(false);
        self.shared.state.retry.abort();
        self.shared.link.release();
    }
}

impl ClientShared {
    fn source(&self) -> Source {
        Source::new(TransportKind::Client, self.params.read().endpoint().to_string())
    }

    fn report(&self, status: Status, message: &str) {
        self.state.events.status(&self.source(), status, message);
    }

    async fn connect(&self) -> bool {
        let _guard = self.connect_lock.lock().await;
        if self.link.is_alive() {
            return true;
        }

        let quiet = self.state.is_retry_open();
        let source = self.source();
        let endpoint = self.params.read().endpoint();
        self.state
            .attempt_status(&source, quiet, Status::Info, &format!("Connection Attempt : {}", endpoint));
        let stream = match tokio::time::timeout(CONNECT_WAIT, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state.set_retry_open(true);
                self.state.attempt_status(
                    &source,
                    quiet,
                    Status::Error,
                    &format!("Connection Failure : Socket Error ({})", e),
                );
                return false;
            }
            Err(_) => {
                self.state.set_retry_open(true);
                self.state
                    .attempt_status(&source, quiet, Status::Error, "Connection Failure : Client Connecting delay");
                return false;
            }
        };

        let Some(me) = self.me.upgrade() else {
            return false;
        };
        let peer = stream.peer_addr().unwrap_or(endpoint);
        self.link.replace(Link::spawn(stream, peer, me));
        self.state.set_send(false);
        self.state.set_retry_open(false);
        self.report(Status::Info, "Connection Success");
        self.save_parameter();
        true
    }

    fn disconnect(&self) {
        self.state.set_retry_open(false);
        self.state.set_send(false);
        self.report(Status::Info, "Close Connection");
        self.link.release();
    }

    fn begin_retry(&self) -> bool {
        let Some(me) = self.me.upgrade() else {
            return false;
        };
        let policy = self.params.read().retry.clone();
        self.state.retry.start(me, policy)
    }

    fn save_parameter(&self) -> bool {
        let params = self.params.read().clone();
        self.state.save_section(&self.source(), &params)
    }
}

impl LinkHandler for ClientShared {
    fn on_received(&self, link: &Link, chunk: Bytes) {
        if !self.link.is_current(link) {
            return;
        }
        self.state.received.append(&chunk);
        let source = self.source();
        self.state.events.data(&source, &chunk);
        self.state.events.status(
            &source,
            Status::Info,
            &format!("Receive Success : {}", String::from_utf8_lossy(&chunk)),
        );
    }

    fn on_closed(&self, link: &Link, reason: Option<String>) {
        if !self.link.release_if_current(link) {
            return;
        }
        self.state.set_send(false);
        match reason {
            None => self.report(Status::Error, "Receive Failure : Disconnection"),
            Some(reason) => self.report(Status::Error, &format!("Receive Failure : Socket Error ({})", reason)),
        }
        self.begin_retry();
    }

    fn on_sent(&self, link: &Link, payload: &Bytes, result: io::Result<()>) {
        match result {
            Ok(()) if self.link.is_current(link) && link.is_alive() => {
                self.state.set_send(true);
                self.report(
                    Status::Info,
                    &format!("Send Success : {}", String::from_utf8_lossy(payload)),
                );
            }
            Ok(()) => self.report(Status::Error, "Send Failure : Socket Disconnect"),
            Err(e) => self.report(Status::Error, &format!("Send Failure : Socket Error ({})", e)),
        }
    }
}

#[async_trait]
impl Reconnect for ClientShared {
    fn retry_noun(&self) -> &'static str {
        "Connection"
    }

    fn is_usable(&self) -> bool {
        self.link.is_alive()
    }

    fn retry_flag(&self) -> &AtomicBool {
        &self.state.retry_open
    }

    async fn try_once(&self) -> bool {
        self.connect().await
    }

    fn report(&self, status: Status, message: &str) {
        ClientShared::report(self, status, message);
    }
}

#[async_trait]
impl CommLink for ClientTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Client
    }

    fn source(&self) -> Source {
        self.shared.source()
    }

    fn events(&self) -> &EventSink {
        &self.shared.state.events
    }

    fn port(&self) -> String {
        self.shared.params.read().port.to_string()
    }

    fn set_port(&self, port: &str) -> CommResult<()> {
        let port = parse_tcp_port(port)?;
        self.shared.params.write().port = port;
        Ok(())
    }

    fn root_directory(&self) -> PathBuf {
        self.shared.state.root()
    }

    fn set_root_directory(&self, root: &Path) -> bool {
        self.shared.state.set_root(root)
    }

    fn is_connected(&self) -> bool {
        self.shared.link.is_alive()
    }

    fn is_send(&self) -> bool {
        self.shared.state.is_send()
    }

    fn is_retry_open(&self) -> bool {
        self.shared.state.is_retry_open()
    }

    fn is_retrying(&self) -> bool {
        self.shared.state.retry.is_running()
    }

    fn receive_message(&self) -> String {
        self.shared.state.received.text()
    }

    fn take_received(&self) -> Bytes {
        self.shared.state.received.take()
    }

    fn clear_received(&self) {
        self.shared.state.received.clear();
    }

    async fn open(&self) -> bool {
        self.shared.connect().await
    }

    async fn close(&self) {
        let shared = &self.shared;
        shared.state.set_retry_open(false);
        shared.state.retry.suspend();
        shared.state.retry.stop().await;
        shared.disconnect();
        shared.link.drain().await;
        shared.state.received.clear();
        shared.state.retry.resume();
    }

    async fn send(&self, payload: &[u8]) -> bool {
        let shared = &self.shared;
        let link = match shared.link.get() {
            Some(link) if link.is_alive() => link,
            _ => {
                if !shared.state.retry.is_running() {
                    shared.disconnect();
                }
                shared.report(Status::Error, "Send Failure : Connection Fail");
                shared.begin_retry();
                return false;
            }
        };

        shared.state.set_send(false);
        if !link.enqueue(Bytes::copy_from_slice(payload)).await {
            shared.report(Status::Error, "Send Failure : Socket Disconnect");
            return false;
        }
        shared.report(
            Status::Send,
            &format!("Send Message : {}", String::from_utf8_lossy(payload)),
        );
        true
    }

    fn start_retry(&self) -> bool {
        self.shared.begin_retry()
    }

    async fn stop_retry(&self) {
        self.shared.state.set_retry_open(false);
        self.shared.state.retry.stop().await;
    }

    fn load_parameter(&self) -> bool {
        let source = self.shared.source();
        match self.shared.state.load_section::<ClientParams>(&source) {
            Some(params) => {
                *self.shared.params.write() = params;
                true
            }
            None => false,
        }
    }

    fn save_parameter(&self) -> bool {
        self.shared.save_parameter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commlink_core::RetryPolicy;
    use parking_lot::Mutex;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn collect_status(client: &ClientTransport) -> Arc<Mutex<Vec<(Status, String)>>> {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = messages.clone();
        client.on_status(move |_, status, message| sink.lock().push((status, message.to_string())));
        messages
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[test]
    fn test_defaults_and_setters() {
        let dir = TempDir::new().unwrap();
        let client = ClientTransport::with_root(dir.path());
        assert_eq!(client.kind(), TransportKind::Client);
        assert_eq!(client.port(), "1234");
        assert_eq!(client.source().to_string(), "TcpClient(127.0.0.1:1234)");
        assert!(!client.is_connected());
        assert!(!client.is_send());
        assert!(!client.is_retry_open());

        assert!(client.set_port("0").is_err());
        assert!(client.set_address("not-an-ip").is_err());
        assert_eq!(client.params(), ClientParams::default());

        client.set_port("9100").unwrap();
        client.set_address("10.0.0.7").unwrap();
        assert_eq!(client.source().endpoint, "10.0.0.7:9100");
    }

    #[test]
    fn test_parameters_round_trip_through_root() {
        let dir = TempDir::new().unwrap();
        let client = ClientTransport::with_root(dir.path());
        let params = ClientParams::new("192.168.1.20", "5020")
            .unwrap()
            .with_retry(RetryPolicy::new(3, Duration::from_millis(500)));
        client.set_params(params.clone()).unwrap();
        assert!(client.save_parameter());

        let reloaded = ClientTransport::with_root(dir.path());
        assert_eq!(reloaded.params(), params);

        let copy = reloaded.clone_config();
        assert_eq!(copy.params(), params);
        assert_eq!(copy.root_directory(), dir.path());
    }

    #[tokio::test]
    async fn test_send_without_connection_fails_once() {
        let dir = TempDir::new().unwrap();
        let params = ClientParams::default().with_retry(RetryPolicy::disabled());
        let client = ClientTransport::from_params(params, dir.path());
        let messages = collect_status(&client);

        assert!(!client.send_str("PING").await);
        assert!(!client.is_retrying());

        let failures = messages
            .lock()
            .iter()
            .filter(|(status, message)| *status == Status::Error && message == "Send Failure : Connection Fail")
            .count();
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn test_connect_send_and_receive() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let params = ClientParams::new("127.0.0.1", &port.to_string()).unwrap();
        let client = ClientTransport::from_params(params, dir.path());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        client.on_data(move |_, payload| sink.lock().extend_from_slice(payload));

        assert!(client.open().await);
        assert!(client.is_connected());
        assert!(dir.path().join("client.json").is_file());
        let (mut peer, _) = listener.accept().await.unwrap();

        assert!(client.send_str("PING").await);
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");
        assert!(wait_until(|| client.is_send()).await);

        peer.write_all(b"PONG").await.unwrap();
        assert!(wait_until(|| received.lock().len() == 4).await);
        assert_eq!(&received.lock()[..], b"PONG");
        assert_eq!(client.receive_message(), "PONG");
        assert_eq!(&client.take_received()[..], b"PONG");
        assert_eq!(client.receive_message(), "");

        client.close().await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_to_rejects_malformed_endpoint() {
        let dir = TempDir::new().unwrap();
        let client = ClientTransport::with_root(dir.path());
        let messages = collect_status(&client);
        assert!(!client.connect_to("300.1.1.1", "80").await);
        assert!(!client.connect_to("127.0.0.1", "70000").await);
        assert_eq!(client.params(), ClientParams::default());
        assert_eq!(messages.lock().len(), 2);
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_retry_reports_connection_failure_once() {
        let dir = TempDir::new().unwrap();
        let policy = RetryPolicy::new(3, Duration::from_secs(5)).with_interval(Duration::from_millis(20));
        let params = ClientParams::new("127.0.0.1", &free_port().to_string())
            .unwrap()
            .with_retry(policy);
        let client = ClientTransport::from_params(params, dir.path());
        let messages = collect_status(&client);

        assert!(!client.send_str("PING").await);
        assert!(wait_until(|| !client.is_retrying()).await);

        let messages = messages.lock().clone();
        let failures = messages
            .iter()
            .filter(|(status, message)| {
                *status == Status::Error && message.to_lowercase().contains("connection fail")
            })
            .count();
        assert_eq!(failures, 1);
        let attempts = messages
            .iter()
            .filter(|(_, message)| message.starts_with("Connection Retry Attempt"))
            .count();
        assert_eq!(attempts, 3);
        assert!(!messages.iter().any(|(_, message)| message.starts_with("Connection Attempt")));
        assert_eq!(
            messages.last().unwrap(),
            &(Status::Error, "Connection Retry Failure : Attempts Exhausted".to_string())
        );
    }

    #[tokio::test]
    async fn test_drop_silences_running_retry() {
        let dir = TempDir::new().unwrap();
        let policy = RetryPolicy::new(1_000, Duration::from_secs(30)).with_interval(Duration::from_millis(10));
        let params = ClientParams::new("127.0.0.1", &free_port().to_string())
            .unwrap()
            .with_retry(policy);
        let client = ClientTransport::from_params(params, dir.path());
        let messages = collect_status(&client);

        assert!(client.start_retry());
        assert!(wait_until(|| messages.lock().len() >= 3).await);
        drop(client);

        let seen = messages.lock().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(messages.lock().len(), seen);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let client = ClientTransport::with_root(dir.path());
        client.close().await;
        client.close().await;
        assert!(!client.is_connected());
        assert!(!client.is_retry_open());
        assert!(!client.is_retrying());
    }
}
