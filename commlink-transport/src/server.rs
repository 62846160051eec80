//! Single-peer listening TCP server transport
//!
//! The listener keeps accepting for as long as it is bound, but only one
//! peer is active at a time: every accepted socket replaces the previous
//! peer, whose link is shut down. The replaced peer is not told why; it just
//! sees its connection closed. A status event records each replacement.
//!
//! Every remote IP that ever connected is kept in a persisted known-peer
//! list. The list is history only and does not gate acceptance.

use crate::client::CONNECT_WAIT;
use crate::contract::CommLink;
use crate::link::{Link, LinkHandler, LinkSlot};
use crate::retry::Reconnect;
use crate::state::TransportState;
use async_trait::async_trait;
use bytes::Bytes;
use commlink_core::fs::default_root;
use commlink_core::{
    parse_tcp_port, CommResult, EventSink, KnownPeers, ParameterSection, ServerParams, Source, Status,
    TransportKind,
};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// TCP server transport serving one peer at a time
pub struct ServerTransport {
    shared: Arc<ServerShared>,
}

struct ServerShared {
    me: Weak<ServerShared>,
    params: RwLock<ServerParams>,
    state: TransportState,
    peers: RwLock<KnownPeers>,
    listener: Mutex<Option<Listening>>,
    peer: LinkSlot,
    /// Serializes listen attempts from the application and the retry task
    listen_lock: tokio::sync::Mutex<()>,
}

/// A bound listener and its accept task
struct Listening {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Listening {
    fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }
}

impl ServerTransport {
    /// Server rooted at `<current dir>/commlink`, with parameters and known peers loaded
    pub fn new() -> Self {
        Self::with_root(default_root())
    }

    /// Server persisting under `root`, with parameters and known peers loaded
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let server = Self::from_params(ServerParams::default(), root);
        server.load_parameter();
        server.shared.load_peers();
        server
    }

    /// Server with explicit parameters; nothing is read from disk
    pub fn from_params(params: ServerParams, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let shared = Arc::new_cyclic(|me| ServerShared {
            me: me.clone(),
            params: RwLock::new(params),
            state: TransportState::new(root),
            peers: RwLock::new(KnownPeers::new()),
            listener: Mutex::new(None),
            peer: LinkSlot::default(),
            listen_lock: tokio::sync::Mutex::new(()),
        });
        Self { shared }
    }

    pub fn params(&self) -> ServerParams {
        self.shared.params.read().clone()
    }

    /// Replace all parameters; used by the next listen
    pub fn set_params(&self, params: ServerParams) -> CommResult<()> {
        params.validate()?;
        *self.shared.params.write() = params;
        Ok(())
    }

    pub fn backlog(&self) -> u32 {
        self.shared.params.read().backlog
    }

    /// Single bind-and-listen attempt with the current parameters
    pub async fn listen(&self) -> bool {
        self.shared.listen().await
    }

    /// Validate and adopt `port`, then listen
    pub async fn listen_on(&self, port: &str) -> bool {
        match parse_tcp_port(port) {
            Ok(port) => self.shared.params.write().port = port,
            Err(e) => {
                self.shared
                    .report(Status::Error, &format!("Listening Failure : {}", e));
                return false;
            }
        }
        self.shared.listen().await
    }

    pub fn is_listening(&self) -> bool {
        self.shared.is_listening()
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .listener
            .lock()
            .as_ref()
            .filter(|listening| listening.is_active())
            .map(|listening| listening.local_addr)
    }

    /// Remote address of the active peer
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer.get().map(|link| link.peer_addr())
    }

    pub fn known_peers(&self) -> KnownPeers {
        self.shared.peers.read().clone()
    }

    /// Close this server and adopt the configuration of `other`
    ///
    /// Known peers are reloaded from the new root; `other` is not touched.
    pub async fn copy_from(&self, other: &ServerTransport) {
        self.close().await;
        *self.shared.params.write() = other.params();
        if self.shared.state.set_root(&other.root_directory()) {
            self.shared.load_peers();
        }
    }

    /// A new, unbound server with the same configuration and known peers
    pub fn clone_config(&self) -> ServerTransport {
        let copy = Self::from_params(self.params(), self.root_directory());
        *copy.shared.peers.write() = self.known_peers();
        copy
    }
}

impl Default for ServerTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTransport")
            .field("port", &self.shared.params.read().port)
            .field("listening", &self.is_listening())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Drop for ServerTransport {
    fn drop(&mut self) {
        let shared = &self.shared;
        shared.state.events.clear();
        shared.persist();
        shared.state.set_retry_open(false);
        shared.state.retry.abort();
        if let Some(listening) = shared.listener.lock().take() {
            listening.cancel.cancel();
        }
        shared.peer.release();
    }
}

impl ServerShared {
    fn source(&self) -> Source {
        Source::new(TransportKind::Server, self.params.read().port.to_string())
    }

    fn report(&self, status: Status, message: &str) {
        self.state.events.status(&self.source(), status, message);
    }

    fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|listening| listening.is_active())
    }

    async fn listen(&self) -> bool {
        let _guard = self.listen_lock.lock().await;
        if self.is_listening() {
            return true;
        }

        let (address, backlog) = {
            let params = self.params.read();
            (params.bind_address(), params.backlog)
        };
        let quiet = self.state.is_retry_open();
        let source = self.source();
        self.state
            .attempt_status(&source, quiet, Status::Info, &format!("Listen Port : {}", address.port()));
        let listener = match bind(address, backlog) {
            Ok(listener) => listener,
            Err(e) => {
                self.state.set_retry_open(true);
                self.state.attempt_status(
                    &source,
                    quiet,
                    Status::Error,
                    &format!("Listening Failure : Socket Error ({})", e),
                );
                return false;
            }
        };

        let Some(me) = self.me.upgrade() else {
            return false;
        };
        let local_addr = listener.local_addr().unwrap_or(address);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::accept_loop(me, listener, cancel.clone()));
        let previous = self.listener.lock().replace(Listening {
            local_addr,
            cancel,
            task,
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        self.state.set_retry_open(false);
        self.report(Status::Info, "Listen Success");
        self.save_parameter();
        true
    }

    async fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => shared.on_accepted(stream, peer),
                Err(e) => {
                    shared.report(Status::Error, &format!("Acceptation Failure : Socket Error ({})", e));
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(CONNECT_WAIT) => {}
                    }
                }
            }
        }
        log::debug!("Accept loop on port {} stopped", shared.params.read().port);
    }

    fn on_accepted(&self, stream: TcpStream, peer: SocketAddr) {
        let address = peer.ip().to_string();
        let fresh = {
            let mut peers = self.peers.write();
            peers.insert(&address).then(|| peers.clone())
        };
        if let Some(peers) = fresh {
            self.save_peers(&peers);
        }
        self.report(Status::Info, &format!("Acception Success To Client : {}", peer));

        let Some(me) = self.me.upgrade() else {
            return;
        };
        self.state.set_send(false);
        if let Some(previous) = self.peer.replace(Link::spawn(stream, peer, me)) {
            self.report(
                Status::Info,
                &format!("Active Peer Replaced : {} -> {}", previous.peer_addr(), peer),
            );
        }
    }

    fn begin_retry(&self) -> bool {
        let Some(me) = self.me.upgrade() else {
            return false;
        };
        let policy = self.params.read().retry.clone();
        self.state.retry.start(me, policy)
    }

    fn load_peers(&self) -> bool {
        match KnownPeers::load(&self.state.store()) {
            Ok(peers) => {
                *self.peers.write() = peers;
                true
            }
            Err(e) => {
                self.report(Status::Error, &format!("Peer Load Failure : {}", e));
                false
            }
        }
    }

    fn save_peers(&self, peers: &KnownPeers) -> bool {
        match peers.save(&self.state.store()) {
            Ok(()) => true,
            Err(e) => {
                self.report(Status::Error, &format!("Peer Save Failure : {}", e));
                false
            }
        }
    }

    fn save_parameter(&self) -> bool {
        let params = self.params.read().clone();
        self.state.save_section(&self.source(), &params)
    }

    /// Write parameters and known peers
    fn persist(&self) {
        self.save_parameter();
        let peers = self.peers.read().clone();
        self.save_peers(&peers);
    }
}

fn bind(address: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = match address {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(address)?;
    socket.listen(backlog)
}

impl LinkHandler for ServerShared {
    fn on_received(&self, link: &Link, chunk: Bytes) {
        if !self.peer.is_current(link) {
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
        if !self.peer.release_if_current(link) {
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
            Ok(()) if self.peer.is_current(link) && link.is_alive() => {
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
impl Reconnect for ServerShared {
    fn retry_noun(&self) -> &'static str {
        "Listen"
    }

    fn is_usable(&self) -> bool {
        self.is_listening()
    }

    fn retry_flag(&self) -> &AtomicBool {
        &self.state.retry_open
    }

    async fn try_once(&self) -> bool {
        self.listen().await
    }

    fn report(&self, status: Status, message: &str) {
        ServerShared::report(self, status, message);
    }
}

#[async_trait]
impl CommLink for ServerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Server
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

    /// `true` while an active peer is connected
    fn is_connected(&self) -> bool {
        self.shared.peer.is_alive()
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
        self.shared.listen().await
    }

    async fn close(&self) {
        let shared = &self.shared;
        shared.persist();
        shared.state.set_retry_open(false);
        shared.state.retry.suspend();
        shared.state.retry.stop().await;

        shared.report(Status::Info, "Close Listen");
        let listening = shared.listener.lock().take();
        if let Some(listening) = listening {
            listening.cancel.cancel();
            if let Err(e) = listening.task.await {
                log::error!("Accept task on port {} ended abnormally: {}", shared.params.read().port, e);
            }
        }
        shared.peer.drain().await;
        shared.state.set_send(false);
        shared.state.received.clear();
        shared.state.retry.resume();
    }

    /// Send to the active peer; with no peer this fails without retrying
    async fn send(&self, payload: &[u8]) -> bool {
        let shared = &self.shared;
        let link = match shared.peer.get() {
            Some(link) if link.is_alive() => link,
            _ => {
                shared.report(Status::Error, "Send Failure : Connection Fail");
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
        match self.shared.state.load_section::<ServerParams>(&source) {
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
