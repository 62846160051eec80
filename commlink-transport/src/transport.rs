//! Closed set of transport kinds behind one value

use crate::client::ClientTransport;
use crate::contract::CommLink;
use crate::serial::SerialTransport;
use crate::server::ServerTransport;
use async_trait::async_trait;
use bytes::Bytes;
use commlink_core::{CommResult, EventSink, Source, TransportKind};
use std::path::{Path, PathBuf};

/// Any of the three transports
#[derive(Debug)]
pub enum Transport {
    Client(ClientTransport),
    Server(ServerTransport),
    Serial(SerialTransport),
}

macro_rules! dispatch {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            Transport::Client($inner) => $body,
            Transport::Server($inner) => $body,
            Transport::Serial($inner) => $body,
        }
    };
}

impl Transport {
    /// Transport of `kind` persisting under `root`, with persisted parameters loaded
    pub fn with_root(kind: TransportKind, root: impl Into<PathBuf>) -> Self {
        match kind {
            TransportKind::Client => Transport::Client(ClientTransport::with_root(root)),
            TransportKind::Server => Transport::Server(ServerTransport::with_root(root)),
            TransportKind::Serial => Transport::Serial(SerialTransport::with_root(root)),
        }
    }

    pub fn as_client(&self) -> Option<&ClientTransport> {
        match self {
            Transport::Client(client) => Some(client),
            _ => None,
        }
    }

    pub fn as_server(&self) -> Option<&ServerTransport> {
        match self {
            Transport::Server(server) => Some(server),
            _ => None,
        }
    }

    pub fn as_serial(&self) -> Option<&SerialTransport> {
        match self {
            Transport::Serial(serial) => Some(serial),
            _ => None,
        }
    }

    /// Close this transport and adopt the configuration of `other`
    ///
    /// Returns `false`, leaving this transport untouched, if the kinds differ.
    pub async fn copy_from(&self, other: &Transport) -> bool {
        match (self, other) {
            (Transport::Client(this), Transport::Client(other)) => this.copy_from(other).await,
            (Transport::Server(this), Transport::Server(other)) => this.copy_from(other).await,
            (Transport::Serial(this), Transport::Serial(other)) => this.copy_from(other).await,
            _ => return false,
        }
        true
    }

    /// A new, unopened transport of the same kind and configuration
    pub fn clone_config(&self) -> Transport {
        match self {
            Transport::Client(client) => Transport::Client(client.clone_config()),
            Transport::Server(server) => Transport::Server(server.clone_config()),
            Transport::Serial(serial) => Transport::Serial(serial.clone_config()),
        }
    }
}

impl From<ClientTransport> for Transport {
    fn from(client: ClientTransport) -> Self {
        Transport::Client(client)
    }
}

impl From<ServerTransport> for Transport {
    fn from(server: ServerTransport) -> Self {
        Transport::Server(server)
    }
}

impl From<SerialTransport> for Transport {
    fn from(serial: SerialTransport) -> Self {
        Transport::Serial(serial)
    }
}

#[async_trait]
impl CommLink for Transport {
    fn kind(&self) -> TransportKind {
        dispatch!(self, inner => inner.kind())
    }

    fn source(&self) -> Source {
        dispatch!(self, inner => inner.source())
    }

    fn events(&self) -> &EventSink {
        dispatch!(self, inner => inner.events())
    }

    fn port(&self) -> String {
        dispatch!(self, inner => inner.port())
    }

    fn set_port(&self, port: &str) -> CommResult<()> {
        dispatch!(self, inner => inner.set_port(port))
    }

    fn root_directory(&self) -> PathBuf {
        dispatch!(self, inner => inner.root_directory())
    }

    fn set_root_directory(&self, root: &Path) -> bool {
        dispatch!(self, inner => inner.set_root_directory(root))
    }

    fn is_connected(&self) -> bool {
        dispatch!(self, inner => inner.is_connected())
    }

    fn is_send(&self) -> bool {
        dispatch!(self, inner => inner.is_send())
    }

    fn is_retry_open(&self) -> bool {
        dispatch!(self, inner => inner.is_retry_open())
    }

    fn is_retrying(&self) -> bool {
        dispatch!(self, inner => inner.is_retrying())
    }

    fn receive_message(&self) -> String {
        dispatch!(self, inner => inner.receive_message())
    }

    fn take_received(&self) -> Bytes {
        dispatch!(self, inner => inner.take_received())
    }

    fn clear_received(&self) {
        dispatch!(self, inner => inner.clear_received())
    }

    async fn open(&self) -> bool {
        dispatch!(self, inner => inner.open().await)
    }

    async fn close(&self) {
        dispatch!(self, inner => inner.close().await)
    }

    async fn send(&self, payload: &[u8]) -> bool {
        dispatch!(self, inner => inner.send(payload).await)
    }

    fn start_retry(&self) -> bool {
        dispatch!(self, inner => inner.start_retry())
    }

    async fn stop_retry(&self) {
        dispatch!(self, inner => inner.stop_retry().await)
    }

    fn load_parameter(&self) -> bool {
        dispatch!(self, inner => inner.load_parameter())
    }

    fn save_parameter(&self) -> bool {
        dispatch!(self, inner => inner.save_parameter())
    }
}
