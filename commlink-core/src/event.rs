//! Status and data events emitted by transports

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Severity of a status event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Lifecycle progress (connect attempt, success, retry start/stop, receive)
    Info,
    /// Failure of an operation; the transport recovers or goes idle
    Error,
    /// A payload was accepted for transmission
    Send,
    /// A device handle was confirmed open (serial)
    Conform,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Info => "Info",
            Status::Error => "Error",
            Status::Send => "Send",
            Status::Conform => "Conform",
        };
        f.write_str(name)
    }
}

/// The three transport kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Client,
    Server,
    Serial,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Client => "TcpClient",
            TransportKind::Server => "TcpServer",
            TransportKind::Serial => "Serial",
        };
        f.write_str(name)
    }
}

/// Origin of an event: transport kind plus its configured endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Source {
    pub kind: TransportKind,
    pub endpoint: String,
}

impl Source {
    pub fn new(kind: TransportKind, endpoint: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.endpoint)
    }
}

/// Status callback: `(source, severity, message)`
pub type StatusCallback = Arc<dyn Fn(&Source, Status, &str) + Send + Sync>;

/// Data callback: `(source, payload)`, once per received chunk
pub type DataCallback = Arc<dyn Fn(&Source, &[u8]) + Send + Sync>;

/// Holder for the two callback channels of a transport
///
/// Every status event is also written to the `log` facade, so a transport
/// with no callback wired still leaves a trace. Callbacks are invoked without
/// any internal lock held; a callback may replace the callbacks themselves.
#[derive(Default)]
pub struct EventSink {
    status: RwLock<Option<StatusCallback>>,
    data: RwLock<Option<DataCallback>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status_callback<F>(&self, callback: F)
    where
        F: Fn(&Source, Status, &str) + Send + Sync + 'static,
    {
        let callback: StatusCallback = Arc::new(callback);
        *self.status.write() = Some(callback);
    }

    pub fn set_data_callback<F>(&self, callback: F)
    where
        F: Fn(&Source, &[u8]) + Send + Sync + 'static,
    {
        let callback: DataCallback = Arc::new(callback);
        *self.data.write() = Some(callback);
    }

    pub fn clear(&self) {
        *self.status.write() = None;
        *self.data.write() = None;
    }

    /// Emit a status event
    pub fn status(&self, source: &Source, status: Status, message: &str) {
        match status {
            Status::Info | Status::Conform => log::info!("[{}] {}", source, message),
            Status::Send => log::debug!("[{}] {}", source, message),
            Status::Error => log::warn!("[{}] {}", source, message),
        }
        let callback = self.status.read().clone();
        if let Some(callback) = callback {
            callback(source, status, message);
        }
    }

    /// Emit a received chunk
    pub fn data(&self, source: &Source, payload: &[u8]) {
        let callback = self.data.read().clone();
        if let Some(callback) = callback {
            callback(source, payload);
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("status", &self.status.read().is_some())
            .field("data", &self.data.read().is_some())
            .finish()
    }
}
