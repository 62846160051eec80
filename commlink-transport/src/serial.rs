//! Serial line transport
//!
//! Device I/O is blocking and runs on the blocking thread pool. Sends block
//! up to the write timeout. Receive is pull-based: [`SerialTransport::receive`]
//! drains whatever the driver has buffered. There is no receive chain and no
//! automatic retry unless the retry policy is enabled.

use crate::contract::CommLink;
use crate::link::BUFFER_SIZE;
use crate::retry::Reconnect;
use crate::state::TransportState;
use async_trait::async_trait;
use bytes::Bytes;
use commlink_core::fs::default_root;
use commlink_core::{
    parse_serial_port, CommError, CommResult, EventSink, ParameterSection, Parity, SerialParams, Source, Status,
    StopBits, TransportKind,
};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio_serial::SerialPort;

/// Pause between driver polls while waiting for input
const RECEIVE_POLL: Duration = Duration::from_millis(10);

/// Serial port transport
pub struct SerialTransport {
    shared: Arc<SerialShared>,
}

struct SerialShared {
    me: Weak<SerialShared>,
    params: RwLock<SerialParams>,
    state: TransportState,
    port: Mutex<Option<Box<dyn SerialPort>>>,
    opened: AtomicBool,
    /// One blocking operation on the device at a time
    io_lock: tokio::sync::Mutex<()>,
}

impl SerialTransport {
    /// Serial transport rooted at `<current dir>/commlink`, with persisted parameters loaded
    pub fn new() -> Self {
        Self::with_root(default_root())
    }

    /// Serial transport persisting under `root`, with persisted parameters loaded
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let serial = Self::from_params(SerialParams::default(), root);
        serial.load_parameter();
        serial
    }

    /// Serial transport with explicit parameters; nothing is read from disk
    pub fn from_params(params: SerialParams, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let shared = Arc::new_cyclic(|me| SerialShared {
            me: me.clone(),
            params: RwLock::new(params),
            state: TransportState::new(root),
            port: Mutex::new(None),
            opened: AtomicBool::new(false),
            io_lock: tokio::sync::Mutex::new(()),
        });
        Self { shared }
    }

    pub fn params(&self) -> SerialParams {
        self.shared.params.read().clone()
    }

    /// Replace all parameters; used by the next open
    pub fn set_params(&self, params: SerialParams) -> CommResult<()> {
        params.validate()?;
        *self.shared.params.write() = params;
        Ok(())
    }

    pub fn set_baud_rate(&self, baud_rate: u32) -> CommResult<()> {
        self.update_params(|params| params.baud_rate = baud_rate)
    }

    pub fn set_data_bits(&self, data_bits: u8) -> CommResult<()> {
        self.update_params(|params| params.data_bits = data_bits)
    }

    pub fn set_parity(&self, parity: Parity) -> CommResult<()> {
        self.update_params(|params| params.parity = parity)
    }

    pub fn set_stop_bits(&self, stop_bits: StopBits) -> CommResult<()> {
        self.update_params(|params| params.stop_bits = stop_bits)
    }

    pub fn set_timeouts(&self, read_timeout: Duration, write_timeout: Duration) -> CommResult<()> {
        self.update_params(|params| {
            params.read_timeout = read_timeout;
            params.write_timeout = write_timeout;
        })
    }

    fn update_params(&self, change: impl FnOnce(&mut SerialParams)) -> CommResult<()> {
        let mut params = self.params();
        change(&mut params);
        self.set_params(params)
    }

    /// Validate and adopt the device name, then open it
    pub async fn open_port(&self, name: &str) -> bool {
        match parse_serial_port(name) {
            Ok(name) => self.shared.params.write().port = name,
            Err(e) => {
                self.shared.report(Status::Error, &format!("Port Open Error : {}", e));
                return false;
            }
        }
        self.shared.open().await
    }

    /// Drain the bytes the driver has buffered
    ///
    /// Waits up to `wait` for the first byte. The chunk is appended to the
    /// receive accumulator, passed to the data callback and returned as text;
    /// an empty string means nothing arrived or the port is not open.
    pub async fn receive(&self, wait: Duration) -> String {
        let shared = &self.shared;
        let _guard = shared.io_lock.lock().await;
        if !shared.is_open() {
            shared.report(Status::Error, "Receive Failure : Connection Fail");
            return String::new();
        }
        let Some(me) = shared.me.upgrade() else {
            return String::new();
        };

        let read_timeout = shared.params.read().read_timeout;
        let result = tokio::task::spawn_blocking(move || me.read_blocking(wait, read_timeout)).await;
        let chunk = match result {
            Ok(Ok(chunk)) => chunk,
            Ok(Err(e)) => {
                shared.fail_io(&e);
                shared.report(Status::Error, &format!("Receive Failure : Port Error ({})", e));
                return String::new();
            }
            Err(e) => {
                shared.report(Status::Error, &format!("Receive Failure : {}", e));
                return String::new();
            }
        };
        if chunk.is_empty() {
            return String::new();
        }

        let text = String::from_utf8_lossy(&chunk).into_owned();
        shared.state.received.append(&chunk);
        let source = shared.source();
        shared.state.events.data(&source, &chunk);
        shared
            .state
            .events
            .status(&source, Status::Info, &format!("Receive Success : {}", text));
        text
    }

    /// Device names reported by the operating system
    pub fn available_ports() -> Vec<String> {
        match tokio_serial::available_ports() {
            Ok(ports) => ports.into_iter().map(|info| info.port_name).collect(),
            Err(e) => {
                log::warn!("Failed to enumerate serial ports: {}", e);
                Vec::new()
            }
        }
    }

    /// Close this transport and adopt the configuration of `other`
    pub async fn copy_from(&self, other: &SerialTransport) {
        self.close().await;
        *self.shared.params.write() = other.params();
        self.shared.state.set_root(&other.root_directory());
    }

    /// A new, closed serial transport with the same configuration
    pub fn clone_config(&self) -> SerialTransport {
        Self::from_params(self.params(), self.root_directory())
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self.shared.params.read();
        f.debug_struct("SerialTransport")
            .field("port", &params.port)
            .field("baud_rate", &params.baud_rate)
            .field("open", &self.shared.is_open())
            .finish()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.shared.state.events.clear();
        self.shared.state.set_retry_open(false);
        self.shared.state.retry.abort();
        self.shared.release();
    }
}

impl SerialShared {
    fn source(&self) -> Source {
        Source::new(TransportKind::Serial, self.params.read().port.clone())
    }

    fn report(&self, status: Status, message: &str) {
        self.state.events.status(&self.source(), status, message);
    }

    fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    fn release(&self) -> bool {
        self.opened.store(false, Ordering::SeqCst);
        self.port.lock().take().is_some()
    }

    /// Drop the handle after an I/O error other than a timeout
    fn fail_io(&self, error: &io::Error) {
        if error.kind() != io::ErrorKind::TimedOut {
            self.release();
            self.state.set_send(false);
        }
    }

    async fn open(&self) -> bool {
        let _guard = self.io_lock.lock().await;
        if self.is_open() {
            return true;
        }

        let params = self.params.read().clone();
        let builder = match line_settings(&params) {
            Ok(builder) => builder,
            Err(e) => {
                self.report(Status::Error, &format!("Port Open Error : {}", e));
                return false;
            }
        };
        let opened = tokio::task::spawn_blocking(move || builder.open()).await;
        match opened {
            Ok(Ok(port)) => {
                *self.port.lock() = Some(port);
                self.opened.store(true, Ordering::SeqCst);
                self.state.set_retry_open(false);
                self.report(Status::Conform, &format!("Port Open Success : {}", params.port));
                self.save_parameter();
                true
            }
            Ok(Err(e)) => {
                let quiet = self.state.is_retry_open();
                self.state.set_retry_open(true);
                self.state
                    .attempt_status(&self.source(), quiet, Status::Error, &format!("Port Open Error : {}", e));
                false
            }
            Err(e) => {
                self.report(Status::Error, &format!("Port Open Error : {}", e));
                false
            }
        }
    }

    fn write_blocking(&self, payload: &[u8], timeout: Duration) -> io::Result<()> {
        let mut port = self.port.lock();
        let port = port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port is closed"))?;
        port.set_timeout(timeout)?;
        port.write_all(payload)?;
        port.flush()
    }

    fn read_blocking(&self, wait: Duration, timeout: Duration) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + wait;
        let mut port = self.port.lock();
        let port = port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port is closed"))?;
        port.set_timeout(timeout)?;
        drain_input(port, deadline)
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

/// Byte source drained by a receive
trait PendingInput: Read {
    /// Bytes the driver holds that a read would return without blocking
    fn pending(&mut self) -> io::Result<usize>;
}

impl PendingInput for Box<dyn SerialPort> {
    fn pending(&mut self) -> io::Result<usize> {
        Ok(self.bytes_to_read()? as usize)
    }
}

/// Collect buffered input, waiting until `deadline` for the first byte
///
/// Stops at [`BUFFER_SIZE`] bytes or at the deadline even while the line
/// keeps delivering.
fn drain_input<P: PendingInput + ?Sized>(input: &mut P, deadline: Instant) -> io::Result<Vec<u8>> {
    let mut collected = Vec::new();
    loop {
        let room = BUFFER_SIZE - collected.len();
        let pending = input.pending()?;
        if pending > 0 && room > 0 {
            let mut chunk = vec![0u8; pending.min(room)];
            let read = match input.read(&mut chunk) {
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => 0,
                Err(e) => return Err(e),
            };
            collected.extend_from_slice(&chunk[..read]);
            if read > 0 && collected.len() < BUFFER_SIZE && Instant::now() < deadline {
                continue;
            }
        }
        if !collected.is_empty() || Instant::now() >= deadline {
            return Ok(collected);
        }
        std::thread::sleep(RECEIVE_POLL);
    }
}

/// Builder for the configured line settings
fn line_settings(params: &SerialParams) -> CommResult<tokio_serial::SerialPortBuilder> {
    params.validate()?;
    let data_bits = match params.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        8 => tokio_serial::DataBits::Eight,
        other => return Err(CommError::Serial(format!("unsupported data bits: {}", other))),
    };
    let parity = match params.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    };
    let stop_bits = match params.stop_bits {
        StopBits::One => tokio_serial::StopBits::One,
        StopBits::Two => tokio_serial::StopBits::Two,
    };
    Ok(tokio_serial::new(params.port.clone(), params.baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .flow_control(tokio_serial::FlowControl::None)
        .timeout(params.read_timeout))
}

#[async_trait]
impl Reconnect for SerialShared {
    fn retry_noun(&self) -> &'static str {
        "Port Open"
    }

    fn is_usable(&self) -> bool {
        self.is_open()
    }

    fn retry_flag(&self) -> &AtomicBool {
        &self.state.retry_open
    }

    async fn try_once(&self) -> bool {
        self.open().await
    }

    fn report(&self, status: Status, message: &str) {
        SerialShared::report(self, status, message);
    }
}

#[async_trait]
impl CommLink for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn source(&self) -> Source {
        self.shared.source()
    }

    fn events(&self) -> &EventSink {
        &self.shared.state.events
    }

    fn port(&self) -> String {
        self.shared.params.read().port.clone()
    }

    fn set_port(&self, port: &str) -> CommResult<()> {
        let port = parse_serial_port(port)?;
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
        self.shared.is_open()
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
        self.shared.open().await
    }

    async fn close(&self) {
        let shared = &self.shared;
        shared.state.set_retry_open(false);
        shared.state.retry.suspend();
        shared.state.retry.stop().await;
        let _guard = shared.io_lock.lock().await;
        shared.report(Status::Info, "Close Port");
        shared.release();
        shared.state.set_send(false);
        shared.state.received.clear();
        shared.state.retry.resume();
    }

    /// Write `payload`, blocking up to the write timeout
    async fn send(&self, payload: &[u8]) -> bool {
        let shared = &self.shared;
        let _guard = shared.io_lock.lock().await;
        if !shared.is_open() {
            shared.report(Status::Error, "Send Failure : Connection Fail");
            return false;
        }
        let Some(me) = shared.me.upgrade() else {
            return false;
        };

        shared.state.set_send(false);
        let text = String::from_utf8_lossy(payload).into_owned();
        shared.report(Status::Send, &format!("Send Message : {}", text));
        let data = payload.to_vec();
        let timeout = shared.params.read().write_timeout;
        let result = tokio::task::spawn_blocking(move || me.write_blocking(&data, timeout)).await;
        match result {
            Ok(Ok(())) => {
                shared.state.set_send(true);
                shared.report(Status::Info, &format!("Send Success : {}", text));
                true
            }
            Ok(Err(e)) => {
                shared.fail_io(&e);
                shared.report(Status::Error, &format!("Send Failure : Port Error ({})", e));
                false
            }
            Err(e) => {
                shared.report(Status::Error, &format!("Send Failure : {}", e));
                false
            }
        }
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
        match self.shared.state.load_section::<SerialParams>(&source) {
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
