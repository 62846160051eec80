//! Transport contract shared by every channel

use async_trait::async_trait;
use bytes::Bytes;
use commlink_core::{CommResult, EventSink, Source, Status, TransportKind};
use std::path::{Path, PathBuf};

/// Uniform interface of the client, server and serial transports
///
/// Lifecycle operations never return an error to the caller. Failures are
/// reported through the status callback and summarized as a `bool`; only the
/// configuration setters return [`CommResult`], and they leave the transport
/// untouched when they fail.
///
/// All methods take `&self`: the application task, the link completion tasks
/// and the retry task may act on the same transport concurrently, and every
/// operation re-checks liveness instead of trusting an earlier snapshot.
#[async_trait]
pub trait CommLink: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Kind plus the configured endpoint, as passed to the callbacks
    fn source(&self) -> Source;

    fn events(&self) -> &EventSink;

    /// Install the status callback `(source, severity, message)`
    fn on_status<F>(&self, callback: F)
    where
        F: Fn(&Source, Status, &str) + Send + Sync + 'static,
        Self: Sized,
    {
        self.events().set_status_callback(callback);
    }

    /// Install the data callback, invoked once per received chunk
    fn on_data<F>(&self, callback: F)
    where
        F: Fn(&Source, &[u8]) + Send + Sync + 'static,
        Self: Sized,
    {
        self.events().set_data_callback(callback);
    }

    /// Port number (TCP) or device name (serial)
    fn port(&self) -> String;

    /// Change the port used by the next `open`
    fn set_port(&self, port: &str) -> CommResult<()>;

    fn root_directory(&self) -> PathBuf;

    /// Change the directory parameters are persisted under
    fn set_root_directory(&self, root: &Path) -> bool;

    fn is_connected(&self) -> bool;

    /// `true` only if the last send completed on a still-live handle
    fn is_send(&self) -> bool;

    /// `true` while connectivity is wanted back (set by a failed open)
    fn is_retry_open(&self) -> bool;

    /// `true` while a retry task is alive
    fn is_retrying(&self) -> bool;

    /// Everything received since the accumulator was last drained, as text
    fn receive_message(&self) -> String;

    /// Drain the receive accumulator
    fn take_received(&self) -> Bytes;

    fn clear_received(&self);

    /// Try once to make the handle usable; never starts retrying by itself
    async fn open(&self) -> bool;

    /// Stop retrying and release the handle; safe to call repeatedly
    async fn close(&self);

    /// Accept `payload` for transmission
    async fn send(&self, payload: &[u8]) -> bool;

    async fn send_str(&self, text: &str) -> bool {
        self.send(text.as_bytes()).await
    }

    /// Start the retry task if the policy allows and none is alive
    fn start_retry(&self) -> bool;

    /// Cancel the retry task and wait for it to exit
    async fn stop_retry(&self);

    /// `open`, falling back to the retry task when it fails
    async fn open_with_retry(&self) -> bool {
        if self.open().await {
            return true;
        }
        self.start_retry();
        false
    }

    /// Reload parameters from the root directory
    fn load_parameter(&self) -> bool;

    /// Persist the current parameters under the root directory
    fn save_parameter(&self) -> bool;
}
