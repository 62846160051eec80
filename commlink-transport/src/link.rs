//! A live TCP connection and its receive chain
//!
//! Each accepted or connected socket is wrapped in a [`Link`] that runs three
//! tasks:
//!
//! - **reader**: owns the read half and keeps exactly one receive outstanding.
//!   Every receive gets a fresh [`BUFFER_SIZE`] buffer; the completed buffer is
//!   frozen and handed on, never reused. Results travel as [`LinkEvent`]s over
//!   a bounded channel, so chunks reach the handler in arrival order.
//! - **dispatcher**: the single consumer of that channel. It calls the
//!   [`LinkHandler`] for every event.
//! - **writer**: owns the write half and drains an outbound queue, so payloads
//!   accepted by `send` go out in the order they were accepted.
//!
//! Cancelling the link token stops all three tasks and drops both socket halves.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Size of the buffer armed for each receive
pub const BUFFER_SIZE: usize = 4096;

/// Capacity of the reader -> dispatcher event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the outbound payload queue
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Completion of one receive on a link
///
/// Internal to the receive chain; applications see completions only through
/// the status and data callbacks.
///
/// ```compile_fail
/// use commlink_transport::LinkEvent;
/// ```
#[derive(Debug)]
pub(crate) enum LinkEvent {
    /// A positive read, holding exactly the bytes of that read
    Received(Bytes),
    /// Zero-length read: the peer closed the connection
    Closed,
    /// The read failed; the socket is no longer trustworthy
    Error(String),
}

/// Receiver of link completions
///
/// Implemented by the transport that owns the link. The handler must check
/// that the link is still its current one before acting: completions of a
/// replaced or released link can still arrive.
pub(crate) trait LinkHandler: Send + Sync + 'static {
    fn on_received(&self, link: &Link, chunk: Bytes);

    /// `reason` is `None` for a peer close, `Some` for a read error
    fn on_closed(&self, link: &Link, reason: Option<String>);

    fn on_sent(&self, link: &Link, payload: &Bytes, result: io::Result<()>);
}

pub(crate) struct Link {
    id: u64,
    peer: SocketAddr,
    local: Option<SocketAddr>,
    alive: AtomicBool,
    cancel: CancellationToken,
    outbound: mpsc::Sender<Bytes>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Link {
    /// Wrap a connected stream and arm its first receive
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn<H: LinkHandler>(stream: TcpStream, peer: SocketAddr, handler: Arc<H>) -> Arc<Link> {
        let local = stream.local_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        let (read_half, write_half) = stream.into_split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);

        let link = Arc::new(Link {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            local,
            alive: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            outbound: outbound_tx,
            tasks: Mutex::new(Vec::with_capacity(3)),
        });

        let reader = tokio::spawn(Self::read_loop(link.clone(), read_half, event_tx));
        let dispatcher = tokio::spawn(Self::dispatch_loop(link.clone(), event_rx, handler.clone()));
        let writer = tokio::spawn(Self::write_loop(link.clone(), write_half, outbound_rx, handler));
        link.tasks.lock().extend([reader, dispatcher, writer]);

        log::debug!("Link {} established with {}", link.id, peer);
        link
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    /// `true` until the peer closes, an I/O error occurs or the link is shut down
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    /// Queue a payload for the writer task
    ///
    /// Returns `false` if the link is dead or its writer has stopped.
    pub(crate) async fn enqueue(&self, payload: Bytes) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.outbound.send(payload).await.is_ok()
    }

    /// Stop all link tasks; the socket closes once they exit
    pub(crate) fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Wait for the link tasks to exit
    ///
    /// Must not be called from one of this link's own tasks.
    pub(crate) async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    log::error!("Link {} task panicked: {}", self.id, e);
                }
            }
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.tasks.lock().iter().all(JoinHandle::is_finished)
    }

    async fn read_loop(link: Arc<Link>, mut reader: OwnedReadHalf, events: mpsc::Sender<LinkEvent>) {
        loop {
            let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
            let event = tokio::select! {
                _ = link.cancel.cancelled() => break,
                result = reader.read_buf(&mut buffer) => match result {
                    Ok(0) => LinkEvent::Closed,
                    Ok(_) => LinkEvent::Received(buffer.freeze()),
                    Err(e) => LinkEvent::Error(e.to_string()),
                },
            };
            let last = !matches!(event, LinkEvent::Received(_));
            if last {
                link.alive.store(false, Ordering::SeqCst);
            }
            if events.send(event).await.is_err() || last {
                break;
            }
        }
    }

    async fn dispatch_loop<H: LinkHandler>(link: Arc<Link>, mut events: mpsc::Receiver<LinkEvent>, handler: Arc<H>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = link.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                LinkEvent::Received(chunk) => handler.on_received(&link, chunk),
                LinkEvent::Closed => handler.on_closed(&link, None),
                LinkEvent::Error(reason) => handler.on_closed(&link, Some(reason)),
            }
        }
    }

    async fn write_loop<H: LinkHandler>(
        link: Arc<Link>,
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::Receiver<Bytes>,
        handler: Arc<H>,
    ) {
        loop {
            let payload = tokio::select! {
                _ = link.cancel.cancelled() => break,
                payload = outbound.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };
            let result = tokio::select! {
                _ = link.cancel.cancelled() => break,
                result = writer.write_all(&payload) => result,
            };
            if result.is_err() {
                link.alive.store(false, Ordering::SeqCst);
            }
            handler.on_sent(&link, &payload, result);
        }
        if let Err(e) = writer.shutdown().await {
            log::debug!("Link {} write shutdown: {}", link.id, e);
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Slot holding the single current link of a transport
///
/// Released and replaced links are kept until their tasks finish so that
/// `drain` can wait for every callback context to be gone.
#[derive(Debug, Default)]
pub(crate) struct LinkSlot {
    current: Mutex<Option<Arc<Link>>>,
    retired: Mutex<Vec<Arc<Link>>>,
}

impl LinkSlot {
    pub(crate) fn get(&self) -> Option<Arc<Link>> {
        self.current.lock().clone()
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.current.lock().as_ref().is_some_and(|link| link.is_alive())
    }

    pub(crate) fn is_current(&self, link: &Link) -> bool {
        self.current.lock().as_ref().is_some_and(|current| current.id() == link.id())
    }

    /// Install `link`, shutting down and returning the previous one
    pub(crate) fn replace(&self, link: Arc<Link>) -> Option<Arc<Link>> {
        let previous = self.current.lock().replace(link);
        if let Some(previous) = &previous {
            self.retire(previous.clone());
        }
        previous
    }

    /// Shut down and remove the current link; `true` if there was one
    pub(crate) fn release(&self) -> bool {
        let previous = self.current.lock().take();
        match previous {
            Some(link) => {
                self.retire(link);
                true
            }
            None => false,
        }
    }

    /// Release only if `link` is still the current one
    ///
    /// Exactly one caller wins for a given link, which keeps completion
    /// handling from acting twice on the same connection loss.
    pub(crate) fn release_if_current(&self, link: &Link) -> bool {
        let released = {
            let mut current = self.current.lock();
            match current.as_ref() {
                Some(existing) if existing.id() == link.id() => current.take(),
                _ => None,
            }
        };
        match released {
            Some(link) => {
                self.retire(link);
                true
            }
            None => false,
        }
    }

    /// Release the current link and wait for every retired link to stop
    pub(crate) async fn drain(&self) {
        self.release();
        let retired: Vec<Arc<Link>> = self.retired.lock().drain(..).collect();
        for link in retired {
            link.join().await;
        }
    }

    fn retire(&self, link: Arc<Link>) {
        link.shutdown();
        let mut retired = self.retired.lock();
        retired.retain(|old| !old.is_finished());
        retired.push(link);
    }
}
