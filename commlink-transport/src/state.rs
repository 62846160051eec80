//! State every transport carries besides its handle and parameters

use crate::buffer::ReceiveBuffer;
use crate::retry::RetryWorker;
use commlink_core::fs::verify_directory;
use commlink_core::{EventSink, ParameterSection, ParameterStore, Source, Status};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub(crate) struct TransportState {
    pub(crate) events: EventSink,
    pub(crate) received: ReceiveBuffer,
    pub(crate) retry: RetryWorker,
    /// Set after a completed write, cleared when a new send starts
    pub(crate) is_send: AtomicBool,
    /// The "retry still wanted" flag read by the retry loop
    pub(crate) retry_open: AtomicBool,
    root: RwLock<PathBuf>,
}

impl TransportState {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self {
            events: EventSink::new(),
            received: ReceiveBuffer::new(),
            retry: RetryWorker::new(),
            is_send: AtomicBool::new(false),
            retry_open: AtomicBool::new(false),
            root: RwLock::new(root),
        }
    }

    pub(crate) fn root(&self) -> PathBuf {
        self.root.read().clone()
    }

    /// Switch the configuration root; refused if the directory cannot be created
    pub(crate) fn set_root(&self, root: &Path) -> bool {
        if !verify_directory(root) {
            return false;
        }
        *self.root.write() = root.to_path_buf();
        true
    }

    pub(crate) fn store(&self) -> ParameterStore {
        ParameterStore::new(self.root())
    }

    pub(crate) fn is_send(&self) -> bool {
        self.is_send.load(Ordering::SeqCst)
    }

    pub(crate) fn is_retry_open(&self) -> bool {
        self.retry_open.load(Ordering::SeqCst)
    }

    pub(crate) fn set_retry_open(&self, value: bool) {
        self.retry_open.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_send(&self, value: bool) {
        self.is_send.store(value, Ordering::SeqCst);
    }

    /// Report an open attempt or its failure
    ///
    /// While the retry flag is set the retry loop reports progress itself, so
    /// the per-attempt events only go to the log.
    pub(crate) fn attempt_status(&self, source: &Source, quiet: bool, status: Status, message: &str) {
        if quiet {
            log::debug!("[{}] {}", source, message);
        } else {
            self.events.status(source, status, message);
        }
    }

    /// Load a parameter section, reporting failure as a status event
    pub(crate) fn load_section<S: ParameterSection>(&self, source: &Source) -> Option<S> {
        match self.store().load::<S>() {
            Ok(section) => Some(section),
            Err(e) => {
                self.events
                    .status(source, Status::Error, &format!("Parameter Load Failure : {}", e));
                None
            }
        }
    }

    /// Save a parameter section, reporting failure as a status event
    pub(crate) fn save_section<S: ParameterSection>(&self, source: &Source, section: &S) -> bool {
        match self.store().save(section) {
            Ok(()) => true,
            Err(e) => {
                self.events
                    .status(source, Status::Error, &format!("Parameter Save Failure : {}", e));
                false
            }
        }
    }
}
