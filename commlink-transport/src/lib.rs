//! Transport layer for commlink
//!
//! This crate provides three interchangeable channels behind the
//! [`CommLink`] contract: an outbound TCP client, a single-peer TCP server
//! and a serial line. The two TCP transports run a receive chain per
//! connection and recover from connection loss through a shared retry
//! engine; the serial transport is pull-based.

pub mod buffer;
pub mod client;
pub mod contract;
mod link;
pub mod retry;
pub mod serial;
pub mod server;
mod state;
pub mod transport;

pub use buffer::ReceiveBuffer;
pub use client::{ClientTransport, CONNECT_WAIT};
pub use contract::CommLink;
pub use link::BUFFER_SIZE;
pub use retry::{run_retry, Reconnect, RetryOutcome, RetryWorker};
pub use serial::SerialTransport;
pub use server::ServerTransport;
pub use transport::Transport;
