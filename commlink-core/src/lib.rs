//! Core types and utilities for commlink
//!
//! This crate provides the pieces shared by every transport: the error
//! type, endpoint validation, parameter value objects and their persistence,
//! the server's known-peer set, and the status/data event channels.

pub mod error;
pub mod event;
pub mod fs;
pub mod params;
pub mod peers;
pub mod store;
pub mod validate;

pub use error::{CommError, CommResult};
pub use event::{DataCallback, EventSink, Source, Status, StatusCallback, TransportKind};
pub use params::{
    ClientParams, ParameterSection, Parity, RetryPolicy, SerialParams, ServerParams, StopBits,
};
pub use peers::KnownPeers;
pub use store::ParameterStore;
pub use validate::{
    parse_ip_address, parse_serial_port, parse_tcp_port, verify_ip_address, verify_serial_port,
    verify_tcp_port,
};
