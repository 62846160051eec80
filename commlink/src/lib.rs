//! commlink - interchangeable transports for factory equipment links
//!
//! This library provides three communication channels behind one contract:
//! an outbound TCP client, a single-peer TCP server and a serial line. Each
//! reports its lifecycle through a status callback, delivers received bytes
//! through a data callback, persists its parameters under a root directory
//! and recovers from connection loss through a bounded retry engine.
//!
//! # Architecture
//!
//! This library is organized as a workspace with multiple crates:
//!
//! - `commlink-core`: Error type, validation, parameters and their persistence, events
//! - `commlink-transport`: Transport contract, TCP client/server, serial line, retry engine
//!
//! # Implementation Status
//!
//! ## ✅ 已完成
//! - 传输层（TCP 客户端、单连接 TCP 服务端、串口）
//! - 重连/重监听引擎（次数上限、超时、可取消）
//! - 参数持久化（JSON）与已知对端列表
//!
//! # Usage
//!
//! ```no_run
//! use commlink::{ClientTransport, CommLink, Status};
//!
//! # async fn run() {
//! let client = ClientTransport::new();
//! client.on_status(|source, status, message| {
//!     if status == Status::Error {
//!         eprintln!("{}: {}", source, message);
//!     }
//! });
//! client.on_data(|_, payload| println!("{}", String::from_utf8_lossy(payload)));
//!
//! if client.open_with_retry().await {
//!     client.send_str("PING").await;
//! }
//! client.close().await;
//! # }
//! ```

// Re-export core types
pub use commlink_core::{
    ClientParams, CommError, CommResult, KnownPeers, ParameterStore, Parity, RetryPolicy, SerialParams,
    ServerParams, Source, Status, StopBits, TransportKind,
};

// Re-export the transports
pub use commlink_transport::{ClientTransport, CommLink, SerialTransport, ServerTransport, Transport};

// Re-export validation helpers
pub mod validate {
    pub use commlink_core::fs::{verify_directory, verify_file_path};
    pub use commlink_core::validate::*;
}

// Re-export retry engine
pub mod retry {
    pub use commlink_transport::retry::*;
}
