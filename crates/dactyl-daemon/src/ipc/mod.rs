//! IPC between the daemon and its clients
//!
//! Line-delimited JSON over a unix domain socket. Clients send
//! id-tagged requests; the server answers with id-tagged replies and
//! pushes unsolicited device signals on the same connection.

pub mod client;
pub mod connection;
pub mod server;
pub mod types;
pub mod unix;

pub use client::IpcClient;
pub use server::IpcServer;
pub use types::{ClientEnvelope, IpcRequest, IpcResponse, ServerEnvelope, SignalBody};
