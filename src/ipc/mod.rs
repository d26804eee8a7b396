//! JSON-RPC 2.0 IPC surface: client, shared protocol types, and the instance
//! socket server (§6).

pub mod client;
pub mod protocol;
pub mod server;
