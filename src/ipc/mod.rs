//! Local request surface: a Unix domain socket carrying length-prefixed
//! JSON frames between the CLI and the daemon.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use protocol::{Request, Response};
