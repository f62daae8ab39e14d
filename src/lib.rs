//! Bidirectional JSON-RPC over arbitrary byte streams.
//!
//! A [`Client`] issues calls and correlates their replies; a [`Server`]
//! decodes calls and writes replies. Both are built from the same reading and
//! writing pumps, each backed by bounded queues and a timeout-bounded stop.

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod reader;
pub mod server;
pub mod types;
pub mod value;
pub mod writer;

mod engine;

// 公開API
pub use client::{Client, ClientState};
pub use config::{ClientConfig, PumpConfig, ServerConfig};
pub use error::{RpcError, RpcResult};
pub use handler::CallHandler;
pub use lifecycle::{Lifecycle, PumpState};
pub use reader::MessageReader;
pub use server::Server;
pub use types::{ErrorCode, ErrorObject, Request, Response, WireMessage};
pub use value::{Number, Value};
pub use writer::{MessageWriter, WriteQueue};
