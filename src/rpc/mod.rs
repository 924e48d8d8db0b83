//! RPC client and server.
//!
//! Requests and responses are `{method, content, err}` envelopes exchanged
//! strictly in turn on each connection: a request's response arrives before
//! the next request is sent.
//!
//! ## Architecture
//!
//! - `protocol`: the message envelope and raw payloads
//! - `codec`: pluggable framing, with newline-delimited JSON as the default
//! - `connection`: client connection with plain and timeout-bounded calls
//! - `pool`: bounded cache of idle client connections
//! - `registry`: service registration and request dispatch
//! - `server`: TCP accept loop and per-connection serve loop

mod codec;
mod connection;
mod pool;
mod protocol;
mod registry;
mod server;

pub use codec::{Codec, CodecFactory, JsonCodec, JsonCodecFactory};
pub use connection::Connection;
pub use pool::{BoxFuture, ChanPool, Factory, PoolBuilder, tcp_factory};
pub use protocol::{Message, RawPayload};
pub use registry::{DispatchError, MethodInfo, MethodSet, Registry, Service};
pub use server::Server;
