// Async client for the natter text pub/sub protocol.
//
// One TCP connection carries everything. Three kinds of tasks share it:
//
// - a parser loop that owns the read half and decodes server frames,
// - a flusher that turns bursts of buffered publishes into single flushes,
// - one dispatch task per subscription, running its handler sequentially.
//
// Writers from any task serialize on a single write lock so frames never
// interleave. The subscription registry and the request table use their own
// short-held locks and never block on the socket.
//
// There is no reconnect. When the read side fails, the client closes itself,
// drops its subscriptions, and fails pending requests; `Client::closed`
// reports why.
pub mod client;
pub mod config;
pub mod error;
mod wire;

pub use client::{Client, ConnectionState, Msg, Subscription};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use natter_wire::ServerInfo;
pub use tokio_util::sync::CancellationToken;
