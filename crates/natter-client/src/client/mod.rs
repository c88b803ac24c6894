// Client-side modules for connection writes, subscriptions, and requests.
#![allow(clippy::module_inception)]
pub mod client;
pub(crate) mod connection;
pub(crate) mod request;
pub mod subscription;

pub use self::client::{Client, ConnectionState};
pub use self::subscription::{Msg, Subscription};
