#[macro_use]
extern crate tracing;

pub mod actions;
pub mod collector;
pub mod condition;
pub mod config;
pub mod event;
pub mod format;
pub mod http;
pub mod outputs;
pub mod processors;
pub mod proto;
pub mod stats;
pub mod target;
pub mod tls;
pub mod trace;
pub mod value;
pub mod xpath;

/// The crate's basic error type, dynamically dispatched and safe to send
/// across threads.
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The crate's basic result type, defined in terms of [`Error`] and generic
/// over `T`.
pub type Result<T> = std::result::Result<T, Error>;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
