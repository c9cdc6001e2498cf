pub mod api;
pub mod app;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod coordination;
pub mod event;
pub mod gnmi;
pub mod http;
pub mod loaders;
pub mod outputs;
pub mod pipeline;
pub mod shutdown;
pub mod targets;
pub mod tls;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

#[macro_use]
extern crate tracing;

/// Basic error type, dynamically dispatched and safe to send across threads.
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Basic result type, defined in terms of [`Error`] and generic over `T`.
pub type Result<T> = std::result::Result<T, Error>;

pub fn hostname() -> std::io::Result<String> {
    Ok(::hostname::get()?.to_string_lossy().into())
}

pub fn get_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
