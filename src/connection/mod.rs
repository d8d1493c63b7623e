//! Namespaced session against the coordination store: retryable CRUD,
//! modification-index tracking, and subtree bootstrap via [`Connection::tree`].

mod connection;

pub use connection::*;

#[cfg(test)]
mod connection_test;
