//! A live, typed, in-memory mirror of a subtree in a hierarchical
//! coordination store.
//!
//! [`Connection`] namespaces keys under a configured root and retries
//! transient connection failures with a bounded policy. [`Connection::tree`]
//! materializes a subtree into [`MirrorNode`]s and spawns a [`TreeWatcher`]
//! that applies watch events in index order, giving [`Tree::sync`] its
//! wait-until-caught-up guarantee. A [`TypeRegistry`] maps path patterns
//! (`*` and `**` wildcards) to node factories so selected values mirror as
//! parsed types instead of raw strings.

mod config;
mod connection;
mod constants;
mod errors;
mod store;
mod tree;

pub use config::*;
pub use connection::*;
pub use constants::*;
pub use errors::*;
pub use store::*;
pub use tree::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
