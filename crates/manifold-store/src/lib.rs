//! A single-value data store for shell pipelines.
//!
//! The store consumes a stream of records on standard input, retains the
//! most recent record (or a configured window of records), and serves it
//! on demand to concurrent clients over a unix stream socket. One
//! single-threaded event loop does all the work: a buffer queue holds the
//! live working set, a record locator tracks the response span after every
//! read, and buffers are reclaimed the moment no record and no in-flight
//! response still needs them.
//!
//! The `manifold-store` binary wires the loop to the process's standard
//! input; the library surface exists so tests (and other front ends) can
//! run a [`Server`] against any descriptor and talk to it with
//! [`StoreClient`].

pub mod buffer;
pub mod client;
pub mod config;
pub mod cursor;
mod error;
pub mod fetch;
pub mod record;
pub mod server;

#[cfg(test)]
mod proptests;

pub use client::MAX_CLIENTS;
pub use config::{Config, Framing, Window, DEFAULT_BUFFER_CAPACITY};
pub use error::StoreError;
pub use fetch::StoreClient;
pub use server::{Exit, Server, CONTENT_LENGTH_DIGITS};
