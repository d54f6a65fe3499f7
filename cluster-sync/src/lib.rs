//! Versioned object replication and command dispatch for a render cluster.
//!
//! One master process owns each shared object; slave processes on other nodes
//! mirror it. Local changes are committed on the master, which streams a delta
//! (or, for new subscribers, the full instance data) to every subscribed node.
//! Everything that crosses a thread boundary travels as a [`command::Command`]
//! pushed onto a [`command::CommandQueue`] owned by exactly one consumer thread.
//!
//! # Threads
//!
//! - **Receiver**: multiplexes all peer connections, decodes packets and routes
//!   them to the queue registered for their command kind
//! - **Command thread**: owns the [`session::Session`] and runs its handlers
//! - **Main thread**: owns the [`client::Client`] queue (exit, interrupt, app
//!   commands)
//! - **Application threads**: call into the session through a
//!   [`session::SessionHandle`]
//!
//! # Modules
//!
//! - [`types`]: identifiers and version sentinels
//! - [`connection`]: connection descriptions, framing and outbound links
//! - [`packet`]: the wire packet
//! - [`command`]: command envelope, queue, routing and dispatch
//! - [`request`]: request ids with pending completions
//! - [`node`]: peer lifecycle and the node table
//! - [`object`]: replicated objects and their change managers
//! - [`session`]: object registration and the subscription protocol
//! - [`network`]: listener, launcher, handshake and receiver loop
//! - [`client`]: process entry point and main-thread command loop
//! - [`config`]: cluster configuration
//! - [`cli`]: command-line interface of the `cluster-sync` binary

pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod network;
pub mod node;
pub mod object;
pub mod packet;
pub mod request;
pub mod session;
pub mod types;

pub use error::{Error, Result};
