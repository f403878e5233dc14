//! Multi-client TCP chat over raw byte chunks.
//!
//! The server asks every connection for a name, then broadcasts each chunk a
//! peer sends, prefixed with that name, to every connected peer (the sender
//! included). There is no framing: one read on the server is one broadcast.
//!
//! - [`cli`] parses the command line for server and client modes.
//! - [`config`] holds the address, port, and protocol constants.
//! - [`registry`] tracks connected peers behind a single lock.
//! - [`hub`] owns the broadcast queue's consumer and fans messages out.
//! - [`session`] drives one connection from greeting to departure.
//! - [`server`] runs the accept loop and ties the pieces together.
//! - [`client`] relays a terminal to a server with two cancellable pumps.

pub mod cli;
pub mod client;
pub mod config;
pub mod hub;
pub mod registry;
pub mod server;
pub mod session;
