//! Process-wide constants shared by the server and the client.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Host the server binds to and the client dials when no address is given.
pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

pub const DEFAULT_PORT: u16 = 7007;

/// Upper bound on the bytes taken from a socket by a single read.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Written to every new connection before its display name is read. No newline.
pub const NAME_PROMPT: &[u8] = b"Name: ";

/// Placed between the display name and the payload of every broadcast.
pub const NAME_SEPARATOR: &[u8] = b": ";

pub const CLIENT_QUIT_BANNER: &str = "client quit";
pub const SERVER_QUIT_BANNER: &str = "server quit";

pub fn default_addr() -> SocketAddr {
    SocketAddr::new(DEFAULT_HOST, DEFAULT_PORT)
}
