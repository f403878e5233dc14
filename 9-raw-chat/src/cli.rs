use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server, broadcasting every line to all connected peers.
    Server(ServerArgs),
    /// Connect to a server and relay the terminal to it.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:7007")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:7007")]
    pub server: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_addr;

    #[test]
    fn defaults_match_config_constants() {
        let cli = Cli::parse_from(["raw-chat", "server"]);
        match cli.command {
            Command::Server(args) => assert_eq!(args.listen, default_addr()),
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::parse_from(["raw-chat", "client"]);
        match cli.command {
            Command::Client(args) => assert_eq!(args.server, default_addr()),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn listen_address_can_be_overridden() {
        let cli = Cli::parse_from(["raw-chat", "server", "--listen", "127.0.0.1:0"]);
        match cli.command {
            Command::Server(args) => assert_eq!(args.listen.port(), 0),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
