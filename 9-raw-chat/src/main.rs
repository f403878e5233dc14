use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use raw_chat::{
    cli::{Cli, Command},
    client,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let result = runtime.block_on(run(cli));
    // A pending stdin read sits on a blocking thread that cannot be cancelled.
    runtime.shutdown_background();
    result
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Server(args) => {
            let listener = TcpListener::bind(args.listen)
                .await
                .with_context(|| format!("failed to listen on {}", args.listen))?;
            let server = Server::new(listener);
            let addr = server.local_addr()?;
            println!("Listening to connections on {addr}");
            info!(%addr, "server listening");
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => {
            let end = client::run(args).await?;
            info!(?end, "session ended");
        }
    }

    Ok(())
}
