use anyhow::{Context, Result};
use tokio::{
    io::{
        self, AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
        BufReader,
    },
    net::TcpStream,
    select,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    config::{CLIENT_QUIT_BANNER, READ_CHUNK_SIZE, SERVER_QUIT_BANNER},
};

/// Which side ended the session first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    ClientQuit,
    ServerQuit,
}

enum InputEvent {
    Line(Vec<u8>),
    Closed,
}

enum ServerEvent {
    Chunk(Vec<u8>),
    Closed,
}

pub async fn run(args: ClientArgs) -> Result<SessionEnd> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    run_session(stdin, &mut stdout, stream).await
}

/// Relays `input` lines to `stream` and `stream` bytes to `output` until either side ends.
///
/// Both pumps stop on the same cancellation and are joined before the
/// connection's write side is shut down.
pub async fn run_session<I, O, S>(input: I, mut output: O, stream: S) -> Result<SessionEnd>
where
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let token = CancellationToken::new();
    let (input_tx, input_rx) = mpsc::channel(1);
    let (server_tx, server_rx) = mpsc::channel(1);

    let ((), (), outcome) = tokio::join!(
        pump_input(input, input_tx, token.clone()),
        pump_server(reader, server_tx, token.clone()),
        relay(input_rx, server_rx, &mut writer, &mut output, token),
    );

    shutdown_connection(&mut writer).await;
    outcome
}

async fn pump_input<I>(mut input: I, events: mpsc::Sender<InputEvent>, token: CancellationToken)
where
    I: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let event = select! {
            _ = token.cancelled() => return,
            read = input.read_until(b'\n', &mut line) => match read {
                Ok(0) => InputEvent::Closed,
                Ok(_) => {
                    let text = strip_line_ending(&line);
                    if text.is_empty() {
                        continue;
                    }
                    InputEvent::Line(text.to_vec())
                }
                Err(error) => {
                    warn!(?error, "failed to read local input");
                    InputEvent::Closed
                }
            }
        };

        let closed = matches!(event, InputEvent::Closed);
        if !forward(&events, event, &token).await || closed {
            return;
        }
    }
}

async fn pump_server<R>(mut reader: R, events: mpsc::Sender<ServerEvent>, token: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let event = select! {
            _ = token.cancelled() => return,
            read = reader.read(&mut buf) => match read {
                Ok(0) => ServerEvent::Closed,
                Ok(n) => ServerEvent::Chunk(buf[..n].to_vec()),
                Err(error) => {
                    debug!(?error, "connection read failed");
                    ServerEvent::Closed
                }
            }
        };

        let closed = matches!(event, ServerEvent::Closed);
        if !forward(&events, event, &token).await || closed {
            return;
        }
    }
}

/// Returns `false` if the relay is gone or the session was cancelled first.
async fn forward<T>(events: &mpsc::Sender<T>, event: T, token: &CancellationToken) -> bool {
    select! {
        _ = token.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

async fn relay<W, O>(
    mut input_rx: mpsc::Receiver<InputEvent>,
    mut server_rx: mpsc::Receiver<ServerEvent>,
    writer: &mut W,
    output: &mut O,
    token: CancellationToken,
) -> Result<SessionEnd>
where
    W: AsyncWrite + Unpin,
    O: AsyncWrite + Unpin,
{
    // Whatever way this returns, both pumps are told to stop.
    let _stop_pumps = token.drop_guard();

    loop {
        select! {
            event = input_rx.recv() => match event {
                Some(InputEvent::Line(line)) => {
                    if let Err(error) = send_to_server(writer, &line).await {
                        warn!(?error, "failed to send line to server");
                    }
                }
                Some(InputEvent::Closed) | None => {
                    write_line(output, CLIENT_QUIT_BANNER.as_bytes())
                        .await
                        .context("failed to write to local output")?;
                    return Ok(SessionEnd::ClientQuit);
                }
            },
            event = server_rx.recv() => match event {
                Some(ServerEvent::Chunk(chunk)) => {
                    write_line(output, &chunk)
                        .await
                        .context("failed to write to local output")?;
                }
                Some(ServerEvent::Closed) | None => {
                    write_line(output, SERVER_QUIT_BANNER.as_bytes())
                        .await
                        .context("failed to write to local output")?;
                    return Ok(SessionEnd::ServerQuit);
                }
            },
        }
    }
}

/// Drops a trailing `\n` and the `\r` before it, if any.
fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

async fn send_to_server<W>(writer: &mut W, line: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line).await?;
    writer.flush().await
}

async fn write_line<O>(output: &mut O, bytes: &[u8]) -> io::Result<()>
where
    O: AsyncWrite + Unpin,
{
    output.write_all(bytes).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}

async fn shutdown_connection<W>(writer: &mut W)
where
    W: AsyncWrite + Unpin,
{
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}
