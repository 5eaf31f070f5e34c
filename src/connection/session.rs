//! Per-client session task
//!
//! One task per client multiplexes reads from the stream with writes queued
//! through `Client::send`. Reads are decoded and dispatched to the manager;
//! the task ends on EOF, on any transport error or when a close is requested,
//! and always finishes through `ConnectionManager::on_stream_end`.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, instrument};

use super::client::Mailbox;
use super::text::TextDecoder;
use super::{ClientHandle, ConnectionManager};

/// Upper bound on flushing queued text and the final notice when closing
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a session stopped, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Eof,
    ReadError,
    WriteError,
    Closed,
}

#[instrument(skip_all, fields(client = %client.id()))]
pub(crate) async fn run_session<S>(
    manager: ConnectionManager,
    client: ClientHandle,
    stream: S,
    mailbox: Mailbox,
    buffer_size: usize,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let Mailbox {
        mut outbound_rx,
        mut close_rx,
    } = mailbox;
    let (reader, mut writer) = tokio::io::split(stream);

    // Reads and writes progress independently, so a stalled write never
    // starves the reader and never delays a close request.
    let end = tokio::select! {
        end = read_loop(&manager, &client, reader, buffer_size) => end,
        end = write_loop(&client, &mut writer, &mut outbound_rx) => end,
        notice = close_requested(&mut close_rx) => {
            close_stream(&client, &mut writer, &mut outbound_rx, notice).await;
            SessionEnd::Closed
        }
    };

    // Stop accepting queued writes before the end path broadcasts
    outbound_rx.close();
    drop(writer);

    debug!(
        "Session for {} ended ({:?}) after {:?}",
        client.id(),
        end,
        client.connected_for()
    );
    manager.on_stream_end(&client);
}

async fn read_loop<S>(
    manager: &ConnectionManager,
    client: &ClientHandle,
    mut reader: ReadHalf<S>,
    buffer_size: usize,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite,
{
    let mut decoder = TextDecoder::new();
    let mut buffer = vec![0u8; buffer_size.max(1)];

    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                let tail = decoder.finish();
                if !tail.is_empty() {
                    manager.on_data(client, &tail);
                }
                return SessionEnd::Eof;
            }
            Ok(n) => {
                let text = decoder.decode(&buffer[..n]);
                if !text.is_empty() {
                    manager.on_data(client, &text);
                }
            }
            Err(e) => {
                // resets are routine when players drop off
                debug!("Read from {} failed: {}", client.id(), e);
                return SessionEnd::ReadError;
            }
        }
    }
}

async fn write_loop<S>(
    client: &ClientHandle,
    writer: &mut WriteHalf<S>,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite,
{
    while let Some(text) = outbound_rx.recv().await {
        if let Err(e) = write_text(writer, &text).await {
            debug!("Write to {} failed: {}", client.id(), e);
            return SessionEnd::WriteError;
        }
    }
    SessionEnd::Closed
}

/// Flush what is already queued plus the notice, then shut the stream down
///
/// The whole flush is bounded by `CLOSE_FLUSH_TIMEOUT`; the stream is closed
/// whatever happens to the writes.
async fn close_stream<S>(
    client: &ClientHandle,
    writer: &mut WriteHalf<S>,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    notice: Option<String>,
) where
    S: AsyncRead + AsyncWrite,
{
    let flush = async {
        while let Ok(text) = outbound_rx.try_recv() {
            write_text(writer, &text).await?;
        }
        if let Some(notice) = &notice {
            write_text(writer, notice).await?;
        }
        Ok::<_, std::io::Error>(())
    };

    match timeout(CLOSE_FLUSH_TIMEOUT, flush).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Final writes to {} failed: {}", client.id(), e),
        Err(_) => debug!("Final writes to {} stalled, closing anyway", client.id()),
    }

    match timeout(CLOSE_FLUSH_TIMEOUT, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Closing {} failed: {}", client.id(), e),
        Err(_) => debug!("Closing {} stalled, dropping the stream", client.id()),
    }
}

/// Resolves with the notice once a close is requested
async fn close_requested(close_rx: &mut oneshot::Receiver<Option<String>>) -> Option<String> {
    match close_rx.await {
        Ok(notice) => notice,
        // the sender lives as long as the client; never close on its drop
        Err(_) => std::future::pending().await,
    }
}

async fn write_text<W>(writer: &mut W, text: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await
}
