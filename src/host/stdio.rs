//! Newline-delimited JSON bridge for the host command channel.
//!
//! Reads `CommandEnvelope` lines from stdin, dispatches them through the
//! [`HostCommandServer`](crate::host::channel::HostCommandServer), and writes
//! `ResponseEnvelope` and `EventEnvelope` lines to stdout.
//!
//! Stdout is exclusively reserved for the JSON protocol; all diagnostic
//! output (tracing, logs) must be routed to stderr.

use crate::error::{Result, UpdaterError};
use crate::host::channel::{HostCommandClient, command_channel};
use crate::host::contract::{CommandEnvelope, EventEnvelope, ResponseEnvelope};
use crate::update::state::UpdateStateMachine;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{Mutex, mpsc};

/// Default request channel capacity for the stdio bridge.
const REQUEST_CAPACITY: usize = 64;

type SharedWriter<W> = Arc<Mutex<BufWriter<W>>>;

/// Run the bridge on the process's stdin and stdout until stdin closes.
///
/// # Errors
///
/// Returns [`UpdaterError::Channel`] if stdin or stdout fails.
pub async fn run_stdio_bridge(machine: Arc<UpdateStateMachine>) -> Result<()> {
    run_bridge(machine, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Run the bridge over arbitrary line-oriented streams.
///
/// Commands are dispatched concurrently, so responses may be written in a
/// different order than their requests; match them by `request_id`.
///
/// # Errors
///
/// Returns [`UpdaterError::Channel`] if reading or writing fails.
pub async fn run_bridge<R, W>(machine: Arc<UpdateStateMachine>, input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (client, server) = command_channel(REQUEST_CAPACITY, machine);
    let writer = Arc::new(Mutex::new(BufWriter::new(output)));

    let server_handle = tokio::spawn(server.run());
    let event_handle = tokio::spawn(forward_events(
        client.subscribe_events(),
        Arc::clone(&writer),
    ));

    let reader_result = run_reader(client, input, Arc::clone(&writer)).await;

    // Dropping the client in `run_reader` closes the request channel, which
    // ends the server loop.
    let _ = server_handle.await;
    event_handle.abort();
    let _ = event_handle.await;

    reader_result
}

/// Write every event in order. A blocked stdout delays events; it never
/// drops them.
async fn forward_events<W>(
    mut event_rx: mpsc::UnboundedReceiver<EventEnvelope>,
    writer: SharedWriter<W>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(event) = event_rx.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => {
                let mut w = writer.lock().await;
                if let Err(e) = write_line(&mut w, &json).await {
                    tracing::warn!(
                        error = %e,
                        "failed to write event envelope; stopping event forwarder"
                    );
                    break;
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize event envelope; skipping"),
        }
    }
    tracing::info!("event channel closed; stopping event forwarder");
}

/// Read lines, dispatch each command on its own task, and write responses.
async fn run_reader<R, W>(client: HostCommandClient, input: R, writer: SharedWriter<W>) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(input);
    let mut line = String::new();
    let mut in_flight = tokio::task::JoinSet::new();

    loop {
        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| UpdaterError::Channel(format!("failed to read command: {e}")))?;
        if bytes_read == 0 {
            tracing::info!("input closed (EOF); shutting down bridge");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let envelope: CommandEnvelope = match serde_json::from_str(trimmed) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %e, raw_line = %trimmed, "failed to parse command envelope");
                let response = ResponseEnvelope::error(
                    "parse-error",
                    format!("failed to parse command envelope: {e}"),
                );
                write_response(&writer, &response).await?;
                continue;
            }
        };

        // `install_update` may run for minutes; keep reading meanwhile.
        let client = client.clone();
        let writer = Arc::clone(&writer);
        in_flight.spawn(async move {
            let request_id = envelope.request_id.clone();
            let response = client.send(envelope).await.unwrap_or_else(|e| {
                tracing::error!(error = %e, "host command dispatch failed");
                ResponseEnvelope::error(request_id, format!("dispatch failed: {e}"))
            });
            write_response(&writer, &response).await
        });
    }

    drop(client);
    while let Some(joined) = in_flight.join_next().await {
        match joined {
            Ok(written) => written?,
            Err(e) => tracing::warn!(error = %e, "command task failed"),
        }
    }
    Ok(())
}

async fn write_response<W>(writer: &SharedWriter<W>, response: &ResponseEnvelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(response)
        .map_err(|e| UpdaterError::Channel(format!("failed to serialize response envelope: {e}")))?;
    let mut w = writer.lock().await;
    write_line(&mut w, &json).await
}

/// Write a single JSON line and flush.
async fn write_line<W>(writer: &mut BufWriter<W>, json: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| UpdaterError::Channel(format!("failed to write output: {e}")))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| UpdaterError::Channel(format!("failed to write newline: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| UpdaterError::Channel(format!("failed to flush output: {e}")))?;
    Ok(())
}
