//! IPC server for the local control plane.
//!
//! Listens on a Unix socket, one task per connection, length-prefixed
//! JSON frames. A `SubscribeToComponentUpdates` request switches the
//! connection into streaming mode: pre-update events flow out, deferral
//! votes flow in, until the peer disconnects.

use std::path::Path;

use anyhow::{Context, Result};
use outpost_core::ipc::{
    frame_message, parse_frame_length, IpcRequest, IpcResponse, MAX_FRAME_SIZE,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::handlers::dispatch;
use crate::orchestrator::DeploymentQueue;
use crate::state::SharedState;

/// Run the IPC server until shutdown is requested.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound.
pub async fn run(socket_path: &Path, state: SharedState, queue: DeploymentQueue) -> Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create socket directory")?;
    }

    let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;
    info!("IPC server listening on {:?}", socket_path);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let state = state.clone();
                        let queue = queue.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, state, queue).await {
                                debug!("connection handler error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {e}");
                    }
                }
            }

            () = wait_for_shutdown(&state) => {
                info!("IPC server shutting down");
                break;
            }
        }
    }

    if socket_path.exists() {
        let _ = std::fs::remove_file(socket_path);
    }
    Ok(())
}

async fn wait_for_shutdown(state: &SharedState) {
    loop {
        if state.is_shutdown_requested() {
            return;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    state: SharedState,
    queue: DeploymentQueue,
) -> Result<()> {
    debug!("new IPC connection");

    loop {
        let request = match read_request(&mut stream).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!("IPC connection closed");
                break;
            },
            Err(e) => {
                warn!("failed to read request: {e}");
                break;
            },
        };

        if matches!(request, IpcRequest::SubscribeToComponentUpdates) {
            send_response(&mut stream, &IpcResponse::Subscribed).await?;
            return stream_component_updates(stream, state).await;
        }

        let response = dispatch(request, &state, &queue).await;
        if let Err(e) = send_response(&mut stream, &response).await {
            warn!("failed to send response: {e}");
            break;
        }
    }

    Ok(())
}

/// Streaming mode: push pre-update events, accept deferral votes.
async fn stream_component_updates(stream: UnixStream, state: SharedState) -> Result<()> {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut events = state.notifier.subscribe();
    let votes = state.notifier.deferral_sender();
    debug!("connection subscribed to component updates");

    // votes arrive on their own task so a partially-read frame is never
    // torn by event traffic
    let mut reader = tokio::spawn(async move {
        loop {
            match read_request(&mut read_half).await {
                Ok(Some(IpcRequest::DeferComponentUpdate(vote))) => {
                    let _ = votes.send(vote);
                },
                Ok(Some(other)) => {
                    debug!(?other, "non-deferral request on subscribed connection ignored");
                },
                Ok(None) | Err(_) => break,
            }
        }
    });

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        send_response(&mut write_half, &IpcResponse::ComponentUpdateEvent(event))
                            .await?;
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "subscriber lagged behind update events");
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = &mut reader => {
                break;
            }
        }
    }

    reader.abort();
    debug!("subscription connection closed");
    Ok(())
}

async fn read_request<R>(stream: &mut R) -> Result<Option<IpcRequest>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {},
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        },
        Err(e) => return Err(e.into()),
    }

    let len = parse_frame_length(&len_buf)
        .with_context(|| format!("invalid frame length (max {MAX_FRAME_SIZE})"))?;

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;

    let request: IpcRequest =
        serde_json::from_slice(&payload).context("failed to parse request")?;
    Ok(Some(request))
}

async fn send_response<W>(stream: &mut W, response: &IpcResponse) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let json = serde_json::to_vec(response).context("failed to serialize response")?;
    let framed = frame_message(&json);
    stream.write_all(&framed).await?;
    stream.flush().await?;
    Ok(())
}
