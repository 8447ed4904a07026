//! Daemon client over the control-plane Unix socket.
//!
//! Stateless per request: connect, send one length-prefixed JSON frame,
//! read one frame back, close. Timeouts guard both directions.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use outpost_core::ipc::{
    frame_message, parse_frame_length, ErrorCode, IpcRequest, IpcResponse, MAX_FRAME_SIZE,
};

/// Default connection and I/O timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Errors from daemon communication.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Daemon is not running (socket missing or refusing).
    #[error("daemon is not running (socket unavailable)")]
    DaemonNotRunning,

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(std::io::Error),

    /// Frame exceeded the protocol cap.
    #[error("frame too large (max {MAX_FRAME_SIZE} bytes)")]
    FrameTooLarge,

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The daemon answered with an error response.
    #[error("daemon error ({code:?}): {message}")]
    Daemon {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },

    /// The daemon answered with an unexpected response variant.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
        ) {
            Self::DaemonNotRunning
        } else {
            Self::Io(err)
        }
    }
}

/// Stateless daemon client.
pub struct DaemonClient<'a> {
    socket_path: &'a Path,
    timeout: Duration,
}

impl<'a> DaemonClient<'a> {
    /// Create a client against a socket path.
    #[must_use]
    pub const fn new(socket_path: &'a Path) -> Self {
        Self {
            socket_path,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Send one request and read one response.
    ///
    /// # Errors
    ///
    /// [`ClientError`] on connection, framing or protocol failures. An
    /// [`IpcResponse::Error`] from the daemon becomes
    /// [`ClientError::Daemon`].
    pub fn call(&self, request: &IpcRequest) -> Result<IpcResponse, ClientError> {
        let mut stream = UnixStream::connect(self.socket_path)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let payload = serde_json::to_vec(request)?;
        stream.write_all(&frame_message(&payload))?;
        stream.flush()?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf)?;
        let len = parse_frame_length(&len_buf).ok_or(ClientError::FrameTooLarge)?;

        let mut body = vec![0u8; len];
        stream.read_exact(&mut body)?;
        let response: IpcResponse = serde_json::from_slice(&body)?;

        match response {
            IpcResponse::Error { code, message } => Err(ClientError::Daemon { code, message }),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_socket_reports_daemon_not_running() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("absent.sock");
        let client = DaemonClient::new(&socket);
        let result = client.call(&IpcRequest::ListComponents);
        assert!(matches!(result, Err(ClientError::DaemonNotRunning)));
    }
}
