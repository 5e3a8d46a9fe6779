//! TCP relay implementation.
//!
//! Establishes the remote leg for an accepted local connection, directly or
//! through an HTTP CONNECT proxy, and copies bytes in both directions.
//!
//! A session ends as soon as either direction finishes. Both sockets are
//! closed at that point, so a peer that only half-closes its write side
//! loses whatever the other side still had in flight.

use crate::proxy::connect::{dial_through_proxy, ProxyDialError};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Buffer size for each copy direction.
const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Where the remote leg of a session goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Final destination in `host:port` form.
    pub address: String,
    /// Optional HTTP CONNECT proxy URL.
    pub proxy: Option<String>,
    /// Bound on establishing the remote leg.
    pub connect_timeout: Duration,
}

impl RemoteTarget {
    /// Target reached with a direct TCP connect.
    pub fn direct(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            proxy: None,
            connect_timeout,
        }
    }

    /// Target reached through an HTTP CONNECT proxy.
    pub fn via_proxy(
        address: impl Into<String>,
        proxy: impl Into<String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            address: address.into(),
            proxy: Some(proxy.into()),
            connect_timeout,
        }
    }
}

/// Copy direction within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local client to remote target.
    ToRemote,
    /// Remote target to local client.
    ToLocal,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToRemote => f.write_str("to_remote"),
            Direction::ToLocal => f.write_str("to_local"),
        }
    }
}

/// Result of a relay once the session has ended.
#[derive(Debug)]
pub struct RelayOutcome {
    /// Bytes written to the remote side.
    pub bytes_to_remote: u64,
    /// Bytes written to the local side.
    pub bytes_to_local: u64,
    /// The direction whose completion ended the session.
    pub finished_first: Direction,
    /// Error that ended the session; `None` on a clean end-of-stream.
    pub error: Option<io::Error>,
}

/// Relay error.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to connect to remote {0}: {1}")]
    RemoteConnectError(String, io::Error),

    #[error("connection timeout to remote {0}")]
    RemoteTimeout(String),

    #[error("proxy error: {0}")]
    ProxyError(#[from] ProxyDialError),
}

/// Establish the remote leg for `target`.
#[instrument(skip_all, fields(remote = %target.address))]
pub async fn connect_remote(target: &RemoteTarget) -> Result<TcpStream, RelayError> {
    let stream = match target.proxy.as_deref().filter(|p| !p.is_empty()) {
        Some(proxy_url) => {
            debug!(proxy = %proxy_url, "connecting to remote through proxy");
            dial_through_proxy(&target.address, proxy_url, target.connect_timeout).await?
        }
        None => {
            debug!("connecting to remote");
            match timeout(
                target.connect_timeout,
                TcpStream::connect(target.address.as_str()),
            )
            .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(RelayError::RemoteConnectError(target.address.clone(), e));
                }
                Err(_) => return Err(RelayError::RemoteTimeout(target.address.clone())),
            }
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "failed to set TCP_NODELAY on remote connection");
    }

    Ok(stream)
}

/// Copy from `reader` to `writer` until end-of-stream, counting bytes written.
async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, written: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *written += n as u64;
    }
}

/// Relay bytes between `local` and `remote` until either direction finishes.
///
/// Both streams are consumed and dropped (closed) before this returns,
/// whichever direction completed first.
pub async fn relay_until_first_close<L, R>(local: L, remote: R) -> RelayOutcome
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let mut bytes_to_remote = 0u64;
    let mut bytes_to_local = 0u64;

    let (finished_first, result) = tokio::select! {
        r = copy_counted(&mut local_read, &mut remote_write, &mut bytes_to_remote) => {
            (Direction::ToRemote, r)
        }
        r = copy_counted(&mut remote_read, &mut local_write, &mut bytes_to_local) => {
            (Direction::ToLocal, r)
        }
    };

    drop((local_read, local_write));
    drop((remote_read, remote_write));

    debug!(
        bytes_to_remote = bytes_to_remote,
        bytes_to_local = bytes_to_local,
        finished_first = %finished_first,
        "relay completed"
    );

    RelayOutcome {
        bytes_to_remote,
        bytes_to_local,
        finished_first,
        error: result.err(),
    }
}

/// Handle a complete relay session for one accepted connection.
///
/// Connects to the remote and relays until the first direction ends. If the
/// remote leg cannot be established the local connection is dropped without
/// any data being copied.
#[instrument(skip_all, fields(client = %client_addr, remote = %target.address))]
pub async fn handle_relay_session(
    local: TcpStream,
    client_addr: SocketAddr,
    target: &RemoteTarget,
) -> Result<RelayOutcome, RelayError> {
    let remote = connect_remote(target).await?;

    info!("connected to remote");

    Ok(relay_until_first_close(local, remote).await)
}
