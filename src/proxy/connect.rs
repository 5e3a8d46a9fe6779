//! HTTP CONNECT proxy dialer.
//!
//! Opens a TCP connection to an HTTP proxy and asks it to tunnel to the
//! target with a `CONNECT` request. Once the proxy answers with
//! `200 Connection established` the stream is a plain byte pipe to the
//! target.
//!
//! Success detection is a substring match on the first response read, not a
//! status-line parse. Proxies that split the status line across packets, or
//! that phrase the reason differently (`200 OK`), are reported as rejections.
//! Any bytes that follow the response headers in that first read are dropped.

use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument};
use url::Url;

/// Size of the buffer the proxy response is read into.
pub const RESPONSE_BUFFER_SIZE: usize = 1024;

/// Text a proxy response must contain for the tunnel to count as open.
pub const TUNNEL_ESTABLISHED: &str = "200 Connection established";

/// Errors while establishing a tunnel through a proxy.
///
/// The proxy connection, if one was opened, is closed before any of these is
/// returned.
#[derive(Debug, Error)]
pub enum ProxyDialError {
    #[error("invalid proxy URL '{0}': {1}")]
    InvalidUrl(String, url::ParseError),

    #[error("proxy URL '{0}' has no host:port authority")]
    MissingAuthority(String),

    #[error("failed to connect to proxy {0}: {1}")]
    ConnectError(String, io::Error),

    #[error("connection timeout to proxy {0}")]
    ConnectTimeout(String),

    #[error("failed to send CONNECT request: {0}")]
    WriteError(io::Error),

    #[error("failed to read proxy response: {0}")]
    ReadError(io::Error),

    #[error("proxy handshake timed out")]
    HandshakeTimeout,

    #[error("proxy refused tunnel: {0}")]
    Rejected(String),
}

/// Build the `CONNECT` request for `target` (`host:port`).
pub fn connect_request(target: &str) -> String {
    format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n")
}

/// Whether a proxy response signals an established tunnel.
pub fn is_tunnel_established(response: &[u8]) -> bool {
    String::from_utf8_lossy(response).contains(TUNNEL_ESTABLISHED)
}

/// Resolve a proxy URL to the `host:port` to dial.
///
/// A URL without an explicit port falls back to the scheme default
/// (80 for `http`).
pub fn proxy_authority(proxy_url: &str) -> Result<String, ProxyDialError> {
    let parsed = Url::parse(proxy_url)
        .map_err(|e| ProxyDialError::InvalidUrl(proxy_url.to_string(), e))?;

    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProxyDialError::MissingAuthority(proxy_url.to_string()))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| ProxyDialError::MissingAuthority(proxy_url.to_string()))?;

    Ok(format!("{host}:{port}"))
}

/// Run the CONNECT exchange over an already-open proxy stream.
pub async fn handshake<S>(stream: &mut S, target: &str) -> Result<(), ProxyDialError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(connect_request(target).as_bytes())
        .await
        .map_err(ProxyDialError::WriteError)?;

    let mut buf = [0u8; RESPONSE_BUFFER_SIZE];
    let n = stream.read(&mut buf).await.map_err(ProxyDialError::ReadError)?;
    if n == 0 {
        return Err(ProxyDialError::ReadError(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "proxy closed the connection before responding",
        )));
    }

    let response = &buf[..n];
    if !is_tunnel_established(response) {
        return Err(ProxyDialError::Rejected(
            String::from_utf8_lossy(response).into_owned(),
        ));
    }

    debug!(destination = target, "proxy tunnel established");
    Ok(())
}

/// Connect to `target` through the HTTP proxy at `proxy_url`.
///
/// `connect_timeout` bounds the TCP connect to the proxy and, separately,
/// the CONNECT exchange.
#[instrument(skip_all, fields(proxy = %proxy_url, destination = %target))]
pub async fn dial_through_proxy(
    target: &str,
    proxy_url: &str,
    connect_timeout: Duration,
) -> Result<TcpStream, ProxyDialError> {
    let authority = proxy_authority(proxy_url)?;

    debug!(authority = %authority, "connecting to proxy");

    let mut stream = match timeout(connect_timeout, TcpStream::connect(authority.as_str())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ProxyDialError::ConnectError(authority, e)),
        Err(_) => return Err(ProxyDialError::ConnectTimeout(authority)),
    };

    // Dropping the stream on any error below closes the proxy connection.
    match timeout(connect_timeout, handshake(&mut stream, target)).await {
        Ok(Ok(())) => Ok(stream),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ProxyDialError::HandshakeTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Start a one-shot proxy that records the request and replies with `response`.
    async fn fake_proxy(response: &'static [u8]) -> (String, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            buf.truncate(n);
            stream.write_all(response).await.unwrap();
            buf
        });

        (format!("http://{addr}"), handle)
    }

    #[test]
    fn test_connect_request_format() {
        assert_eq!(
            connect_request("10.0.0.5:22"),
            "CONNECT 10.0.0.5:22 HTTP/1.1\r\nHost: 10.0.0.5:22\r\n\r\n"
        );
    }

    #[test]
    fn test_tunnel_established_is_substring_match() {
        assert!(is_tunnel_established(
            b"HTTP/1.1 200 Connection established\r\n\r\n"
        ));
        assert!(is_tunnel_established(
            b"HTTP/1.0 200 Connection established\r\nProxy-agent: x\r\n\r\n"
        ));
        assert!(!is_tunnel_established(b"HTTP/1.1 200 OK\r\n\r\n"));
        assert!(!is_tunnel_established(
            b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n"
        ));
    }

    #[test]
    fn test_proxy_authority() {
        assert_eq!(
            proxy_authority("http://proxy.local:3128").unwrap(),
            "proxy.local:3128"
        );
        assert_eq!(proxy_authority("http://proxy.local").unwrap(), "proxy.local:80");
        assert_eq!(proxy_authority("http://[::1]:3128").unwrap(), "[::1]:3128");
    }

    #[test]
    fn test_proxy_authority_rejects_bad_urls() {
        assert!(matches!(
            proxy_authority("not a url"),
            Err(ProxyDialError::InvalidUrl(_, _))
        ));
        assert!(matches!(
            proxy_authority("proxy.local:3128"),
            Err(ProxyDialError::MissingAuthority(_))
        ));
    }

    #[tokio::test]
    async fn test_dial_through_proxy_success() {
        let (proxy_url, proxy) =
            fake_proxy(b"HTTP/1.1 200 Connection established\r\n\r\n").await;

        let result = dial_through_proxy("10.0.0.5:22", &proxy_url, Duration::from_secs(5)).await;
        assert!(result.is_ok());

        let request = proxy.await.unwrap();
        assert_eq!(
            request,
            b"CONNECT 10.0.0.5:22 HTTP/1.1\r\nHost: 10.0.0.5:22\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_dial_through_proxy_rejected_includes_response() {
        let (proxy_url, _proxy) = fake_proxy(b"HTTP/1.1 403 Forbidden\r\n\r\n").await;

        let result = dial_through_proxy("10.0.0.5:22", &proxy_url, Duration::from_secs(5)).await;
        match result.unwrap_err() {
            ProxyDialError::Rejected(body) => assert!(body.contains("403 Forbidden")),
            e => panic!("expected rejection, got: {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_dial_through_proxy_refused() {
        let result =
            dial_through_proxy("10.0.0.5:22", "http://127.0.0.1:1", Duration::from_secs(5)).await;
        assert!(matches!(
            result.unwrap_err(),
            ProxyDialError::ConnectError(_, _)
        ));
    }

    #[tokio::test]
    async fn test_dial_through_proxy_eof_before_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
        });

        let result =
            dial_through_proxy("10.0.0.5:22", &format!("http://{addr}"), Duration::from_secs(5))
                .await;
        assert!(matches!(result.unwrap_err(), ProxyDialError::ReadError(_)));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let result = dial_through_proxy(
            "10.0.0.5:22",
            &format!("http://{addr}"),
            Duration::from_millis(200),
        )
        .await;
        assert!(matches!(result.unwrap_err(), ProxyDialError::HandshakeTimeout));
    }
}
