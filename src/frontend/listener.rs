//! Forward listener implementation.
//!
//! Owns the local socket of one forwarding rule and hands every accepted
//! connection to its own relay task.

use crate::config::ForwardRule;
use crate::metrics::MetricsCollector;
use crate::proxy::{handle_relay_session, RemoteTarget};
use crate::util::SessionId;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Listener for one forwarding rule.
pub struct ForwardListener {
    /// Rule name used for logs and metrics.
    name: Arc<str>,
    /// Where accepted connections are relayed to.
    target: Arc<RemoteTarget>,
    /// TCP listener.
    listener: TcpListener,
    /// Address actually bound.
    local_addr: SocketAddr,
    /// Admission gate; `None` means unbounded.
    gate: Option<Arc<Semaphore>>,
    /// Metrics collector.
    metrics: MetricsCollector,
}

impl ForwardListener {
    /// Bind the local socket for `rule`.
    ///
    /// `default_timeout` applies unless the rule overrides it.
    pub async fn bind(
        rule: &ForwardRule,
        default_timeout: Duration,
        metrics: MetricsCollector,
    ) -> io::Result<Self> {
        let listener = match TcpListener::bind(rule.listen_address()).await {
            Ok(listener) => listener,
            Err(e) if e.kind() != io::ErrorKind::AddrInUse => {
                let Some(fallback) = rule.fallback_listen_address() else {
                    return Err(e);
                };
                debug!(
                    rule = %rule.display_name(),
                    error = %e,
                    fallback = %fallback,
                    "IPv6 wildcard unavailable, binding IPv4 only"
                );
                TcpListener::bind(fallback).await?
            }
            Err(e) => return Err(e),
        };
        let local_addr = listener.local_addr()?;

        let connect_timeout = rule.connect_timeout.unwrap_or(default_timeout);
        let target = match rule.proxy_url() {
            Some(proxy) => RemoteTarget::via_proxy(rule.remote_address(), proxy, connect_timeout),
            None => RemoteTarget::direct(rule.remote_address(), connect_timeout),
        };

        info!(
            rule = %rule.display_name(),
            local = %local_addr,
            remote = %target.address,
            proxy = target.proxy.as_deref().unwrap_or("-"),
            "listening on local port"
        );

        Ok(Self {
            name: Arc::from(rule.display_name()),
            target: Arc::new(target),
            listener,
            local_addr,
            gate: rule
                .max_connections
                .map(|limit| Arc::new(Semaphore::new(limit))),
            metrics,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Rule name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the accept loop until shutdown.
    ///
    /// Accept errors are logged and the loop keeps going.
    #[instrument(name = "forward", skip_all, fields(rule = %self.name, local = %self.local_addr))]
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                (accept_result, permit) = self.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            self.handle_connection(stream, addr, permit);
                        }
                        Err(e) => {
                            self.metrics.accept_failed(&self.name);
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("forward listener shutting down");
                    break;
                }
            }
        }
    }

    /// Wait for admission, then accept the next connection.
    async fn accept(
        &self,
    ) -> (
        io::Result<(TcpStream, SocketAddr)>,
        Option<OwnedSemaphorePermit>,
    ) {
        // The gate is never closed, so acquisition only fails if that changes.
        let permit = match &self.gate {
            Some(gate) => Arc::clone(gate).acquire_owned().await.ok(),
            None => None,
        };
        (self.listener.accept().await, permit)
    }

    /// Spawn the relay session for an accepted connection.
    fn handle_connection(
        &self,
        stream: TcpStream,
        client_addr: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on local connection");
        }

        let name = Arc::clone(&self.name);
        let target = Arc::clone(&self.target);
        let metrics = self.metrics.clone();
        let session_id = SessionId::next();

        let span = info_span!("session", session = %session_id, client = %client_addr);

        tokio::spawn(
            async move {
                info!("new connection");
                metrics.connection_opened(&name);
                let start = Instant::now();

                match handle_relay_session(stream, client_addr, &target).await {
                    Ok(outcome) => {
                        if let Some(e) = &outcome.error {
                            warn!(
                                error = %e,
                                direction = %outcome.finished_first,
                                "data transfer error"
                            );
                        }
                        let duration = start.elapsed();
                        metrics.record_session(
                            &name,
                            outcome.bytes_to_remote,
                            outcome.bytes_to_local,
                            duration,
                        );
                        info!(
                            bytes_to_remote = outcome.bytes_to_remote,
                            bytes_to_local = outcome.bytes_to_local,
                            duration_ms = duration.as_millis(),
                            "connection closed"
                        );
                    }
                    Err(e) => {
                        metrics.remote_connect_failed(&name);
                        warn!(error = %e, "failed to connect to remote");
                        info!("connection closed");
                    }
                }

                metrics.connection_closed(&name);
                drop(permit);
            }
            .instrument(span),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn rule_to(remote: SocketAddr) -> ForwardRule {
        ForwardRule::new("127.0.0.1:0", remote.ip().to_string(), remote.port().to_string())
            .with_name("test")
    }

    #[tokio::test]
    async fn test_forward_listener_bind() {
        let rule = rule_to("127.0.0.1:9000".parse().unwrap());
        let listener = ForwardListener::bind(&rule, Duration::from_secs(1), MetricsCollector::new())
            .await
            .unwrap();

        assert_eq!(listener.name(), "test");
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_forward_listener_bind_conflict() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let rule = ForwardRule::new(format!("127.0.0.1:{port}"), "127.0.0.1", "9000");
        let result =
            ForwardListener::bind(&rule, Duration::from_secs(1), MetricsCollector::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bare_port_accepts_ipv4_and_ipv6() {
        if std::net::TcpListener::bind("[::1]:0").is_err() {
            return;
        }
        let remote = echo_server().await;
        let rule = ForwardRule::new("0", remote.ip().to_string(), remote.port().to_string())
            .with_name("dual");
        let listener = ForwardListener::bind(&rule, Duration::from_secs(5), MetricsCollector::new())
            .await
            .unwrap();
        let port = listener.local_addr().port();
        assert!(listener.local_addr().is_ipv6());

        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(listener.run(shutdown_rx));

        for host in ["::1", "127.0.0.1"] {
            let mut client = TcpStream::connect((host, port)).await.unwrap();
            client.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf, b"ping", "relay over {host}");
        }
    }

    #[tokio::test]
    async fn test_forward_listener_relays_and_stops() {
        let remote = echo_server().await;
        let metrics = MetricsCollector::new();
        let listener = ForwardListener::bind(&rule_to(remote), Duration::from_secs(5), metrics.clone())
            .await
            .unwrap();
        let local = listener.local_addr();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(listener.run(shutdown_rx));

        let mut client = TcpStream::connect(local).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(metrics.connections_total("test"), 1);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[derive(Clone, Default)]
    struct SpanNames(Arc<std::sync::Mutex<Vec<&'static str>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for SpanNames {
        fn on_new_span(
            &self,
            attrs: &tracing::span::Attributes<'_>,
            _id: &tracing::span::Id,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            self.0.lock().unwrap().push(attrs.metadata().name());
        }
    }

    #[tokio::test]
    async fn test_accept_loop_span_is_named_forward() {
        use tracing_subscriber::layer::SubscriberExt;

        let names = SpanNames::default();
        let subscriber = tracing_subscriber::registry().with(names.clone());
        let _guard = tracing::subscriber::set_default(subscriber);

        let listener = ForwardListener::bind(
            &rule_to("127.0.0.1:9000".parse().unwrap()),
            Duration::from_secs(1),
            MetricsCollector::new(),
        )
        .await
        .unwrap();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        drop(listener.run(shutdown_rx));

        assert!(names.0.lock().unwrap().contains(&"forward"));
    }

    #[tokio::test]
    async fn test_admission_gate_holds_second_connection() {
        let remote = echo_server().await;
        let mut rule = rule_to(remote);
        rule.max_connections = Some(1);

        let listener = ForwardListener::bind(&rule, Duration::from_secs(5), MetricsCollector::new())
            .await
            .unwrap();
        let local = listener.local_addr();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(listener.run(shutdown_rx));

        let mut first = TcpStream::connect(local).await.unwrap();
        first.write_all(b"one").await.unwrap();
        let mut buf = [0u8; 3];
        first.read_exact(&mut buf).await.unwrap();

        // Sits in the kernel backlog until the first session ends.
        let mut second = TcpStream::connect(local).await.unwrap();
        second.write_all(b"two").await.unwrap();
        let pending =
            tokio::time::timeout(Duration::from_millis(200), second.read_exact(&mut buf)).await;
        assert!(pending.is_err());

        drop(first);
        tokio::time::timeout(Duration::from_secs(5), second.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"two");
    }
}
