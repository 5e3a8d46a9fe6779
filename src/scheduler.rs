//! Rule scheduler.
//!
//! Starts one forward listener per enabled rule. A rule whose local port
//! cannot be bound is logged and skipped; the others still start. Starting
//! with no listener at all is an error.

use crate::config::{Config, ForwardRule};
use crate::frontend::ForwardListener;
use crate::metrics::MetricsCollector;
use crate::util::ShutdownSignal;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Errors starting the forward listeners.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no forward listener could be bound ({attempted} enabled rule(s))")]
    NoListeners { attempted: usize },
}

/// A listener that was bound successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundForward {
    /// Rule name.
    pub name: String,
    /// Local address the listener is bound to.
    pub local_addr: SocketAddr,
}

/// Handles to the listeners started by [`RuleScheduler::start`].
pub struct RunningForwards {
    bound: Vec<BoundForward>,
    handles: Vec<JoinHandle<()>>,
}

impl RunningForwards {
    /// Listeners that were bound, in rule order.
    pub fn bound(&self) -> &[BoundForward] {
        &self.bound
    }

    /// Local address of the listener for the rule called `name`.
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.bound
            .iter()
            .find(|b| b.name == name)
            .map(|b| b.local_addr)
    }

    /// Wait for every listener task to finish.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "forward listener task failed");
            }
        }
    }
}

/// Starts listeners for a set of forwarding rules.
pub struct RuleScheduler {
    rules: Vec<ForwardRule>,
    connect_timeout: Duration,
    metrics: MetricsCollector,
}

impl RuleScheduler {
    /// Scheduler for the enabled rules of `config`.
    pub fn new(config: &Config, metrics: MetricsCollector) -> Self {
        Self::from_rules(
            config.enabled_rules().cloned().collect(),
            config.global.connect_timeout,
            metrics,
        )
    }

    /// Scheduler for an explicit rule list; disabled rules are skipped.
    pub fn from_rules(
        rules: Vec<ForwardRule>,
        connect_timeout: Duration,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            rules: rules.into_iter().filter(|r| r.enabled).collect(),
            connect_timeout,
            metrics,
        }
    }

    /// Bind every rule and spawn its accept loop.
    ///
    /// Each listener is bound before its task starts, so a returned
    /// [`BoundForward`] is ready for connections. Fails when no rule is
    /// enabled or every enabled rule failed to bind.
    pub async fn start(
        self,
        shutdown: &ShutdownSignal,
    ) -> Result<RunningForwards, SchedulerError> {
        let mut bound = Vec::with_capacity(self.rules.len());
        let mut handles = Vec::with_capacity(self.rules.len());

        for rule in &self.rules {
            let listener =
                match ForwardListener::bind(rule, self.connect_timeout, self.metrics.clone()).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        error!(
                            rule = %rule.display_name(),
                            local = %rule.listen_address(),
                            error = %e,
                            "failed to bind local port"
                        );
                        continue;
                    }
                };

            bound.push(BoundForward {
                name: listener.name().to_string(),
                local_addr: listener.local_addr(),
            });

            let shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(listener.run(shutdown_rx)));
        }

        if bound.is_empty() {
            return Err(SchedulerError::NoListeners {
                attempted: self.rules.len(),
            });
        }

        info!(
            listeners = bound.len(),
            skipped = self.rules.len() - bound.len(),
            "forwards started"
        );

        Ok(RunningForwards { bound, handles })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;

    #[tokio::test]
    async fn test_only_enabled_rules_are_bound() {
        let mut disabled = ForwardRule::new("127.0.0.1:0", "127.0.0.1", "9000").with_name("off");
        disabled.enabled = false;

        let config = Config {
            global: GlobalConfig::default(),
            forwards: vec![
                ForwardRule::new("127.0.0.1:0", "127.0.0.1", "9000").with_name("on"),
                disabled,
            ],
        };

        let shutdown = ShutdownSignal::new();
        let running = RuleScheduler::new(&config, MetricsCollector::new())
            .start(&shutdown)
            .await
            .unwrap();

        assert_eq!(running.bound().len(), 1);
        assert!(running.local_addr("on").is_some());
        assert!(running.local_addr("off").is_none());

        shutdown.shutdown();
        running.join().await;
    }

    #[tokio::test]
    async fn test_bind_failure_does_not_stop_other_rules() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let rules = vec![
            ForwardRule::new(format!("127.0.0.1:{port}"), "127.0.0.1", "9000").with_name("busy"),
            ForwardRule::new("127.0.0.1:0", "127.0.0.1", "9000").with_name("free"),
        ];

        let shutdown = ShutdownSignal::new();
        let running = RuleScheduler::from_rules(rules, Duration::from_secs(1), MetricsCollector::new())
            .start(&shutdown)
            .await
            .unwrap();

        assert!(running.local_addr("busy").is_none());
        assert!(running.local_addr("free").is_some());

        shutdown.shutdown();
        running.join().await;
    }

    #[tokio::test]
    async fn test_start_fails_when_every_bind_fails() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let rules = vec![
            ForwardRule::new(format!("127.0.0.1:{port}"), "127.0.0.1", "9000").with_name("a"),
            ForwardRule::new(format!("127.0.0.1:{port}"), "127.0.0.1", "9001").with_name("b"),
        ];

        let shutdown = ShutdownSignal::new();
        let result = RuleScheduler::from_rules(rules, Duration::from_secs(1), MetricsCollector::new())
            .start(&shutdown)
            .await;

        assert!(matches!(
            result,
            Err(SchedulerError::NoListeners { attempted: 2 })
        ));
    }

    #[tokio::test]
    async fn test_start_fails_when_no_rule_is_enabled() {
        let mut rule = ForwardRule::new("127.0.0.1:0", "127.0.0.1", "9000");
        rule.enabled = false;

        let shutdown = ShutdownSignal::new();
        let result = RuleScheduler::from_rules(vec![rule], Duration::from_secs(1), MetricsCollector::new())
            .start(&shutdown)
            .await;

        assert!(matches!(
            result,
            Err(SchedulerError::NoListeners { attempted: 0 })
        ));
    }
}
