//! portfwd - TCP port-forwarding relay
//!
//! Usage:
//!     portfwd [-c <config.toml>]
//!     portfwd --local <port> --remote <host> --rport <port> [--proxy <url>]
//!
//! See --help for more options.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use portfwd::config::{load_config, validate_config, Config, ForwardRule};
use portfwd::metrics::{MetricsCollector, MetricsServer};
use portfwd::scheduler::RuleScheduler;
use portfwd::util::{init_logging, wait_for_signal, ShutdownSignal};

/// Forward local TCP ports to remote hosts, optionally through an HTTP proxy.
#[derive(Parser, Debug)]
#[command(name = "portfwd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = "config.toml",
        conflicts_with_all = ["local", "remote", "rport", "proxy"]
    )]
    config: PathBuf,

    /// Local port to listen on (single-forward mode)
    #[arg(long, value_name = "PORT")]
    local: Option<String>,

    /// Remote host (single-forward mode)
    #[arg(long, value_name = "HOST")]
    remote: Option<String>,

    /// Remote port (single-forward mode)
    #[arg(long, value_name = "PORT")]
    rport: Option<String>,

    /// HTTP CONNECT proxy URL, e.g. http://proxy.local:3128 (single-forward mode)
    #[arg(long, value_name = "URL")]
    proxy: Option<String>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

impl Cli {
    fn is_single_forward(&self) -> bool {
        self.local.is_some() || self.remote.is_some() || self.rport.is_some() || self.proxy.is_some()
    }

    /// Build the configuration from flags or from the config file.
    fn load(&self) -> Result<Config> {
        if !self.is_single_forward() {
            return load_config(&self.config).with_context(|| {
                format!(
                    "failed to load configuration from '{}'; provide a valid configuration file or use --local/--remote/--rport",
                    self.config.display()
                )
            });
        }

        let mut rule = ForwardRule::new(
            self.local.clone().unwrap_or_default(),
            self.remote.clone().unwrap_or_default(),
            self.rport.clone().unwrap_or_default(),
        )
        .with_name("single");
        rule.proxy = self.proxy.clone();

        let config = Config::single(rule);
        validate_config(&config).map_err(|e| anyhow!("invalid forward parameters: {e}"))?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = cli.load()?;

    // CLI overrides config
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);

    init_logging(log_level, &config.global.log_format);

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Forwards: {}", config.forwards.len());
        for rule in &config.forwards {
            println!(
                "    - {} {} -> {}{} [{}]",
                rule.display_name(),
                rule.listen_address(),
                rule.remote_address(),
                rule.proxy_url()
                    .map(|p| format!(" via {p}"))
                    .unwrap_or_default(),
                if rule.enabled { "enabled" } else { "disabled" }
            );
        }
        return Ok(());
    }

    info!(
        forwards = config.forwards.len(),
        enabled = config.enabled_rules().count(),
        "portfwd starting"
    );

    run(config)
}

/// Run the relay with the given configuration.
fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async { run_async(config).await })
}

/// Async entry point: start listeners, wait for a signal, stop listeners.
async fn run_async(config: Config) -> Result<()> {
    let shutdown = ShutdownSignal::new();
    let metrics = MetricsCollector::new();

    let metrics_handle = if config.global.metrics.enabled {
        let server = MetricsServer::new(
            config.global.metrics.address,
            config.global.metrics.path.clone(),
            metrics.clone(),
        );
        Some(tokio::spawn(server.run(shutdown.subscribe())))
    } else {
        None
    };

    let running = match RuleScheduler::new(&config, metrics).start(&shutdown).await {
        Ok(running) => running,
        Err(e) => {
            shutdown.shutdown();
            if let Some(handle) = metrics_handle {
                let _ = handle.await;
            }
            return Err(e).context("failed to start forwarding");
        }
    };

    info!("portfwd is running");
    info!("press Ctrl+C to stop");

    wait_for_signal().await;

    // Listeners stop accepting; open sessions end with the process.
    shutdown.shutdown();
    running.join().await;
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    info!("portfwd shut down complete");
    Ok(())
}
