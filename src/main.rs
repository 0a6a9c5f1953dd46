//! lineserv - A Connection-Oriented Line Server Core
//!
//! This is the main entry point for the lineserv binary. It parses the
//! command line, sets up logging, binds the listener and wires the
//! interrupt signal to the manager's cancellation entry point.

use anyhow::Context;
use lineserv::manager::{ConnectionManager, ManagerConfig, ManagerHandle};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Server configuration
struct Config {
    /// Host to bind to
    host: Ipv4Addr,
    /// Port to listen on
    port: u16,
    /// Per-connection inactivity timeout in milliseconds (0 disables it)
    timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED,
            port: lineserv::DEFAULT_PORT,
            timeout_ms: 0,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    if i + 1 < args.len() {
                        config.host = args[i + 1].parse().unwrap_or_else(|_| {
                            eprintln!("Error: invalid host address");
                            std::process::exit(1);
                        });
                        i += 2;
                    } else {
                        eprintln!("Error: --host requires a value");
                        std::process::exit(1);
                    }
                }
                "--port" | "-p" => {
                    if i + 1 < args.len() {
                        config.port = args[i + 1].parse().unwrap_or_else(|_| {
                            eprintln!("Error: invalid port number");
                            std::process::exit(1);
                        });
                        i += 2;
                    } else {
                        eprintln!("Error: --port requires a value");
                        std::process::exit(1);
                    }
                }
                "--timeout" | "-t" => {
                    if i + 1 < args.len() {
                        config.timeout_ms = args[i + 1].parse().unwrap_or_else(|_| {
                            eprintln!("Error: invalid timeout (expected milliseconds)");
                            std::process::exit(1);
                        });
                        i += 2;
                    } else {
                        eprintln!("Error: --timeout requires a value");
                        std::process::exit(1);
                    }
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("lineserv version {}", lineserv::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }

    fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            host: self.host,
            port: self.port,
            inactivity_timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

fn print_help() {
    println!(
        r#"
lineserv - A Connection-Oriented Line Server Core

USAGE:
    lineserv [OPTIONS]

OPTIONS:
    -h, --host <HOST>       Host to bind to (default: 0.0.0.0)
    -p, --port <PORT>       Port to listen on (default: 4000)
    -t, --timeout <MS>      Inactivity timeout in milliseconds;
                            0 disables it (default: 0)
    -v, --version           Print version information
        --help              Print this help message

EXAMPLES:
    lineserv                          # Listen on 0.0.0.0:4000, no timeout
    lineserv --port 5000              # Listen on port 5000
    lineserv --timeout 3000           # Drop clients idle for 3 seconds

CONNECTING:
    Any client that sends newline-terminated text works:
    $ nc localhost 4000
    hello
"#
    );
}

fn print_banner(config: &Config) {
    let timeout = if config.timeout_ms == 0 {
        "disabled".to_string()
    } else {
        format!("{}ms", config.timeout_ms)
    };
    println!(
        r#"
lineserv v{} - Connection-Oriented Line Server Core
──────────────────────────────────────────────────
Listening on {}:{}
Inactivity timeout: {}

Use Ctrl+C to shut down gracefully.
"#,
        lineserv::VERSION,
        config.host,
        config.port,
        timeout
    );
}

/// Logs an error with its full causal chain, each nested cause indented
/// below the one it caused.
fn log_error_chain(err: &anyhow::Error) {
    error!("{}", err);
    let mut pad = String::from("  ");
    for cause in err.chain().skip(1) {
        error!("{}caused by: {}", pad, cause);
        pad.push_str("  ");
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_args();

    // Set up logging
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner(&config);

    if let Err(e) = run(&config).await {
        log_error_chain(&e);
        std::process::exit(1);
    }

    info!("server shutdown complete");
}

async fn run(config: &Config) -> anyhow::Result<()> {
    let manager = ConnectionManager::bind(config.manager_config())
        .context("failed to bind listen endpoint")?;
    let handle: ManagerHandle = manager.start();

    signal::ctrl_c()
        .await
        .context("failed to install interrupt handler")?;
    info!("shutdown signal received, cancelling active connections");

    handle.shutdown().await;
    Ok(())
}
