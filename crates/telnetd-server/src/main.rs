//! telnetd: a multiplexing telnet server.
//!
//! Bridges each client socket to a pseudo-terminal running a login
//! process, filtering telnet control sequences inline. Authenticated
//! sessions speak a line-oriented command dialect for uploading crontabs
//! instead of reaching a pty.

mod auth;
mod config;
mod crontab;
mod protocol;
mod pty;
mod reaper;
mod server;
mod session;

use clap::Parser;
use config::ServerConfig;
use server::Server;
use std::path::PathBuf;
use tracing::{error, info};

/// telnetd — telnet server with pty login sessions
#[derive(Parser, Debug)]
#[command(name = "telnetd", version, about = "Telnet server with pty login sessions")]
struct Cli {
    /// Listen port
    #[arg(short, long, default_value_t = 23)]
    port: u16,

    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Serve a single inherited connection on stdin/stdout
    #[arg(short, long)]
    inherited: bool,

    /// Program spawned on each session's pty
    #[arg(short, long)]
    login_path: Option<String>,

    /// Banner file written to the tty before login
    #[arg(short = 'f', long)]
    issue_file: Option<String>,

    /// Reap exited login processes and close their sessions
    #[arg(short = 'K', long)]
    watch_child: bool,

    /// Path of the session-id credential file
    #[arg(long)]
    session_id_file: Option<String>,

    /// Config file path
    #[arg(long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    // A dead client must surface as a write error, not a signal; and
    // without the child watcher the kernel reaps login processes itself.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        if !cli.watch_child {
            libc::signal(libc::SIGCHLD, libc::SIG_IGN);
        }
    }

    let config_path = cli.config.as_ref().map(PathBuf::from);
    let server_config = match ServerConfig::load(
        config_path.as_deref(),
        Some(cli.port),
        cli.bind.as_deref(),
        cli.login_path.as_deref(),
        cli.issue_file.as_deref(),
        cli.session_id_file.as_deref(),
        cli.inherited,
        cli.watch_child,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %server_config.addr,
        inherited = server_config.inherited,
        "starting telnetd"
    );

    let mut server = match Server::new(server_config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
