use anyhow::Context;
use cadenza_core::logging::{self, LogFormat};
use cadenza_core::{Server, ServerConfig};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "cadenza")]
#[command(about = "Serve static files over HTTP/1.1 from an edge-triggered epoll loop")]
#[command(version)]
struct Cli {
    /// Address to listen on
    ip: Option<String>,
    /// Port to listen on
    port: Option<u16>,
    /// Directory to serve files from
    #[arg(short, long)]
    root: Option<PathBuf>,
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Worker threads for request processing
    #[arg(short, long)]
    workers: Option<usize>,
    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,
    /// Pin worker threads to CPU cores
    #[arg(long)]
    pin_workers: bool,
    /// Seconds between metrics log lines (0 disables)
    #[arg(long)]
    metrics_interval: Option<u64>,
    /// Log output format
    #[arg(long, value_enum, default_value_t = Format::Plain)]
    log_format: Format,
    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Plain,
    Pretty,
    Json,
}

impl From<Format> for LogFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Plain => LogFormat::Plain,
            Format::Pretty => LogFormat::Pretty,
            Format::Json => LogFormat::Json,
        }
    }
}

impl Cli {
    /// Flags win over the file and the environment.
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(ip) = &self.ip {
            config.host = ip.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(root) = &self.root {
            config.doc_root = root.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if self.pin_workers {
            config.pin_workers = true;
        }
        if let Some(secs) = self.metrics_interval {
            config.metrics_interval_secs = secs;
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format.into(), &cli.log_level);

    let mut config = ServerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply(&mut config);

    let server = Server::bind(config).context("failed to start server")?;
    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        tracing::info!("received SIGINT, shutting down");
        shutdown.shutdown();
    })
    .context("failed to install Ctrl-C handler")?;

    tracing::info!(addr = %server.local_addr(), "listening");
    server.serve()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_address_and_flags() {
        let cli = Cli::parse_from([
            "cadenza", "0.0.0.0", "9090", "--root", "/srv/www", "--workers", "3", "--pin-workers",
        ]);
        let mut config = ServerConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9090);
        assert_eq!(config.doc_root, PathBuf::from("/srv/www"));
        assert_eq!(config.workers, 3);
        assert!(config.pin_workers);
    }

    #[test]
    fn test_flags_leave_unset_values_alone() {
        let cli = Cli::parse_from(["cadenza"]);
        let mut config = ServerConfig { port: 7000, ..ServerConfig::default() };
        cli.apply(&mut config);
        assert_eq!(config.port, 7000);
        assert!(matches!(cli.log_format, Format::Plain));
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
