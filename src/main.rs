use clap::Parser;
use interloper::{
    Error, Proxy, certificate_authority::OpensslAuthority, config::Config, monitor::Monitor,
    rustls::crypto::aws_lc_rs,
};
use std::{
    fs::File,
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Mutex,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Intercepting HTTP/S proxy.
///
/// Values given on the command line override those read from `--conf`.
#[derive(Debug, Parser)]
#[command(name = "interloper", version, about, long_about = None)]
struct Cli {
    /// Port to listen on [default: 8080].
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Upstream proxy to chain all traffic through.
    #[arg(long, value_name = "HOST:PORT")]
    raddr: Option<String>,

    /// Write logs to this file instead of standard error.
    #[arg(long = "log-file", visible_alias = "log", alias = "logFile", value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Print every proxied request and response.
    #[arg(short, long)]
    monitor: bool,

    /// Serve the listener itself over TLS, presenting the issuing certificate.
    #[arg(long)]
    tls: bool,

    /// JSON configuration file.
    #[arg(long, value_name = "PATH")]
    conf: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> Result<Config, Error> {
        let mut config = match &self.conf {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(raddr) = self.raddr {
            config.raddr = Some(raddr);
        }
        if let Some(log_file) = self.log_file {
            config.log_file = Some(log_file);
        }
        config.monitor |= self.monitor;
        config.tls |= self.tls;

        Ok(config)
    }
}

fn init_logging(log_file: Option<&Path>) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match log_file {
        Some(path) => subscriber
            .with_ansi(false)
            .with_writer(Mutex::new(File::create(path)?))
            .init(),
        None => subscriber.with_writer(io::stderr).init(),
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install Ctrl-C handler: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn run(config: Config) -> Result<(), Error> {
    let ca = OpensslAuthority::ensure_identity(&config.ca, aws_lc_rs::default_provider())?;
    println!(
        "Install {} as a trusted root to avoid certificate warnings",
        config.ca.cert_file.display()
    );

    let inbound_tls = if config.tls {
        Some(ca.inbound_server_config()?)
    } else {
        None
    };

    let mut builder = Proxy::builder()
        .with_addr(SocketAddr::from(([0, 0, 0, 0], config.port)))
        .with_ca(ca)
        .with_graceful_shutdown(shutdown_signal());

    if let Some(upstream) = config.upstream() {
        info!("Chaining through upstream proxy {}", upstream);
        builder = builder.with_upstream(upstream);
    }
    if let Some(server_config) = inbound_tls {
        builder = builder.with_inbound_tls(server_config);
    }
    if config.monitor {
        builder = builder.with_monitor(Monitor::spawn());
    }

    builder.build()?.start().await
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(config.log_file()) {
        eprintln!("Failed to open log file: {e}");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
