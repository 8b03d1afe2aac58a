use anyhow::Context;
use clap::Parser;
use hop_proxy::config::{Config, LogFormat, LogLevel, LoggingConfig};
use hop_proxy::logging::{DualSinkLogger, FacadeLog};
use hop_proxy::ProxyFactory;
use log::info;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "A transparent forward HTTP proxy that logs every exchange to the console and a file"
)]
struct Args {
    #[clap(short, long, value_name = "PORT", help = "Port to listen on (default: 8088)")]
    port: Option<u16>,

    #[clap(long, value_name = "ADDR", help = "Interface to bind (default: 0.0.0.0)")]
    bind: Option<IpAddr>,

    #[clap(long, value_name = "FILE", help = "Append-only log file (default: proxy.log)")]
    log_file: Option<PathBuf>,

    #[clap(long, value_name = "SECONDS", help = "Outbound connect timeout in seconds (default: 5)")]
    connect_timeout: Option<u64>,

    #[clap(long, value_name = "SECONDS", help = "Overall outbound request timeout in seconds (default: 10)")]
    request_timeout: Option<u64>,

    #[clap(long, value_name = "NUM", help = "Maximum redirects followed per request (default: 10)")]
    max_redirects: Option<usize>,

    #[clap(long, value_name = "BYTES", help = "Largest request body accepted for forwarding (default: 10485760)")]
    max_body_size: Option<usize>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,
}

fn create_config_from_args(args: &Args) -> anyhow::Result<Config> {
    let defaults = Config::default();

    let level = match &args.log_level {
        Some(level) => level.parse::<LogLevel>()?,
        None => LogLevel::default(),
    };
    let format = match &args.log_format {
        Some(format) => format.parse::<LogFormat>()?,
        None => LogFormat::default(),
    };

    Ok(Config {
        listen_addr: SocketAddr::new(
            args.bind.unwrap_or(defaults.listen_addr.ip()),
            args.port.unwrap_or(defaults.listen_addr.port()),
        ),
        connect_timeout_secs: args.connect_timeout.unwrap_or(defaults.connect_timeout_secs),
        request_timeout_secs: args.request_timeout.unwrap_or(defaults.request_timeout_secs),
        max_redirects: args.max_redirects.unwrap_or(defaults.max_redirects),
        max_body_bytes: args.max_body_size.unwrap_or(defaults.max_body_bytes),
        logging: LoggingConfig {
            level,
            format,
            file: args.log_file.clone().unwrap_or(defaults.logging.file),
        },
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = create_config_from_args(&args)?;
    config.validate()?;

    DualSinkLogger::from_config(&config.logging)
        .with_context(|| format!("Error opening log file {}", config.logging.file.display()))?
        .init()?;
    info!("Effective configuration: {}", serde_json::to_string(&config)?);

    let server = ProxyFactory::create_server(&config, Arc::new(FacadeLog))
        .await
        .context("Server failed to start")?;
    println!("Proxy server is running on port {}", config.listen_addr.port());

    tokio::select! {
        result = server.serve() => {
            result.context("Server failed")?;
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    info!("Proxy server stopped");
    log::logger().flush();
    Ok(())
}
