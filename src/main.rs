mod commands;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use mget::cli::HostCacheMode;
use mget::connection::ProxyConfig;
use mget::downloader::{DownloadOptions, Downloader, MAX_CONNECTIONS};
use mget::utils::parse_size;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URLs to download (http, https, ftp)
    urls: Vec<String>,

    /// Directory to save downloaded files
    #[arg(short = 'd', long = "dir", default_value = ".")]
    output_dir: PathBuf,

    /// Output file name (only with a single URL)
    #[arg(short = 'o', long = "output")]
    output_name: Option<String>,

    /// Resume the download recorded for this file (or its .tmd sidecar)
    #[arg(short = 'r', long = "resume")]
    resume: Option<PathBuf>,

    /// Number of connections (at most 40; default 5 for HTTP, 3 for FTP)
    #[arg(short = 'j', long = "connections")]
    connections: Option<u32>,

    /// User name for FTP
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// Password for FTP
    #[arg(short = 'p', long)]
    password: Option<String>,

    /// Proxy as host:port
    #[arg(short = 'x', long)]
    proxy: Option<String>,

    /// The proxy itself is reached over TLS
    #[arg(long = "proxy-tls", requires = "proxy")]
    proxy_tls: bool,

    /// Host address cache mode
    #[arg(short = 'H', long = "host-cache", value_enum, default_value = "default")]
    host_cache: HostCacheMode,

    /// Bandwidth limit in bytes per second, with optional K/M/G suffix (e.g. 512K)
    #[arg(short = 'L', long = "limit", value_parser = parse_size)]
    limit: Option<u64>,

    /// Log verbosity, 0 (errors only) to 9
    #[arg(short = 'l', long = "log-level", default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=9))]
    log_level: u8,

    /// Show the metadata recorded in a .tmd file, then exit
    #[arg(short = 's', long = "show")]
    show: Option<PathBuf>,

    /// Print --show output as JSON
    #[arg(long, requires = "show")]
    json: bool,

    /// Attempts per download before giving up
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Seconds a connection may stay silent before it is dropped
    #[arg(long = "idle-timeout", default_value_t = 60)]
    idle_timeout: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    mget::logging::init(args.log_level);

    if let Some(path) = &args.show {
        return commands::inspect(path, args.json);
    }
    if args.urls.is_empty() && args.resume.is_none() {
        bail!("no URL given (use -r <file> to resume a download)");
    }
    if args.urls.len() > 1 && (args.output_name.is_some() || args.resume.is_some()) {
        bail!("-o and -r take a single download");
    }

    let connections = args.connections.map(|n| {
        let clamped = n.clamp(1, u32::from(MAX_CONNECTIONS));
        if clamped != n {
            eprintln!("Using {} connections (requested {})", clamped, n);
        }
        clamped as u8
    });
    let proxy = args
        .proxy
        .as_deref()
        .map(|spec| ProxyConfig::parse(spec, args.proxy_tls))
        .transpose()
        .context("Invalid proxy")?;

    let options = DownloadOptions {
        output_dir: args.output_dir.clone(),
        output_name: args.output_name.clone(),
        connections,
        user: args.user.clone(),
        password: args.password.clone(),
        proxy,
        host_cache: args.host_cache,
        limit_bytes_per_sec: args.limit.unwrap_or(0),
        idle_timeout: Duration::from_secs(args.idle_timeout.max(1)),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let downloader = Downloader::new(options).context("Failed to set up connections")?;
        let cancel = downloader.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nInterrupted, saving progress...");
                cancel.cancel();
            }
        });
        commands::run_downloads(&downloader, &args.urls, args.resume.as_deref(), args.retries).await
    })
}
