use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::Parser;
use durable_stream::{
    server,
    types::{FsyncPolicy, ServerOptions},
};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Durable Streams - append-only, resumable byte streams over HTTP", long_about = None)]
struct Opts {
    /// Address to listen on, as host:port
    #[arg(long, env = "DURABLE_STREAM_LISTEN", default_value = "127.0.0.1:4437")]
    listen: String,

    /// Storage directory; omit for a purely in-memory server
    #[arg(long, env = "DURABLE_STREAM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// When log appends are flushed to disk ("always" or "os")
    #[arg(long, env = "DURABLE_STREAM_FSYNC", default_value = "always")]
    fsync: FsyncPolicy,

    /// Maximum time a long-poll request is held open, in milliseconds
    #[arg(
        long,
        env = "DURABLE_STREAM_LONG_POLL_TIMEOUT_MS",
        default_value_t = 30_000
    )]
    long_poll_timeout_ms: u64,

    /// SSE keep-alive interval and disconnect-detection bound, in milliseconds
    #[arg(long, env = "DURABLE_STREAM_HEARTBEAT_MS", default_value_t = 15_000)]
    heartbeat_ms: u64,

    /// Period between retention sweeps, in milliseconds
    #[arg(
        long,
        env = "DURABLE_STREAM_RETENTION_SCAN_INTERVAL_MS",
        default_value_t = 5_000
    )]
    retention_scan_interval_ms: u64,

    /// Per-stream retention horizon in bytes; 0 keeps everything
    #[arg(long, env = "DURABLE_STREAM_RETENTION_MAX_BYTES", default_value_t = 0)]
    retention_max_bytes: u64,

    /// Maximum concurrent long-poll/SSE waiters before 503; 0 is unbounded
    #[arg(long, env = "DURABLE_STREAM_MAX_WAITERS", default_value_t = 4096)]
    max_waiters: usize,

    /// Per-stream byte budget for the in-memory store; 0 is unlimited
    #[arg(long, env = "DURABLE_STREAM_MAX_STREAM_BYTES", default_value_t = 0)]
    max_stream_bytes: u64,

    /// Process-wide byte budget for the in-memory store; 0 is unlimited
    #[arg(long, env = "DURABLE_STREAM_MAX_TOTAL_BYTES", default_value_t = 0)]
    max_total_bytes: u64,

    /// Cap on bytes returned by a single catch-up read; 0 is unlimited
    #[arg(long, env = "DURABLE_STREAM_MAX_READ_BYTES", default_value_t = 0)]
    max_read_bytes: u64,

    /// CDN cursor rotation interval, in seconds
    #[arg(long, env = "DURABLE_STREAM_CURSOR_INTERVAL", default_value_t = 20)]
    cursor_interval_seconds: u64,

    /// Mirror stream lifecycle events into this stream path
    #[arg(long, env = "DURABLE_STREAM_REGISTRY_STREAM")]
    registry_stream: Option<String>,

    /// Disable response compression
    #[arg(long, env = "DURABLE_STREAM_NO_COMPRESSION")]
    no_compression: bool,

    /// Log level filter (e.g. "info", "durable_stream=debug")
    #[arg(long, env = "DURABLE_STREAM_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    // Load .env before clap so env-mirrored flags pick it up.
    dotenvy::dotenv().ok();

    let opts: Opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            let _ = e.print();
            process::exit(e.exit_code());
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&opts.log_level))
        .init();

    let options = match build_options(&opts) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(2);
        }
    };

    if let Err(e) = server::start_server(options).await {
        error!(error = %e, "server exited with an unrecoverable error");
        process::exit(1);
    }
}

fn build_options(opts: &Opts) -> anyhow::Result<ServerOptions> {
    let (host, port) = parse_listen(&opts.listen)?;

    Ok(ServerOptions {
        host,
        port,
        long_poll_timeout_ms: opts.long_poll_timeout_ms,
        heartbeat_ms: opts.heartbeat_ms,
        data_dir: opts.data_dir.clone(),
        fsync: opts.fsync,
        compression: !opts.no_compression,
        cursor_interval_seconds: opts.cursor_interval_seconds.max(1),
        retention_scan_interval_ms: opts.retention_scan_interval_ms.max(1),
        retention_max_bytes: opts.retention_max_bytes,
        max_waiters: opts.max_waiters,
        max_stream_bytes: opts.max_stream_bytes,
        max_total_bytes: opts.max_total_bytes,
        max_read_bytes: opts.max_read_bytes,
        registry_stream: opts.registry_stream.clone(),
        ..Default::default()
    })
}

fn parse_listen(listen: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = listen
        .rsplit_once(':')
        .with_context(|| format!("--listen must be host:port, got '{listen}'"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in --listen: '{port}'"))?;
    Ok((host.to_string(), port))
}
