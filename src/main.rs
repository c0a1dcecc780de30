use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use dnsproxy::config::{CliOverrides, Settings};
use dnsproxy::{logging, proxy};

#[derive(Parser)]
#[command(name = "dnsproxy")]
#[command(about = "Forwarding DNS proxy with caching and policy filters", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "dnsproxy.toml")]
    config: PathBuf,

    /// Local port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Upstream DNS server (ip or ip:port), may be repeated
    #[arg(short, long)]
    upstream: Vec<String>,

    /// Log every pipeline decision
    #[arg(short, long)]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let overrides = CliOverrides {
        port: args.port,
        bind: args.bind,
        upstreams: args.upstream,
        debug: args.debug,
    };
    let settings = Settings::load(&args.config, overrides)?;
    settings.validate()?;

    logging::init_logging(&settings)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    rt.block_on(proxy::run(settings))?;
    Ok(())
}
