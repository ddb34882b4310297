use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use proxyvet::app;
use proxyvet::cli::Cli;

#[cfg(not(target_os = "windows"))]
use jemallocator::Jemalloc;

#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() {
    let args = Cli::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let result: anyhow::Result<_> = (|| {
        let cfg = args.into_config()?;
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(app::run(cfg))
    })();

    if let Err(e) = result {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}
