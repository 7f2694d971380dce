use clap::Parser;
use sniforward_bin::{LogFormat, init_logging, run};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file. Without one, settings are read from
    /// environment variables (LISTEN_ADDRESS, UPSTREAM_TYPE, ...).
    #[arg(short, long, env = "SNIFORWARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.log_format)?;
    if let Err(e) = run(args.config.as_deref()).await {
        tracing::error!(error = %e, "Proxy exited with error");
        return Err(e.into());
    }
    Ok(())
}
