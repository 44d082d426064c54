use std::path::PathBuf;

use clap::Parser;
use partman::{
    server::Server,
    telemetry::{initialize_fmt_subscriber, initialize_jaeger_subscriber, DEFAULT_EXPORTER_ENDPOINT},
};

#[derive(Debug, Parser)]
#[command(name = "partman-lock-server")]
#[command(about = "lock server backing partman partition ownership", long_about = None)]
struct Cli {
    #[arg(long)]
    config_path: PathBuf,
    #[arg(short, long, default_value = "false")]
    tracing_jaeger: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    if args.tracing_jaeger {
        initialize_jaeger_subscriber(DEFAULT_EXPORTER_ENDPOINT)?;
    } else {
        initialize_fmt_subscriber();
    }

    let server = Server::from_config(args.config_path).await?;
    server
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
