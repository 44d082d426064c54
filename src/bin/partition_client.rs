//! Joins a partitioned application and logs ownership changes until interrupted.
//!
//! The cluster list can be changed at runtime by writing a comma separated list of nodes on stdin.
use std::{future::Future, path::PathBuf};

use clap::Parser;
use partman::{
    partition::{config::Config, PartitionClient},
    telemetry::{initialize_fmt_subscriber, initialize_jaeger_subscriber, DEFAULT_EXPORTER_ENDPOINT},
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{event, Level};

#[derive(Debug, Parser)]
#[command(name = "partman-client")]
#[command(about = "partman partition ownership client", long_about = None)]
struct Cli {
    #[arg(long)]
    config_path: PathBuf,
    #[arg(short, long, default_value = "false")]
    tracing_jaeger: bool,
}

fn parse_cluster_list(line: &str) -> Vec<String> {
    line.split(',')
        .map(str::trim)
        .filter(|node| !node.is_empty())
        .map(str::to_string)
        .collect()
}

/// Applies the cluster lists read from `input` until `shutdown` resolves or the client fails.
/// Returns the process exit code
async fn serve<R, S>(client: &PartitionClient, input: R, shutdown: S) -> i32
where
    R: AsyncBufRead + Unpin,
    S: Future,
{
    tokio::pin!(shutdown);
    let mut lines = input.lines();
    let mut input_open = true;
    loop {
        tokio::select! {
            _ = &mut shutdown => return 0,
            err = client.fatal_error() => {
                event!(Level::ERROR, "partition client failed: {}", err);
                return 1;
            }
            line = lines.next_line(), if input_open => {
                match line {
                    Ok(Some(line)) => {
                        let cluster_list = parse_cluster_list(&line);
                        if let Err(err) = client.update_cluster_list(cluster_list).await {
                            event!(Level::ERROR, "Unable to update cluster list: {}", err);
                        }
                    }
                    // input closed, keep running until shut down or failed
                    Ok(None) => input_open = false,
                    Err(err) => {
                        event!(Level::ERROR, "Unable to read cluster list: {}", err);
                        return 1;
                    }
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    if args.tracing_jaeger {
        initialize_jaeger_subscriber(DEFAULT_EXPORTER_ENDPOINT)?;
    } else {
        initialize_fmt_subscriber();
    }

    let c = tokio::fs::read_to_string(args.config_path).await?;
    let config: Config = serde_json::from_str(&c)?;
    let app_name = config.app_name.clone();

    let client = PartitionClient::new(
        config,
        Box::new(move |owned| {
            event!(Level::INFO, app = %app_name, partitions = ?owned, "ownership changed");
        }),
    )
    .await?;

    let exit_code = serve(
        &client,
        BufReader::new(tokio::io::stdin()),
        tokio::signal::ctrl_c(),
    )
    .await;

    client.close().await;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }

    Ok(())
}
