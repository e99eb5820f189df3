use anyhow::{Context, Result};
use clap::Parser;
use reelindex::logging;
use reelindex::status::{AmqpStatusChannel, StatusChannel};

#[derive(Parser)]
#[command(
    name = "status-listener",
    about = "Print job status events published on the status queue"
)]
struct Cli {
    /// AMQP URI of the status broker.
    #[arg(long, env = "STATUS_CHANNEL_URL", default_value = "amqp://127.0.0.1:5672/%2f")]
    url: String,
    /// Queue carrying status events.
    #[arg(long, env = "STATUS_QUEUE", default_value = "task-queue")]
    queue: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = logging::init_tracing("status-listener");

    let channel = AmqpStatusChannel::connect(&cli.url, &cli.queue)
        .await
        .with_context(|| format!("Failed to connect to {}", cli.url))?;
    let consumer = channel
        .subscribe(Box::new(|event| {
            tracing::info!(
                timestamp = %event.timestamp_rfc3339(),
                "Received {}",
                event.wire_text()
            );
        }))
        .await
        .context("Failed to subscribe to status queue")?;

    tracing::info!(queue = %cli.queue, "Waiting for messages. To exit press CTRL+C");
    tokio::select! {
        result = consumer => {
            result.context("Status consumer task failed")?;
            tracing::warn!("Status consumer stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
    }
    Ok(())
}
