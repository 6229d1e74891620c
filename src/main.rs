use murmur::{error::BoxError, Config, Node};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .init();

    let config = Config::from_env()?;
    let (node, outbox_rx) = Node::builder(config).with_workloads()?.build();
    node.run(outbox_rx, tokio::io::stdin(), tokio::io::stdout())
        .await?;

    Ok(())
}
