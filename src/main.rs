use clap::Parser;
use miette::{IntoDiagnostic, Result};
use payflow::application::broker::MessageBroker;
use payflow::application::dlq::DlqManager;
use payflow::infrastructure::connector::EndpointConnector;
use payflow::interfaces::cli::{AdminRunner, Cli, StdinConfirmation};
use payflow::telemetry::init_tracing;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("warn");
    let cli = Cli::parse();
    let config = cli.config();

    let broker = Arc::new(MessageBroker::new(
        config.broker.clone(),
        Arc::new(EndpointConnector::default()),
    ));
    let dlq = Arc::new(DlqManager::new(broker.clone(), config.dlq.clone()));
    let runner = AdminRunner::new(dlq.clone(), &config, Box::new(StdinConfirmation));

    let outcome = async {
        dlq.initialize().await?;
        runner.run(&cli.command).await
    }
    .await;

    // Closing the channel writes file:// brokers back to disk.
    if let Err(e) = broker.disconnect().await {
        tracing::error!(error = %e, "Failed to disconnect from broker");
    }

    let output = outcome?;
    println!("{}", serde_json::to_string_pretty(&output).into_diagnostic()?);
    Ok(())
}
