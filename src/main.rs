//! Tool relay command line.
//!
//! Loads the endpoint list, connects every endpoint and runs one command
//! against them.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::io::Write;

use anyhow::{Context, bail};
use clap::Parser;
use dotenvy::dotenv;
use futures::StreamExt;
use serde_json::Value;
use tracing::info;

use tool_relay::{
    config::{AppConfig, Cli, Command},
    llm::run_turn,
    mcp::{
        CallContext, DispatchRequest, Dispatcher, EndpointRegistry, config::load_endpoints,
    },
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present)
    let _ = dotenv();

    let cli = Cli::parse();
    let config = AppConfig::from_cli(&cli).context("failed to load configuration")?;
    telemetry::init(config.logging.format);

    let endpoints = load_endpoints(&config.endpoints.file)
        .with_context(|| format!("failed to load endpoints from {}", config.endpoints.file))?;
    info!(count = endpoints.len(), file = %config.endpoints.file, "loaded endpoints");

    let registry = EndpointRegistry::from_config(&endpoints, &config.manager_settings()).await;
    let dispatcher = Dispatcher::new(registry.clone())
        .with_timeout(config.call_timeout())
        .with_list_timeout(config.list_timeout());

    let result = run(cli.command.unwrap_or(Command::Tools), &dispatcher).await;

    registry.close_all().await;
    info!("shutdown complete");
    result
}

async fn run(command: Command, dispatcher: &Dispatcher) -> anyhow::Result<()> {
    match command {
        Command::Tools => {
            let definition = dispatcher.tool_definition().await;
            println!("{}", serde_json::to_string_pretty(&definition)?);
        }

        Command::Call {
            resource,
            operation,
            params,
        } => {
            let params = match serde_json::from_str(&params).context("--params is not valid JSON")? {
                Value::Object(map) => Some(map),
                Value::Null => None,
                other => bail!("--params must be a JSON object, got {other}"),
            };
            let request = DispatchRequest {
                operation,
                resource,
                params,
            };
            let output = dispatcher.execute(&serde_json::to_string(&request)?).await?;
            println!("{output}");
        }

        Command::Watch { resource, uri } => {
            let manager = dispatcher
                .registry()
                .lookup(&resource)
                .with_context(|| format!("endpoint not found: {resource}"))?;
            let mut notifications = manager
                .subscribe(&uri, &CallContext::default())
                .await
                .with_context(|| format!("failed to subscribe to {uri}"))?;
            info!(endpoint = %resource, %uri, "watching, press Ctrl-C to stop");

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            loop {
                tokio::select! {
                    _ = &mut ctrl_c => break,
                    next = notifications.next() => match next {
                        Some(notification) => println!("{}", serde_json::to_string(&notification)?),
                        None => break,
                    },
                }
            }
        }

        Command::Replay { file } => {
            let txt = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let chunks: Vec<String> =
                serde_json::from_str(&txt).context("replay file must be a JSON array of strings")?;
            let stream = futures::stream::iter(
                chunks
                    .into_iter()
                    .map(|c| Ok::<_, anyhow::Error>(c.into_bytes())),
            );

            let mut stdout = std::io::stdout();
            let outcome = run_turn(stream, dispatcher, |text| {
                let _ = stdout.write_all(text);
                let _ = stdout.flush();
            })
            .await?;
            println!();
            println!("{}", serde_json::to_string_pretty(&outcome.messages())?);
        }
    }

    Ok(())
}
