//! LLM Gateway
//!
//! Command-line front end for the request gateway: send a prompt through the
//! configured providers, reset recorded quota exhaustion, or print pool status.
//! Logs go to stderr as JSON; command output goes to stdout.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use gateway::{Config, Gateway, GatewayError, SendRequest};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Install before the gateway emits anything
    let prometheus = if cli.metrics {
        Some(gateway::metrics::install_recorder().context("failed to install metrics recorder")?)
    } else {
        None
    };

    let config_path = Config::resolve_path(cli.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        provider = %config.gateway.provider,
        model = %config.gateway.model,
        providers = config.providers.len(),
        fallback = config.fallback.is_some(),
        "configuration loaded"
    );

    let gateway = Gateway::from_config(&config)
        .await
        .context("failed to assemble gateway")?;

    let outcome = run(&gateway, cli.command).await;

    // Pending quota writes must land even when the call failed.
    gateway.flush().await.context("failed to write quota state")?;

    if let Some(handle) = prometheus {
        eprintln!("{}", handle.render());
    }

    outcome
}

async fn run(gateway: &Gateway, command: Command) -> Result<()> {
    match command {
        Command::Send {
            prompt,
            provider,
            model,
            task,
            max_retries,
            no_fallback,
        } => {
            let mut request = SendRequest::new(prompt.join(" "));
            request.provider = provider;
            request.model = model;
            request.task = task;
            request.max_retries = max_retries;
            if no_fallback {
                request = request.fallback(false);
            }

            match gateway.send(request).await {
                Ok(completion) => {
                    info!(
                        provider = %completion.provider,
                        credential = %completion.credential,
                        used_fallback = completion.used_fallback,
                        "completion received"
                    );
                    println!("{}", completion.text);
                    Ok(())
                }
                Err(e @ GatewayError::Exhausted { .. }) => {
                    let report = serde_json::json!({
                        "error": e.to_string(),
                        "classification": e.classification(),
                        "attempts": e.attempts(),
                    });
                    eprintln!("{}", serde_json::to_string_pretty(&report)?);
                    Err(e.into())
                }
                Err(e) => Err(e.into()),
            }
        }
        Command::Reset { provider } => {
            let cleared = gateway.reset(provider.as_deref()).await?;
            println!(
                "cleared {cleared} exhausted credential(s) for {}",
                provider.as_deref().unwrap_or("all providers")
            );
            Ok(())
        }
        Command::Status => {
            let status = gateway.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}
