//! orgsync - consistency maintenance for organization hierarchies

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use orgsync::{
    cli::{self, Args, Backend, LogFormat},
    services::{RecordingIdentityProvider, Services},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Logs go to stderr; stdout carries the command result
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("orgsync={},info", args.log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    match args.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let config = args.load_config()?;
    info!(
        batch_limit = config.batch_limit,
        max_transaction_attempts = config.max_transaction_attempts,
        chains = config.chains.len(),
        "Configuration loaded"
    );

    let backend = Backend::open(&args).await?;
    let identity = Arc::new(RecordingIdentityProvider::new());
    let services = Arc::new(Services::new(backend.store(), config, identity.clone())?);

    let output = cli::execute(&args.command, services).await?;
    backend.persist(args.output_path()).await?;

    for (uid, claims) in identity.published().await {
        info!(uid = %uid, claims = claims.len(), "Claims ready for identity provider");
    }

    println!("{}", serde_json::to_string_pretty(&output.json)?);
    if !output.success {
        std::process::exit(2);
    }
    Ok(())
}
