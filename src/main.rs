//! IdP Gateway - operator CLI
//!
//! Checks the identity provider and inspects the degraded-mode store.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::error;

use idp_gateway::{
    cli::{Cli, Command, FallbackCommand},
    config::Config,
    fallback::DegradedStore,
    idp::IdpContext,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Check { json } => run_check(&config, json).await,
        Command::Fallback(cmd) => run_fallback(&config, cmd).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Resolve the endpoint, fetch an admin token and report
async fn run_check(config: &Config, json: bool) -> anyhow::Result<ExitCode> {
    let idp = IdpContext::new(config).context("building IdP context")?;

    let resolved = idp.resolver().resolve().await;
    let token = idp.tokens().get_token().await;
    let report = idp.report();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Candidates:");
        for candidate in &report.candidates {
            println!("  • {candidate}");
        }
        match &resolved {
            Ok(endpoint) => println!("✅ Endpoint: {} (token endpoint {})", endpoint.base_url, endpoint.token_endpoint),
            Err(e) => println!("❌ Endpoint: {e}"),
        }
        match (&token, &report.admin_token_expires_at) {
            (Ok(_), Some(expires_at)) => println!("✅ Admin token: cached until {expires_at}"),
            (Ok(_), None) => println!("✅ Admin token: acquired"),
            (Err(e), _) => println!("❌ Admin token: {e}"),
        }
        println!("Discovery requests sent: {}", report.discovery_requests);
    }

    idp.shutdown();
    Ok(if resolved.is_ok() && token.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Inspect the degraded store
async fn run_fallback(config: &Config, cmd: FallbackCommand) -> anyhow::Result<ExitCode> {
    let store = DegradedStore::open(&config.fallback.path, false)
        .await
        .with_context(|| format!("opening {}", config.fallback.path.display()))?;

    match cmd {
        FallbackCommand::List { owner } => {
            let records = match owner.as_deref() {
                Some(owner) => store.list(owner).await?,
                None => store.all().await?,
            };
            println!("{}", serde_json::to_string_pretty(&records)?);
            eprintln!("{} record(s) in {}", records.len(), store.path().display());
        }
        FallbackCommand::Delete { id } => {
            if store.delete(&id).await? {
                println!("✅ Deleted {id}");
            } else {
                println!("No record with id {id}");
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
