//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Resilience gateway for a Keycloak-compatible identity provider
#[derive(Parser, Debug)]
#[command(name = "idp-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "IDP_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "IDP_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "IDP_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve the IdP endpoint, acquire an admin token and print a report
    Check {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect the degraded-mode store
    #[command(subcommand)]
    Fallback(FallbackCommand),
}

/// Degraded store subcommands
#[derive(Subcommand, Debug)]
pub enum FallbackCommand {
    /// List stored records
    List {
        /// Only records owned by this identity
        #[arg(long)]
        owner: Option<String>,
    },

    /// Delete a stored record
    Delete {
        /// Record id
        #[arg(required = true)]
        id: String,
    },
}
