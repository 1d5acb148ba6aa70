//! graphbroker - command-line front end.
//!
//! `graphbroker token` prints a truncated access token; `graphbroker probe`
//! checks which Microsoft Graph permissions the token actually carries.

#![deny(clippy::all)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};

use graphbroker::config::Config;
use graphbroker::graph::{self, GraphClient};
use graphbroker::{logging, BrokerError, TokenBroker};

/// Characters of the token shown on the console.
const TOKEN_PREVIEW_LEN: usize = 40;

#[derive(Parser)]
#[command(name = "graphbroker", version, about = "Microsoft identity token broker")]
struct Cli {
    /// Configuration file (defaults to ./graphbroker.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Acquire an access token and print a preview of it
    Token {
        /// Allow interactive sign-in in delegated mode
        #[arg(long)]
        interactive: bool,

        /// Scope to request (repeatable); defaults depend on the client mode
        #[arg(long = "scope")]
        scopes: Vec<String>,
    },
    /// Call a few Graph endpoints and report which permissions are granted
    Probe {
        /// Allow interactive sign-in in delegated mode
        #[arg(long)]
        interactive: bool,
    },
}

fn main() -> ExitCode {
    // Load .env file (if present) before anything else
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    logging::init(&config.logging, &binary_name());
    info!("Starting graphbroker v{}", env!("CARGO_PKG_VERSION"));

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create Tokio runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    let command = cli.command.unwrap_or(Command::Token {
        interactive: true,
        scopes: Vec::new(),
    });

    let result = runtime.block_on(async {
        match command {
            Command::Token { interactive, scopes } => run_token(&config, interactive, &scopes).await,
            Command::Probe { interactive } => run_probe(&config, interactive).await,
        }
    });

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            match e.downcast_ref::<BrokerError>() {
                Some(broker_error) => eprintln!("{}\n  {:#}", broker_error.user_message(), e),
                None => eprintln!("Error: {:#}", e),
            }
            ExitCode::from(1)
        }
    }
}

async fn run_token(config: &Config, interactive: bool, scopes: &[String]) -> Result<ExitCode> {
    let mut broker = TokenBroker::from_config(config)?;
    println!("Client mode: {}", broker.mode());

    let scopes: Vec<&str> = scopes.iter().map(String::as_str).collect();
    let token = broker
        .get_token(&scopes, interactive)
        .await
        .context("Failed to acquire access token")?;

    match token {
        Some(token) => {
            if let Some(account) = token.account() {
                println!("Account: {}", account.username);
            }
            println!("Token acquired (expires {})", token.expires_at().to_rfc3339());
            println!("{}", token.preview(TOKEN_PREVIEW_LEN));
            Ok(ExitCode::SUCCESS)
        }
        None => {
            println!("No cached token. Run with --interactive to sign in.");
            Ok(ExitCode::from(2))
        }
    }
}

async fn run_probe(config: &Config, interactive: bool) -> Result<ExitCode> {
    let mut broker = TokenBroker::from_config(config)?;
    let scopes = graph::scopes_for(broker.mode());
    println!("Client mode: {}; requesting scopes: {}", broker.mode(), scopes.join(" "));

    let token = match broker.get_token(scopes, interactive).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            println!("No access token obtained. Try running with --interactive for delegated clients or check your app credentials.");
            return Ok(ExitCode::from(2));
        }
        Err(BrokerError::Acquisition(failure)) => {
            println!("No access token obtained: {}", failure);
            return Ok(ExitCode::from(2));
        }
        Err(e) => return Err(e.into()),
    };

    println!("Access token obtained, running endpoint checks...\n");

    let client = GraphClient::new().context("Failed to create Graph client")?;
    for outcome in client.probe_all(&token).await {
        println!("{}\n", outcome);
    }
    Ok(ExitCode::SUCCESS)
}

fn binary_name() -> String {
    std::env::args()
        .next()
        .as_deref()
        .map(Path::new)
        .and_then(Path::file_stem)
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())
}
