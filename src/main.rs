//! gmail-mcp-rs: Multi-account Gmail MCP server over stdio
//!
//! This server exposes Gmail send/search/read/label operations via the Model
//! Context Protocol (MCP) over stdio. Any number of Google accounts can be
//! registered; each keeps its own OAuth credential, refreshed transparently
//! before use.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading, CLI and stdio serving
//! - [`config`]: Environment-driven OAuth client and server settings
//! - [`errors`]: Application error model with MCP error mapping
//! - [`store`]: Per-account credential files and the account index
//! - [`registry`]: Account registry with default-account invariants
//! - [`refresh`]: Serialized access-token refresh with retry/backoff
//! - [`selector`]: Explicit-or-default account resolution
//! - [`consent`]: Browser consent flow with a loopback callback listener
//! - [`gmail`]: Gmail REST client
//! - [`compose`]: Outgoing message validation and RFC 5322 assembly
//! - [`mime`]: Message parsing, header/body extraction, and sanitization
//! - [`models`]: Input/output DTOs and schema-bearing types
//! - [`server`]: MCP tool handlers with validation and account orchestration

mod compose;
mod config;
mod consent;
mod errors;
mod gmail;
mod mime;
mod models;
mod refresh;
mod registry;
mod selector;
mod server;
mod store;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use config::ServerConfig;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::consent::LoopbackConsentFlow;
use crate::gmail::{GmailClient, build_http_client};
use crate::models::{AccountEmailInput, AccountList, AddAccountInput};
use crate::refresh::{GoogleTokenEndpoint, RetryPolicy, TokenRefreshGuard};
use crate::registry::AccountRegistry;
use crate::server::GmailMcpServer;
use crate::store::CredentialStore;

#[derive(Parser)]
#[command(name = "gmail-mcp-rs")]
#[command(about = "Multi-account Gmail MCP server over stdio")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve MCP over stdio (default)
    Serve,
    /// Manage registered accounts without an MCP client
    Accounts {
        #[command(subcommand)]
        command: AccountCommand,
    },
}

#[derive(Subcommand)]
enum AccountCommand {
    /// List registered accounts
    List,
    /// Authorize a new account in the browser
    Add {
        /// Make the new account the default
        #[arg(long)]
        default: bool,
    },
    /// Remove an account and delete its credential
    Remove { email: String },
    /// Make an account the default
    SetDefault { email: String },
}

/// Application entry point
///
/// Initializes tracing from environment, loads config, and either serves the
/// MCP server over stdio or runs one account-management command. In serve
/// mode this process expects to be spawned by an MCP client via `stdio`
/// transport.
///
/// # Environment Variables
///
/// See [`ServerConfig::load_from_env`] for full configuration options.
///
/// # Example
///
/// ```no_run
/// GMAIL_MCP_CLIENT_ID=1234.apps.googleusercontent.com \
/// GMAIL_MCP_CLIENT_SECRET=secret \
/// cargo run -- accounts add
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let server = build_server(ServerConfig::load_from_env()?).await?;
            tracing::info!("serving MCP over stdio");
            let service = server.serve(stdio()).await?;
            service.waiting().await?;
        }
        Command::Accounts {
            command: AccountCommand::List,
        } => list_accounts().await?,
        Command::Accounts { command } => {
            let server = build_server(ServerConfig::load_from_env()?).await?;
            run_accounts(&server, command).await?;
        }
    }
    Ok(())
}

/// List accounts from the data directory alone; no OAuth client is needed
async fn list_accounts() -> errors::AppResult<()> {
    let registry = AccountRegistry::load(CredentialStore::new(config::data_dir_from_env()?)).await?;
    print_json(&AccountList::from_entries(&registry.list().await))
}

/// Wire the server's components from config
async fn build_server(config: ServerConfig) -> errors::AppResult<GmailMcpServer> {
    let http = build_http_client(config.http_timeout())?;
    let mail = GmailClient::new(http.clone(), &config.api_base_url)?;
    let endpoint = GoogleTokenEndpoint::new(http, config.oauth.token_url.clone());
    let guard = TokenRefreshGuard::new(Arc::new(endpoint), RetryPolicy::from_config(&config));
    let registry = AccountRegistry::load(CredentialStore::new(config.data_dir.clone())).await?;
    let consent = LoopbackConsentFlow::new(config.oauth.clone(), config.consent_timeout());
    tracing::debug!(
        data_dir = %config.data_dir.display(),
        accounts = registry.list().await.len(),
        "account registry loaded"
    );

    Ok(GmailMcpServer::new(
        config,
        Arc::new(registry),
        Arc::new(guard),
        Arc::new(mail),
        Arc::new(consent),
    ))
}

async fn run_accounts(server: &GmailMcpServer, command: AccountCommand) -> errors::AppResult<()> {
    match command {
        AccountCommand::List => list_accounts().await,
        AccountCommand::Add { default } => {
            let input = AddAccountInput {
                make_default: default.then_some(true),
            };
            print_json(&server.add_account_impl(input).await?)
        }
        AccountCommand::Remove { email } => {
            print_json(&server.remove_account_impl(AccountEmailInput { email }).await?)
        }
        AccountCommand::SetDefault { email } => {
            print_json(&server.set_default_account_impl(AccountEmailInput { email }).await?)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> errors::AppResult<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| errors::AppError::Internal(format!("cannot serialize output: {e}")))?;
    println!("{text}");
    Ok(())
}
