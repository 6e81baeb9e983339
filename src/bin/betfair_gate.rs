//! Operator tool for the Betfair gate.
//!
//! - Generate and validate TOML config
//! - Compute request weight offline
//! - Smoke-test credentials: login, one call, keep-alive, logout

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use betfair_gate::{
    init_logging, BetfairHttpClient, Dispatcher, GateConfig, KeepAliveOutcome, LogFormat,
    OperationKind, OperationParams, WeightValidator,
};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser)]
#[command(name = "betfair_gate")]
#[command(version, about = "Rate-limit, weight and session guard for the Betfair API", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "betfair_gate.toml", env = "BETFAIR_GATE_CONFIG")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Output format (pretty, json, compact)
    #[arg(long, value_enum)]
    log_format: Option<Format>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a sample config file
    GenerateConfig {
        /// Output file path
        #[arg(short, long, default_value = "betfair_gate.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Validate config without connecting
    ValidateConfig,
    /// Compute the weight of a request offline
    Cost {
        #[arg(value_enum)]
        operation: Operation,

        /// Market ids (comma separated)
        #[arg(long, value_delimiter = ',')]
        market_ids: Vec<String>,

        /// Stand-in market count when no ids are given
        #[arg(long)]
        markets: Option<usize>,

        #[arg(long)]
        max_results: Option<u32>,

        /// Market projections (comma separated)
        #[arg(long, value_delimiter = ',')]
        market_projection: Vec<String>,

        /// Price projections (comma separated)
        #[arg(long, value_delimiter = ',')]
        price_projection: Vec<String>,

        #[arg(long)]
        order_projection: Option<String>,

        #[arg(long)]
        match_projection: Option<String>,
    },
    /// Log in, make one call, keep the session alive once, then log out
    Check {
        #[arg(long, value_enum, default_value = "list-event-types")]
        operation: Operation,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Operation {
    ListEventTypes,
    ListCompetitions,
    ListEvents,
    ListMarketCatalogue,
    ListMarketBook,
    GetAccountFunds,
    GetAccountDetails,
}

impl From<Operation> for OperationKind {
    fn from(op: Operation) -> Self {
        match op {
            Operation::ListEventTypes => OperationKind::ListEventTypes,
            Operation::ListCompetitions => OperationKind::ListCompetitions,
            Operation::ListEvents => OperationKind::ListEvents,
            Operation::ListMarketCatalogue => OperationKind::ListMarketCatalogue,
            Operation::ListMarketBook => OperationKind::ListMarketBook,
            Operation::GetAccountFunds => OperationKind::GetAccountFunds,
            Operation::GetAccountDetails => OperationKind::GetAccountDetails,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Pretty,
    Json,
    Compact,
}

impl From<Format> for LogFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Pretty => LogFormat::Pretty,
            Format::Json => LogFormat::Json,
            Format::Compact => LogFormat::Compact,
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

fn generate_sample_config(output: &Path, force: bool) -> CliResult<()> {
    if output.exists() && !force {
        return Err(format!("{} already exists (use --force to overwrite)", output.display()).into());
    }
    let mut sample = GateConfig::default();
    sample.credentials.username = "your-username".to_string();
    sample.credentials.app_key = "your-app-key".to_string();

    let body = sample.to_toml_string()?;
    let header = "# Betfair gate configuration\n\
                  # Credentials may instead come from BETFAIR_USERNAME, BETFAIR_PASSWORD,\n\
                  # BETFAIR_APP_KEY, BETFAIR_CERT_FILE and BETFAIR_KEY_FILE.\n\n";
    std::fs::write(output, format!("{header}{body}"))?;
    println!("Wrote sample config to {}", output.display());
    Ok(())
}

fn load_config(cli: &Cli) -> CliResult<GateConfig> {
    let mut config = GateConfig::load(Some(&cli.config))?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.logging.stdout_format = format.into();
    }
    Ok(config)
}

#[allow(clippy::too_many_arguments)]
fn show_cost(
    config: &GateConfig,
    operation: Operation,
    market_ids: Vec<String>,
    markets: Option<usize>,
    max_results: Option<u32>,
    market_projection: Vec<String>,
    price_projection: Vec<String>,
    order_projection: Option<String>,
    match_projection: Option<String>,
) -> CliResult<()> {
    let kind = OperationKind::from(operation);
    let market_ids = if market_ids.is_empty() {
        (0..markets.unwrap_or(0))
            .map(|i| format!("1.{}", 100_000 + i))
            .collect()
    } else {
        market_ids
    };

    let mut params = OperationParams::default()
        .with_market_ids(market_ids.clone())
        .with_market_projection(market_projection.clone())
        .with_price_projection(price_projection.clone());
    params.max_results = max_results;
    params.order_projection = order_projection;
    params.match_projection = match_projection;

    let validator = WeightValidator::new(config.weight.budget);
    let weight = validator.weight(kind, &params)?;
    println!("{kind}: weight {weight} / budget {}", validator.budget());

    if weight > validator.budget() {
        println!("Request exceeds the budget.");
        if kind.is_market_data() && !market_ids.is_empty() {
            let per_request =
                validator.max_markets_per_request(&market_projection, &price_projection)?;
            let chunks =
                validator.split_markets_by_weight(&market_ids, &market_projection, &price_projection)?;
            println!(
                "Split into {} requests of at most {per_request} markets.",
                chunks.len()
            );
        }
    }
    Ok(())
}

async fn run_check(config: GateConfig, operation: Operation) -> CliResult<()> {
    config.validate()?;

    let client = Arc::new(BetfairHttpClient::new(
        &config.credentials,
        config.endpoints.clone(),
    )?);
    let dispatcher = Dispatcher::new(&config, client.clone(), client)?;
    let tasks = dispatcher.start_background();

    let kind = OperationKind::from(operation);
    let outcome = dispatcher.call(kind, &OperationParams::default()).await;

    match &outcome {
        Ok(response) => {
            let items = response.as_array().map(Vec::len);
            info!(operation = %kind, items = ?items, "Call succeeded");
            match dispatcher.session().keep_alive().await {
                KeepAliveOutcome::Refreshed => info!("Keep-alive succeeded"),
                other => warn!(outcome = ?other, "Keep-alive did not refresh the session"),
            }
        }
        Err(e) => warn!(operation = %kind, error = %e, "Call failed"),
    }

    tasks.shutdown().await;
    dispatcher.logout().await?;

    let metrics = dispatcher.metrics();
    info!(
        calls = metrics.calls,
        failures = metrics.failures,
        session = %metrics.session_status,
        "Check finished"
    );
    outcome?;
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> CliResult<()> {
    // Load .env file if it exists (before parsing CLI args)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    match &cli.command {
        Commands::GenerateConfig { output, force } => generate_sample_config(output, *force),
        Commands::ValidateConfig => {
            let config = load_config(&cli)?;
            config.validate()?;
            if config.credentials.uses_certificate() {
                config.credentials.verify_key_permissions()?;
            }
            println!("Configuration is valid:\n{:#?}", config);
            Ok(())
        }
        Commands::Cost {
            operation,
            market_ids,
            markets,
            max_results,
            market_projection,
            price_projection,
            order_projection,
            match_projection,
        } => {
            let config = load_config(&cli)?;
            show_cost(
                &config,
                *operation,
                market_ids.clone(),
                *markets,
                *max_results,
                market_projection.clone(),
                price_projection.clone(),
                order_projection.clone(),
                match_projection.clone(),
            )
        }
        Commands::Check { operation } => {
            let config = load_config(&cli)?;
            let _guards = init_logging(&config.logging, None)?;
            run_check(config, *operation).await
        }
    }
}
