use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use feature_ledger_api::{
    AddFeatureRequest, FeatureLedgerApi, RecordFeatureUseRequest, API_CONTRACT_VERSION,
};
use feature_ledger_core::ShopperContext;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "fl")]
#[command(about = "Feature Ledger CLI")]
struct Cli {
    #[arg(long, default_value = "./feature_ledger.sqlite3")]
    db: PathBuf,

    /// Currency of a cart created on first feature use.
    #[arg(long, default_value = "EUR")]
    currency: String,

    /// Country of a cart created on first feature use, also used as shipping country.
    #[arg(long, default_value = "DE")]
    country: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
    Cart {
        #[command(subcommand)]
        command: CartCommand,
    },
    Features {
        #[command(subcommand)]
        command: FeaturesCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum CatalogCommand {
    Add(CatalogAddArgs),
    List,
    Remove(KeyArgs),
}

#[derive(Debug, Args)]
struct CatalogAddArgs {
    #[arg(long)]
    key: String,
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long)]
    id: Option<String>,
}

#[derive(Debug, Args)]
struct KeyArgs {
    #[arg(long)]
    key: String,
}

#[derive(Debug, Subcommand)]
enum CartCommand {
    Show,
}

#[derive(Debug, Subcommand)]
enum FeaturesCommand {
    Use(KeyArgs),
    Used,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let shopper = ShopperContext::new(cli.currency, cli.country)?;
    let api = FeatureLedgerApi::new(cli.db, shopper);
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Catalog { command } => run_catalog(command, &api),
        Command::Cart { command } => run_cart(&command, &api),
        Command::Features { command } => run_features(command, &api),
    }
}

fn run_db(command: DbCommand, api: &FeatureLedgerApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_catalog(command: CatalogCommand, api: &FeatureLedgerApi) -> Result<()> {
    match command {
        CatalogCommand::Add(args) => {
            let feature = api.add_feature(AddFeatureRequest {
                key: args.key,
                name: args.name,
                description: args.description,
                id: args.id,
            })?;
            emit_json(serde_json::json!({ "feature": feature }))
        }
        CatalogCommand::List => {
            let features = api.list_features()?;
            emit_json(serde_json::json!({
                "count": features.len(),
                "features": features
            }))
        }
        CatalogCommand::Remove(args) => {
            let result = api.remove_feature(&args.key)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize remove result")?)
        }
    }
}

fn run_cart(command: &CartCommand, api: &FeatureLedgerApi) -> Result<()> {
    match command {
        CartCommand::Show => {
            let cart = api.show_cart()?;
            emit_json(serde_json::json!({ "cart": cart }))
        }
    }
}

fn run_features(command: FeaturesCommand, api: &FeatureLedgerApi) -> Result<()> {
    match command {
        FeaturesCommand::Use(args) => {
            let outcome = api.record_feature_use(&RecordFeatureUseRequest { key: args.key })?;
            emit_json(serde_json::json!({
                "api_contract_version": API_CONTRACT_VERSION,
                "outcome": outcome
            }))
        }
        FeaturesCommand::Used => {
            let view = api.used_features()?;
            emit_json(serde_json::to_value(&view).context("failed to serialize used features")?)
        }
    }
}
