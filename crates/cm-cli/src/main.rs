use anyhow::Result;
use clap::{Parser, Subcommand};
use cm_analysis::config::AnalysisRuntimeConfig;
use cm_core::service_config;
use cm_core::store::{PgStore, ServiceConfigRepository, Store};
use serde_json::{json, Value};

const CLI_NAME: &str = "cm-cli";

#[derive(Parser)]
#[command(name = "cm", version, about = "ContraMind service CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    UserApi,
    AdminApi,
    AnalysisWorker,
    Migrate,
    Admin {
        #[command(subcommand)]
        command: AdminCommand,
    },
    Prompts {
        #[command(subcommand)]
        command: PromptsCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum AdminCommand {
    /// Grant the admin role to a registered account
    Promote {
        #[arg(long)]
        email: String,
    },
}

#[derive(Subcommand)]
enum PromptsCommand {
    /// Upsert the built-in prompt library
    Seed,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Store default runtime configs for services that have none
    Seed,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::UserApi => {
            let config = cm_user_api::load_config()?;
            cm_user_api::run(config).await?;
        }
        Commands::AdminApi => {
            let config = cm_admin_api::load_config()?;
            cm_admin_api::run(config).await?;
        }
        Commands::AnalysisWorker => {
            let config = cm_analysis::load_config()?;
            cm_analysis::run(config).await?;
        }
        Commands::Migrate => {
            let store = connect().await?;
            store.migrate().await?;
        }
        Commands::Admin { command } => {
            let store = connect().await?;
            match command {
                AdminCommand::Promote { email } => {
                    let promoted = cm_core::admin::promote_admin(&store, &email).await?;
                    print_json(json!({ "email": email.trim(), "promoted": promoted }))?;
                }
            }
        }
        Commands::Prompts { command } => {
            let store = connect().await?;
            match command {
                PromptsCommand::Seed => {
                    let seeded = cm_core::admin::seed_prompt_library(&store).await?;
                    print_json(json!({ "seeded": seeded }))?;
                }
            }
        }
        Commands::Config { command } => {
            let store = connect().await?;
            match command {
                ConfigCommand::Seed => {
                    let defaults = [
                        (service_config::USER_API_SERVICE, cm_user_api::default_user_config()),
                        (
                            service_config::ANALYSIS_SERVICE,
                            AnalysisRuntimeConfig::default_json(),
                        ),
                    ];
                    let mut seeded = Vec::new();
                    for (service, config_json) in defaults {
                        if seed_service_config(&store, service, config_json).await? {
                            seeded.push(service);
                        }
                    }
                    print_json(json!({ "seeded": seeded }))?;
                }
            }
        }
    }

    Ok(())
}

async fn connect() -> Result<PgStore> {
    cm_core::logging::init(CLI_NAME);
    let database_url = cm_core::config::required_env("DATABASE_URL")?;
    PgStore::connect(&database_url, 2).await
}

/// Writes `config_json` as version 1 unless a row already exists.
async fn seed_service_config(store: &dyn Store, service: &str, config_json: Value) -> Result<bool> {
    if store.load_service_config(service).await?.is_some() {
        tracing::info!(service, "service config already present");
        return Ok(false);
    }
    store
        .put_service_config(service, config_json, Some(0), CLI_NAME, None)
        .await?;
    tracing::info!(service, "service config seeded");
    Ok(true)
}

fn print_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string(&value)?);
    Ok(())
}
