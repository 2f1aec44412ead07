//! Command-line driver for cartable: loads `cartable.toml`, links every
//! configured school service and prints what they report.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use cartable_core::{AccountManager, ProviderRegistry, TracingSink};
use cartable_provider_pronote as pronote;
use cartable_provider_skolengo as skolengo;
use cartable_provider_turboself as turboself;
use chrono::NaiveDate;
use clap::Parser;
use reqwest::Client;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::CliConfig;
use crate::credentials::JsonFileStore;

mod commands;
mod config;
mod credentials;

#[derive(Parser)]
#[command(name = "cartable", about = "School-life aggregator", version)]
struct Cli {
    /// Path to configuration file
    #[arg(long, default_value = "cartable.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// List links, their session state and capabilities
    Links,
    /// Show the lessons of a week
    Timetable {
        /// Any day of the wanted week (defaults to today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// List grading and attendance periods
    Periods,
    /// Show grades, averages and the influence of each grade
    Grades {
        /// Period id (defaults to the current period)
        #[arg(long)]
        period: Option<String>,
    },
    /// Show absences, delays and punishments
    Attendance {
        /// Period id (defaults to the current period)
        #[arg(long)]
        period: Option<String>,
    },
    /// Show upcoming homework
    Homework {
        /// How many days ahead to look
        #[arg(long, default_value_t = 7)]
        days: u16,
    },
    /// Show school news
    News,
    /// Show the canteen menus of a week
    Canteen {
        /// Any day of the wanted week (defaults to today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Show canteen card balances
    Balance,
    /// List conversation threads
    Chats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let manager = connect(&cli.config).await?;

    match cli.command {
        Commands::Links => commands::links(&manager).await?,
        Commands::Timetable { date } => commands::timetable(&manager, date).await?,
        Commands::Periods => commands::periods(&manager).await?,
        Commands::Grades { period } => commands::grades(&manager, period.as_deref()).await?,
        Commands::Attendance { period } => {
            commands::attendance(&manager, period.as_deref()).await?;
        }
        Commands::Homework { days } => commands::homework(&manager, days).await?,
        Commands::News => commands::news(&manager).await?,
        Commands::Canteen { date } => commands::canteen(&manager, date).await?,
        Commands::Balance => commands::balance(&manager).await?,
        Commands::Chats => commands::chats(&manager).await?,
    }

    Ok(())
}

/// Build the account manager for the configured account and log every link in.
async fn connect(config_path: &Path) -> Result<AccountManager> {
    let config = CliConfig::load(config_path)?;
    info!("Loaded configuration from {}", config_path.display());

    let client = Client::builder().user_agent("cartable/0.1").build()?;
    let registry = Arc::new(ProviderRegistry::new(vec![
        pronote::provider(client.clone()),
        skolengo::provider(client.clone()),
        turboself::provider(client),
    ]));
    let store = Arc::new(JsonFileStore::open(&config.credentials_path).await?);

    let manager = AccountManager::new(
        config.account(),
        registry,
        store,
        Arc::new(TracingSink),
        config.federation.clone(),
    )
    .await;

    let failures = manager.discover().await;
    if !failures.is_empty() {
        warn!(count = failures.len(), "some links could not log in");
    }
    Ok(manager)
}
