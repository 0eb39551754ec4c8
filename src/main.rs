use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use worldbank_etl::config::{Settings, SNAPSHOT_KEYS};
use worldbank_etl::database_ops::{ensure_schema, fetch_countries};
use worldbank_etl::etl::{Etl, Stage};
use worldbank_etl::http::client::FetchClient;
use worldbank_etl::tracing::{init_tracing, DEFAULT_FILTER};
use worldbank_etl::util::db::ConnectionManager;
use worldbank_etl::util::env;

#[derive(Parser, Debug)]
#[command(name = "worldbank-etl", version, about = "World Bank indicator ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Run ingestion stages (all of them when no --stage is given)
    Run {
        /// Stage to run; repeatable
        #[arg(long = "stage", value_enum)]
        stages: Vec<Stage>,
        /// Override WORKERS
        #[arg(long)]
        workers: Option<usize>,
        /// Override DATE_RANGE (YYYY or YYYY:YYYY)
        #[arg(long)]
        date: Option<String>,
    },
    /// Create the tables (and schema) if they do not exist, then exit
    Schema,
    /// Print stored country info. Without --country or --all, COUNTRIES_OF_INTEREST is used
    Show {
        /// Country name, alias or ISO3 code (case-insensitive); repeatable
        #[arg(long = "country")]
        countries: Vec<String>,
        /// Every stored country, ordered by ISO3
        #[arg(long, conflicts_with = "countries")]
        all: bool,
        /// Emit JSON instead of text lines
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    init_tracing(DEFAULT_FILTER)?;
    let cli = Cli::parse();

    let mut settings = Settings::from_env()?;
    if let Commands::Run { workers, date, .. } = &cli.command {
        if let Some(w) = workers {
            settings.pipeline.workers = *w;
        }
        if let Some(d) = date {
            anyhow::ensure!(
                worldbank_etl::providers::worldbank::valid_date_range(d),
                "--date must be YYYY or YYYY:YYYY, got {d:?}"
            );
            settings.sources.date_range = Some(d.clone());
        }
        settings.validate()?;
    }
    env::preflight_snapshot("worldbank-etl", SNAPSHOT_KEYS);

    let mut manager = ConnectionManager::new(
        settings.database.target(),
        settings.database.connect_retries,
        settings.database.connect_delay,
    );
    let db = manager
        .connect()
        .await
        .context("could not connect to the database")?;

    let stages = match cli.command {
        Commands::Schema => {
            ensure_schema(&db, settings.database.schema.as_deref()).await?;
            info!("schema ready");
            manager.close().await?;
            return Ok(());
        }
        Commands::Show {
            countries,
            all,
            json,
        } => {
            let names = if all || !countries.is_empty() {
                countries
            } else {
                env::env_list("COUNTRIES_OF_INTEREST")
            };
            let found = fetch_countries(&db, &names).await?;
            manager.close().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&found)?);
            } else if found.is_empty() {
                println!("no country info found");
            } else {
                for (i, country) in found.iter().enumerate() {
                    println!("{:>3}. {country}", i + 1);
                }
            }
            return Ok(());
        }
        Commands::Run { stages, .. } => stages,
    };

    if settings.auto_schema {
        ensure_schema(&db, settings.database.schema.as_deref()).await?;
    }

    let client = FetchClient::http(&settings.http.user_agent, settings.http.retry)?;
    let mut etl = Etl::new(db, client, settings);

    let stop = etl.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight work");
            stop.stop();
        }
    });

    let report = etl.run(&stages).await;
    report.log();
    manager.close().await?;

    if report.has_failures() {
        warn!("run finished with failures");
    } else {
        info!("run finished");
    }
    Ok(())
}
