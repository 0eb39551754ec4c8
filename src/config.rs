//! Runtime settings assembled from the environment (and `.env`).

use anyhow::{bail, Context, Result};
use std::time::Duration;

use crate::database_ops::upsert::DEFAULT_FACT_BATCH;
use crate::http::client::{RetryPolicy, DEFAULT_USER_AGENT};
use crate::normalization::aliases::SUPPLEMENTARY_ALIASES;
use crate::pipeline::{DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS};
use crate::providers::cpi::{CpiTableSpec, DEFAULT_CPI_URL};
use crate::providers::worldbank::{valid_date_range, DEFAULT_BASE_URL, DEFAULT_INDICATORS};
use crate::util::db::DbTarget;
use crate::util::env::{build_dsn, env_first, env_flag, env_list, env_opt, env_parse};

/// Keys shown (redacted) in the startup snapshot.
pub const SNAPSHOT_KEYS: &[&str] = &[
    "DATABASE_URL",
    "DB_HOST",
    "DB_PORT",
    "DB_NAME",
    "DB_USER",
    "DB_PASSWORD",
    "DB_SCHEMA",
    "DB_CONNECT_RETRIES",
    "WB_BASE_URL",
    "INDICATORS",
    "COUNTRIES",
    "DATE_RANGE",
    "WORKERS",
    "QUEUE_CAPACITY",
    "FACT_BATCH_SIZE",
    "CPI_URL",
    "HAPPINESS_CSV",
    "HTTP_MAX_DELAY_SECS",
    "COUNTRIES_OF_INTEREST",
    "AUTO_SCHEMA",
    "RUST_LOG",
];

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub schema: Option<String>,
    pub max_connections: u32,
    pub connect_retries: u32,
    pub connect_delay: Duration,
}

impl DatabaseSettings {
    pub fn target(&self) -> DbTarget {
        DbTarget {
            url: self.url.clone(),
            schema: self.schema.clone(),
            max_connections: self.max_connections,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub user_agent: String,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub fact_batch_size: usize,
    pub per_page: u32,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub wb_base_url: String,
    pub indicators: Vec<String>,
    /// Empty means every country.
    pub countries: Vec<String>,
    pub date_range: Option<String>,
    pub cpi_url: String,
    pub cpi_table: CpiTableSpec,
    pub happiness_csv: Option<String>,
    pub supplementary_aliases: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub http: HttpSettings,
    pub pipeline: PipelineSettings,
    pub sources: SourceSettings,
    pub auto_schema: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseSettings {
                url: "postgresql://localhost:5432/worldbank".to_string(),
                schema: None,
                max_connections: 1,
                connect_retries: 5,
                connect_delay: Duration::from_secs(3),
            },
            http: HttpSettings {
                user_agent: DEFAULT_USER_AGENT.to_string(),
                retry: RetryPolicy::default(),
            },
            pipeline: PipelineSettings {
                workers: DEFAULT_WORKERS,
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
                fact_batch_size: DEFAULT_FACT_BATCH,
                per_page: 1000,
            },
            sources: SourceSettings {
                wb_base_url: DEFAULT_BASE_URL.to_string(),
                indicators: DEFAULT_INDICATORS.iter().map(|s| s.to_string()).collect(),
                countries: Vec::new(),
                date_range: None,
                cpi_url: DEFAULT_CPI_URL.to_string(),
                cpi_table: CpiTableSpec::default(),
                happiness_csv: None,
                supplementary_aliases: SUPPLEMENTARY_ALIASES
                    .iter()
                    .map(|(a, c)| (a.to_string(), c.to_string()))
                    .collect(),
            },
            auto_schema: false,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let d = Settings::default();

        let url = match env_opt("DATABASE_URL") {
            Some(url) => url,
            None => build_dsn(
                &env_opt("DB_HOST").unwrap_or_else(|| "localhost".to_string()),
                env_parse("DB_PORT", 5432u16),
                &env_first(&["DB_NAME", "POSTGRES_DB"]).unwrap_or_else(|| "worldbank".to_string()),
                env_first(&["DB_USER", "POSTGRES_USER"]).as_deref(),
                env_first(&["DB_PASSWORD", "POSTGRES_PASSWORD"]).as_deref(),
            )
            .context("could not assemble a database URL from DB_* variables")?,
        };

        let date_range = env_opt("DATE_RANGE").map(|s| s.trim().to_string());
        if let Some(range) = &date_range {
            if !valid_date_range(range) {
                bail!("DATE_RANGE must be YYYY or YYYY:YYYY, got {range:?}");
            }
        }

        let indicators = match env_list("INDICATORS") {
            list if list.is_empty() => d.sources.indicators,
            list => list,
        };

        let settings = Settings {
            database: DatabaseSettings {
                url,
                schema: env_opt("DB_SCHEMA"),
                max_connections: env_parse("DB_MAX_CONNS", d.database.max_connections),
                connect_retries: env_parse("DB_CONNECT_RETRIES", d.database.connect_retries),
                connect_delay: Duration::from_secs(env_parse("DB_CONNECT_DELAY_SECS", 3u64)),
            },
            http: HttpSettings {
                user_agent: env_opt("HTTP_USER_AGENT").unwrap_or(d.http.user_agent),
                retry: RetryPolicy {
                    max_attempts: env_parse("HTTP_MAX_ATTEMPTS", d.http.retry.max_attempts),
                    base_backoff: Duration::from_millis(env_parse("HTTP_BACKOFF_MS", 1000u64)),
                    timeout: Duration::from_secs(env_parse("HTTP_TIMEOUT_SECS", 30u64)),
                    max_delay: Duration::from_secs(env_parse("HTTP_MAX_DELAY_SECS", 60u64)),
                },
            },
            pipeline: PipelineSettings {
                workers: env_parse("WORKERS", d.pipeline.workers),
                queue_capacity: env_parse("QUEUE_CAPACITY", d.pipeline.queue_capacity),
                fact_batch_size: env_parse("FACT_BATCH_SIZE", d.pipeline.fact_batch_size),
                per_page: env_parse("PER_PAGE", d.pipeline.per_page),
            },
            sources: SourceSettings {
                wb_base_url: env_opt("WB_BASE_URL").unwrap_or(d.sources.wb_base_url),
                indicators,
                countries: env_list("COUNTRIES")
                    .into_iter()
                    .map(|c| c.to_ascii_uppercase())
                    .collect(),
                date_range,
                cpi_url: env_opt("CPI_URL").unwrap_or(d.sources.cpi_url),
                cpi_table: d.sources.cpi_table,
                happiness_csv: env_opt("HAPPINESS_CSV"),
                supplementary_aliases: d.sources.supplementary_aliases,
            },
            auto_schema: env_flag("AUTO_SCHEMA", false),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.workers == 0 {
            bail!("WORKERS must be at least 1");
        }
        if self.pipeline.queue_capacity == 0 {
            bail!("QUEUE_CAPACITY must be at least 1");
        }
        if self.pipeline.fact_batch_size == 0 {
            bail!("FACT_BATCH_SIZE must be at least 1");
        }
        if self.http.retry.max_attempts == 0 {
            bail!("HTTP_MAX_ATTEMPTS must be at least 1");
        }
        url::Url::parse(&self.sources.wb_base_url)
            .with_context(|| format!("WB_BASE_URL is not a url: {}", self.sources.wb_base_url))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let s = Settings::default();
        s.validate().unwrap();
        assert_eq!(s.pipeline.queue_capacity, 16);
        assert_eq!(s.pipeline.fact_batch_size, 5_000);
        assert_eq!(s.database.connect_retries, 5);
        assert!(s.sources.indicators.contains(&"SP.POP.TOTL".to_string()));
        assert!(s
            .sources
            .supplementary_aliases
            .iter()
            .any(|(a, c)| a == "Czech Republic" && c == "CZE"));
    }

    #[test]
    fn zero_workers_rejected() {
        let mut s = Settings::default();
        s.pipeline.workers = 0;
        assert!(s.validate().is_err());
    }
}
