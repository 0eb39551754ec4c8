use tracing::{info, instrument};

use crate::error::PersistenceError;
use crate::util::db::{Backend, Db};

/// Portable DDL: runs unchanged on PostgreSQL and SQLite.
const TABLES: &[(&str, &str)] = &[
    (
        "regions",
        "CREATE TABLE IF NOT EXISTS regions (
            region_id TEXT PRIMARY KEY,
            region_name TEXT NOT NULL
        )",
    ),
    (
        "countries",
        "CREATE TABLE IF NOT EXISTS countries (
            iso3 TEXT PRIMARY KEY,
            iso2 TEXT,
            name TEXT NOT NULL,
            region_id TEXT REFERENCES regions (region_id),
            income_level TEXT,
            capital_city TEXT,
            longitude DOUBLE PRECISION,
            latitude DOUBLE PRECISION,
            data_source TEXT,
            update_count INTEGER NOT NULL DEFAULT 0,
            last_updated TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
    ),
    (
        "country_aliases",
        "CREATE TABLE IF NOT EXISTS country_aliases (
            alias TEXT PRIMARY KEY,
            iso3 TEXT NOT NULL REFERENCES countries (iso3)
        )",
    ),
    (
        "sources",
        "CREATE TABLE IF NOT EXISTS sources (
            source_id TEXT PRIMARY KEY,
            source_name TEXT NOT NULL,
            source_url TEXT
        )",
    ),
    (
        "topics",
        "CREATE TABLE IF NOT EXISTS topics (
            topic_id TEXT PRIMARY KEY,
            topic_name TEXT NOT NULL,
            topic_note TEXT
        )",
    ),
    (
        "indicators",
        "CREATE TABLE IF NOT EXISTS indicators (
            indicator_id TEXT PRIMARY KEY,
            indicator_name TEXT NOT NULL,
            source_id TEXT,
            description TEXT
        )",
    ),
    (
        "indicator_topics",
        "CREATE TABLE IF NOT EXISTS indicator_topics (
            indicator_id TEXT NOT NULL,
            topic_id TEXT NOT NULL,
            PRIMARY KEY (indicator_id, topic_id)
        )",
    ),
    (
        "indicator_values",
        "CREATE TABLE IF NOT EXISTS indicator_values (
            indicator_id TEXT NOT NULL,
            iso3 TEXT NOT NULL,
            year INTEGER NOT NULL,
            value DOUBLE PRECISION NOT NULL,
            PRIMARY KEY (indicator_id, iso3, year)
        )",
    ),
];

fn valid_schema_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name.starts_with(|c: char| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Create every table if absent. On Postgres, `schema` is created first; the session
/// `search_path` set by the connection manager makes the unqualified names land in it.
#[instrument(skip(db))]
pub async fn ensure_schema(db: &Db, schema: Option<&str>) -> Result<(), PersistenceError> {
    if let (Backend::Postgres, Some(schema)) = (db.backend(), schema) {
        if !valid_schema_name(schema) {
            return Err(PersistenceError::new(
                "schema",
                sqlx::Error::Configuration(format!("invalid schema name {schema:?}").into()),
            ));
        }
        db.execute_raw(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
            .await
            .map_err(|e| PersistenceError::new("schema", e))?;
    }
    for &(table, ddl) in TABLES {
        db.execute_raw(ddl)
            .await
            .map_err(|e| PersistenceError::new(table, e))?;
    }
    info!(tables = TABLES.len(), backend = ?db.backend(), "schema ensured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::db::connect_sqlite_memory;

    #[test]
    fn schema_names_are_plain_identifiers() {
        assert!(valid_schema_name("thi_miniproject"));
        assert!(!valid_schema_name("bad;drop"));
        assert!(!valid_schema_name("1abc"));
        assert!(!valid_schema_name(""));
    }

    #[tokio::test]
    async fn ensure_schema_is_repeatable() {
        let db = connect_sqlite_memory().await.unwrap();
        ensure_schema(&db, None).await.unwrap();
        ensure_schema(&db, None).await.unwrap();
        let tables = db
            .fetch_column("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .await
            .unwrap();
        assert_eq!(tables.len(), TABLES.len());
        assert!(tables.contains(&"indicator_values".to_string()));
    }
}
