use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use tracing::{info, instrument};

use crate::database_ops::tables::{ConflictPolicy, Table};
use crate::error::PersistenceError;
use crate::models::{
    AliasRow, CountryInfo, CountryRow, FactRow, IndicatorRow, IndicatorTopicRow, RegionRow, SourceRow,
    TopicRow,
};
use crate::normalization::aliases::normalize_name;
use crate::pipeline::ChunkConsumer;
use crate::util::db::{Db, SqlValue};

pub const DATA_SOURCE_WORLDBANK: &str = "WorldBank API";
pub const DEFAULT_FACT_BATCH: usize = 5_000;

/// A row that belongs to exactly one allow-listed table.
pub trait TableRow {
    type Key: Hash + Eq;
    const TABLE: Table;

    fn key(&self) -> Self::Key;
    /// Values in [`Table::columns`] order.
    fn values(&self) -> Vec<SqlValue>;
}

impl TableRow for RegionRow {
    type Key = String;
    const TABLE: Table = Table::Regions;

    fn key(&self) -> String {
        self.region_id.clone()
    }

    fn values(&self) -> Vec<SqlValue> {
        vec![
            self.region_id.as_str().into(),
            self.region_name.as_str().into(),
        ]
    }
}

/// Countries carry the `data_source` tag on every write.
impl TableRow for CountryRow {
    type Key = String;
    const TABLE: Table = Table::Countries;

    fn key(&self) -> String {
        self.iso3.clone()
    }

    fn values(&self) -> Vec<SqlValue> {
        vec![
            self.iso3.as_str().into(),
            self.iso2.clone().into(),
            self.name.as_str().into(),
            self.region_id.clone().into(),
            self.income_level.clone().into(),
            self.capital_city.clone().into(),
            self.longitude.into(),
            self.latitude.into(),
            DATA_SOURCE_WORLDBANK.into(),
        ]
    }
}

impl TableRow for AliasRow {
    type Key = String;
    const TABLE: Table = Table::CountryAliases;

    fn key(&self) -> String {
        self.alias.clone()
    }

    fn values(&self) -> Vec<SqlValue> {
        vec![self.alias.as_str().into(), self.iso3.as_str().into()]
    }
}

impl TableRow for SourceRow {
    type Key = String;
    const TABLE: Table = Table::Sources;

    fn key(&self) -> String {
        self.source_id.clone()
    }

    fn values(&self) -> Vec<SqlValue> {
        vec![
            self.source_id.as_str().into(),
            self.source_name.as_str().into(),
            self.source_url.clone().into(),
        ]
    }
}

impl TableRow for TopicRow {
    type Key = String;
    const TABLE: Table = Table::Topics;

    fn key(&self) -> String {
        self.topic_id.clone()
    }

    fn values(&self) -> Vec<SqlValue> {
        vec![
            self.topic_id.as_str().into(),
            self.topic_name.as_str().into(),
            self.topic_note.clone().into(),
        ]
    }
}

impl TableRow for IndicatorRow {
    type Key = String;
    const TABLE: Table = Table::Indicators;

    fn key(&self) -> String {
        self.indicator_id.clone()
    }

    fn values(&self) -> Vec<SqlValue> {
        vec![
            self.indicator_id.as_str().into(),
            self.indicator_name.as_str().into(),
            self.source_id.clone().into(),
            self.description.clone().into(),
        ]
    }
}

impl TableRow for IndicatorTopicRow {
    type Key = (String, String);
    const TABLE: Table = Table::IndicatorTopics;

    fn key(&self) -> (String, String) {
        (self.indicator_id.clone(), self.topic_id.clone())
    }

    fn values(&self) -> Vec<SqlValue> {
        vec![
            self.indicator_id.as_str().into(),
            self.topic_id.as_str().into(),
        ]
    }
}

impl TableRow for FactRow {
    type Key = (String, String, i32);
    const TABLE: Table = Table::IndicatorValues;

    fn key(&self) -> (String, String, i32) {
        (self.indicator_id.clone(), self.iso3.clone(), self.year)
    }

    fn values(&self) -> Vec<SqlValue> {
        vec![
            self.indicator_id.as_str().into(),
            self.iso3.as_str().into(),
            self.year.into(),
            self.value.into(),
        ]
    }
}

/// Keep the last occurrence of each key, in order of those last occurrences.
/// A single `INSERT ... ON CONFLICT` may not touch the same target row twice.
pub fn dedupe_last<R: TableRow>(rows: &[R]) -> Vec<&R> {
    let mut seen: HashSet<R::Key> = HashSet::with_capacity(rows.len());
    let mut kept: Vec<&R> = rows.iter().rev().filter(|r| seen.insert(r.key())).collect();
    kept.reverse();
    kept
}

/// Keep the first occurrence of each key, in input order.
pub fn dedupe_first<R: TableRow>(rows: &[R]) -> Vec<&R> {
    let mut seen: HashSet<R::Key> = HashSet::with_capacity(rows.len());
    rows.iter().filter(|r| seen.insert(r.key())).collect()
}

/// Write one logical batch of `R` in a single transaction. Insert-only tables keep the first
/// row per key, as `DO NOTHING` does against stored rows; updating tables keep the last.
pub async fn write_rows<R: TableRow>(db: &Db, rows: &[R]) -> Result<u64, PersistenceError> {
    if rows.is_empty() {
        return Ok(0);
    }
    let kept = match R::TABLE.policy() {
        ConflictPolicy::Ignore => dedupe_first(rows),
        ConflictPolicy::Overwrite(_) | ConflictPolicy::TrackChanges { .. } => dedupe_last(rows),
    };
    let values: Vec<Vec<SqlValue>> = kept.into_iter().map(R::values).collect();
    db.execute_many(&R::TABLE, &values).await
}

/// Change-gated country upsert; returns inserted + actually updated rows.
#[instrument(skip_all, fields(rows = rows.len()))]
pub async fn upsert_countries(db: &Db, rows: &[CountryRow]) -> Result<u64, PersistenceError> {
    let n = write_rows(db, rows).await?;
    info!(written = n, "countries upserted");
    Ok(n)
}

pub async fn insert_regions(db: &Db, rows: &[RegionRow]) -> Result<u64, PersistenceError> {
    write_rows(db, rows).await
}

pub async fn insert_aliases(db: &Db, rows: &[AliasRow]) -> Result<u64, PersistenceError> {
    write_rows(db, rows).await
}

pub async fn insert_sources(db: &Db, rows: &[SourceRow]) -> Result<u64, PersistenceError> {
    write_rows(db, rows).await
}

pub async fn insert_topics(db: &Db, rows: &[TopicRow]) -> Result<u64, PersistenceError> {
    write_rows(db, rows).await
}

pub async fn insert_indicators(db: &Db, rows: &[IndicatorRow]) -> Result<u64, PersistenceError> {
    write_rows(db, rows).await
}

pub async fn insert_indicator_topics(
    db: &Db,
    rows: &[IndicatorTopicRow],
) -> Result<u64, PersistenceError> {
    write_rows(db, rows).await
}

/// Fact upsert in independently committed sub-batches of `sub_batch` rows. On error the
/// failing sub-batch is rolled back; earlier sub-batches stay committed.
#[instrument(skip_all, fields(rows = rows.len(), sub_batch = sub_batch))]
pub async fn upsert_facts(
    db: &Db,
    rows: &[FactRow],
    sub_batch: usize,
) -> Result<u64, PersistenceError> {
    let mut written = 0;
    for chunk in rows.chunks(sub_batch.max(1)) {
        written += write_rows(db, chunk).await?;
    }
    Ok(written)
}

/// ISO3 codes of every stored country.
pub async fn load_country_codes(db: &Db) -> Result<HashSet<String>, PersistenceError> {
    let codes = db
        .fetch_column("SELECT iso3 FROM countries")
        .await
        .map_err(|e| PersistenceError::new(Table::Countries.name(), e))?;
    Ok(codes.into_iter().collect())
}

/// alias -> iso3.
pub async fn load_aliases(db: &Db) -> Result<HashMap<String, String>, PersistenceError> {
    let pairs = db
        .fetch_pairs("SELECT alias, iso3 FROM country_aliases")
        .await
        .map_err(|e| PersistenceError::new(Table::CountryAliases.name(), e))?;
    Ok(pairs.into_iter().collect())
}

type CountryInfoTuple = (
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<f64>,
    Option<f64>,
    Option<String>,
    i32,
    String,
);

const COUNTRY_INFO_SELECT: &str = "SELECT c.iso3, c.iso2, c.name, c.region_id, r.region_name, \
     c.income_level, c.capital_city, c.longitude, c.latitude, c.data_source, c.update_count, \
     CAST(c.last_updated AS TEXT) \
     FROM countries c LEFT JOIN regions r ON r.region_id = c.region_id";

fn placeholders(from: usize, count: usize) -> String {
    (from..from + count)
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Stored countries matching any of `names`, ordered by name. A name matches its country
/// case-insensitively through the official name, any alias, or the ISO3 code. With no names,
/// every country is returned ordered by ISO3.
#[instrument(skip(db))]
pub async fn fetch_countries(
    db: &Db,
    names: &[String],
) -> Result<Vec<CountryInfo>, PersistenceError> {
    let wanted: Vec<String> = names
        .iter()
        .map(|n| normalize_name(n))
        .filter(|n| !n.is_empty())
        .collect();

    let (sql, params) = if wanted.is_empty() {
        (format!("{COUNTRY_INFO_SELECT} ORDER BY c.iso3"), Vec::new())
    } else {
        let n = wanted.len();
        let sql = format!(
            "{COUNTRY_INFO_SELECT} WHERE LOWER(c.name) IN ({}) \
             OR c.iso3 IN (SELECT iso3 FROM country_aliases WHERE alias IN ({})) \
             OR c.iso3 IN ({}) ORDER BY c.name",
            placeholders(1, n),
            placeholders(n + 1, n),
            placeholders(2 * n + 1, n),
        );
        let codes = wanted.iter().map(|w| w.to_ascii_uppercase());
        let params: Vec<String> = wanted
            .iter()
            .cloned()
            .chain(wanted.iter().cloned())
            .chain(codes)
            .collect();
        (sql, params)
    };

    let rows: Vec<CountryInfoTuple> = db
        .fetch_as(&sql, &params)
        .await
        .map_err(|e| PersistenceError::new(Table::Countries.name(), e))?;
    Ok(rows
        .into_iter()
        .map(
            |(
                iso3,
                iso2,
                name,
                region_id,
                region_name,
                income_level,
                capital_city,
                longitude,
                latitude,
                data_source,
                update_count,
                last_updated,
            )| CountryInfo {
                iso3,
                iso2,
                name,
                region_id,
                region_name,
                income_level,
                capital_city,
                longitude,
                latitude,
                data_source,
                update_count,
                last_updated,
            },
        )
        .collect())
}

/// Pipeline consumer that persists fact chunks.
#[derive(Debug, Clone)]
pub struct FactWriter {
    db: Db,
    sub_batch: usize,
}

impl FactWriter {
    pub fn new(db: Db, sub_batch: usize) -> Self {
        Self { db, sub_batch }
    }
}

#[async_trait]
impl ChunkConsumer<FactRow> for FactWriter {
    async fn consume(&mut self, _item: &str, rows: Vec<FactRow>) -> Result<u64, PersistenceError> {
        upsert_facts(&self.db, &rows, self.sub_batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::schema::ensure_schema;
    use crate::util::db::connect_sqlite_memory;

    fn fact(iso3: &str, year: i32, value: f64) -> FactRow {
        FactRow {
            indicator_id: "X".into(),
            iso3: iso3.into(),
            year,
            value,
        }
    }

    #[test]
    fn dedupe_keeps_last_occurrence() {
        let rows = vec![fact("AUT", 2020, 1.0), fact("BEL", 2020, 2.0), fact("AUT", 2020, 3.0)];
        let kept = dedupe_last(&rows);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].iso3, "BEL");
        assert_eq!(kept[1].value, 3.0);
    }

    fn source(name: &str) -> SourceRow {
        SourceRow {
            source_id: "2".into(),
            source_name: name.into(),
            source_url: None,
        }
    }

    #[test]
    fn dedupe_first_keeps_first_occurrence() {
        let rows = vec![source("first"), source("second")];
        let kept = dedupe_first(&rows);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].source_name, "first");
    }

    #[tokio::test]
    async fn insert_only_tables_keep_the_first_duplicate() {
        let db = connect_sqlite_memory().await.unwrap();
        ensure_schema(&db, None).await.unwrap();
        let rows = vec![source("World Development Indicators"), source("Renamed")];
        assert_eq!(insert_sources(&db, &rows).await.unwrap(), 1);
        insert_sources(&db, &[source("Later run")]).await.unwrap();
        let names = db.fetch_column("SELECT source_name FROM sources").await.unwrap();
        assert_eq!(names, vec!["World Development Indicators".to_string()]);
    }

    #[tokio::test]
    async fn facts_split_into_sub_batches() {
        let db = connect_sqlite_memory().await.unwrap();
        ensure_schema(&db, None).await.unwrap();
        let rows: Vec<_> = (2000..2012).map(|y| fact("AUT", y, y as f64)).collect();
        assert_eq!(upsert_facts(&db, &rows, 5).await.unwrap(), 12);
        let years = db
            .fetch_column("SELECT CAST(year AS TEXT) FROM indicator_values")
            .await
            .unwrap();
        assert_eq!(years.len(), 12);
    }

    #[tokio::test]
    async fn duplicate_keys_in_one_batch_do_not_fail() {
        let db = connect_sqlite_memory().await.unwrap();
        ensure_schema(&db, None).await.unwrap();
        let rows = vec![fact("AUT", 2020, 1.0), fact("AUT", 2020, 2.0)];
        upsert_facts(&db, &rows, 100).await.unwrap();
        let values = db
            .fetch_column("SELECT CAST(value AS TEXT) FROM indicator_values")
            .await
            .unwrap();
        assert_eq!(values, vec!["2.0".to_string()]);
    }
}
