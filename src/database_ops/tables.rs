//! The only source of table and column identifiers that ever reach SQL text.

use crate::util::db::BatchStatement;

/// What happens when an inserted key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Keep the stored row.
    Ignore,
    /// Replace the listed columns unconditionally.
    Overwrite(&'static [&'static str]),
    /// Replace the listed columns only when at least one differs, bumping `update_count` and
    /// `last_updated`. The remaining non-key columns are refreshed alongside but not compared.
    TrackChanges {
        tracked: &'static [&'static str],
        refreshed: &'static [&'static str],
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Regions,
    Countries,
    CountryAliases,
    Sources,
    Topics,
    Indicators,
    IndicatorTopics,
    IndicatorValues,
}

impl Table {
    pub const ALL: [Table; 8] = [
        Table::Regions,
        Table::Countries,
        Table::CountryAliases,
        Table::Sources,
        Table::Topics,
        Table::Indicators,
        Table::IndicatorTopics,
        Table::IndicatorValues,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Table::Regions => "regions",
            Table::Countries => "countries",
            Table::CountryAliases => "country_aliases",
            Table::Sources => "sources",
            Table::Topics => "topics",
            Table::Indicators => "indicators",
            Table::IndicatorTopics => "indicator_topics",
            Table::IndicatorValues => "indicator_values",
        }
    }

    /// Columns bound on insert, in bind order.
    pub const fn columns(self) -> &'static [&'static str] {
        match self {
            Table::Regions => &["region_id", "region_name"],
            Table::Countries => &[
                "iso3",
                "iso2",
                "name",
                "region_id",
                "income_level",
                "capital_city",
                "longitude",
                "latitude",
                "data_source",
            ],
            Table::CountryAliases => &["alias", "iso3"],
            Table::Sources => &["source_id", "source_name", "source_url"],
            Table::Topics => &["topic_id", "topic_name", "topic_note"],
            Table::Indicators => &["indicator_id", "indicator_name", "source_id", "description"],
            Table::IndicatorTopics => &["indicator_id", "topic_id"],
            Table::IndicatorValues => &["indicator_id", "iso3", "year", "value"],
        }
    }

    pub const fn key(self) -> &'static [&'static str] {
        match self {
            Table::Regions => &["region_id"],
            Table::Countries => &["iso3"],
            Table::CountryAliases => &["alias"],
            Table::Sources => &["source_id"],
            Table::Topics => &["topic_id"],
            Table::Indicators => &["indicator_id"],
            Table::IndicatorTopics => &["indicator_id", "topic_id"],
            Table::IndicatorValues => &["indicator_id", "iso3", "year"],
        }
    }

    pub const fn policy(self) -> ConflictPolicy {
        match self {
            Table::Countries => ConflictPolicy::TrackChanges {
                tracked: &[
                    "iso2",
                    "name",
                    "region_id",
                    "income_level",
                    "capital_city",
                    "longitude",
                    "latitude",
                ],
                refreshed: &["data_source"],
            },
            Table::IndicatorValues => ConflictPolicy::Overwrite(&["value"]),
            _ => ConflictPolicy::Ignore,
        }
    }

    fn conflict_clause(self) -> String {
        let name = self.name();
        let key = self.key().join(", ");
        match self.policy() {
            ConflictPolicy::Ignore => format!("ON CONFLICT ({key}) DO NOTHING"),
            ConflictPolicy::Overwrite(cols) => {
                let set = cols
                    .iter()
                    .map(|c| format!("{c} = EXCLUDED.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("ON CONFLICT ({key}) DO UPDATE SET {set}")
            }
            ConflictPolicy::TrackChanges { tracked, refreshed } => {
                let set = tracked
                    .iter()
                    .chain(refreshed.iter())
                    .map(|c| format!("{c} = EXCLUDED.{c}"))
                    .chain([
                        format!("update_count = {name}.update_count + 1"),
                        "last_updated = CURRENT_TIMESTAMP".to_string(),
                    ])
                    .collect::<Vec<_>>()
                    .join(", ");
                let changed = tracked
                    .iter()
                    .map(|c| format!("{name}.{c} IS DISTINCT FROM EXCLUDED.{c}"))
                    .collect::<Vec<_>>()
                    .join(" OR ");
                format!("ON CONFLICT ({key}) DO UPDATE SET {set} WHERE {changed}")
            }
        }
    }
}

impl BatchStatement for Table {
    fn table(&self) -> &'static str {
        self.name()
    }

    fn width(&self) -> usize {
        self.columns().len()
    }

    fn sql_for(&self, rows: usize) -> String {
        let width = self.width();
        let values = (0..rows)
            .map(|r| {
                let params = (1..=width)
                    .map(|c| format!("${}", r * width + c))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("({params})")
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES {} {}",
            self.name(),
            self.columns().join(", "),
            values,
            self.conflict_clause()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_run_across_rows() {
        let sql = Table::Regions.sql_for(2);
        assert_eq!(
            sql,
            "INSERT INTO regions (region_id, region_name) VALUES ($1, $2), ($3, $4) \
             ON CONFLICT (region_id) DO NOTHING"
        );
    }

    #[test]
    fn facts_overwrite_value_only() {
        let sql = Table::IndicatorValues.sql_for(1);
        assert!(sql.ends_with(
            "ON CONFLICT (indicator_id, iso3, year) DO UPDATE SET value = EXCLUDED.value"
        ));
    }

    #[test]
    fn countries_update_is_change_gated() {
        let sql = Table::Countries.sql_for(1);
        assert!(sql.contains("update_count = countries.update_count + 1"));
        assert!(sql.contains("WHERE countries.iso2 IS DISTINCT FROM EXCLUDED.iso2 OR"));
        assert!(!sql.contains("countries.data_source IS DISTINCT FROM"));
        assert!(sql.contains("$9)"));
    }

    #[test]
    fn every_key_is_a_bound_column() {
        for table in Table::ALL {
            for key in table.key() {
                assert!(table.columns().contains(key), "{} key {key}", table.name());
            }
        }
    }
}
