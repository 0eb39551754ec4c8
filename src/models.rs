//! Typed rows for each target table. Every row maps 1:1 onto the column list declared in
//! [`crate::database_ops::tables::Table`].

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegionRow {
    pub region_id: String,
    pub region_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CountryRow {
    pub iso3: String,
    pub iso2: Option<String>,
    pub name: String,
    pub region_id: Option<String>,
    pub income_level: Option<String>,
    pub capital_city: Option<String>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
}

/// A country record as delivered by the API, together with the region it names.
#[derive(Debug, Clone, PartialEq)]
pub struct CountryRecord {
    pub country: CountryRow,
    pub region: Option<RegionRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AliasRow {
    /// Normalized (lower-cased, whitespace-collapsed) country name.
    pub alias: String,
    pub iso3: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRow {
    pub source_id: String,
    pub source_name: String,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRow {
    pub topic_id: String,
    pub topic_name: String,
    pub topic_note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndicatorRow {
    pub indicator_id: String,
    pub indicator_name: String,
    pub source_id: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndicatorTopicRow {
    pub indicator_id: String,
    pub topic_id: String,
}

/// Indicator metadata plus its topic links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndicatorRecord {
    pub indicator: IndicatorRow,
    pub topics: Vec<IndicatorTopicRow>,
}

/// One observation. `value` is always present: rows without a value are dropped upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct FactRow {
    pub indicator_id: String,
    pub iso3: String,
    pub year: i32,
    pub value: f64,
}

/// A scraped or file-sourced score keyed by country *name* rather than code.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRecord {
    pub country: String,
    pub year: i32,
    pub score: Option<f64>,
}

/// A stored country with its region name and change bookkeeping, as read back for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountryInfo {
    pub iso3: String,
    pub iso2: Option<String>,
    pub name: String,
    pub region_id: Option<String>,
    pub region_name: Option<String>,
    pub income_level: Option<String>,
    pub capital_city: Option<String>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub data_source: Option<String>,
    pub update_count: i32,
    pub last_updated: String,
}

impl fmt::Display for CountryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dash = "-";
        write!(
            f,
            "{} ({}) region={} income={} capital={}",
            self.name,
            self.iso3,
            self.region_name.as_deref().or(self.region_id.as_deref()).unwrap_or(dash),
            self.income_level.as_deref().unwrap_or(dash),
            self.capital_city.as_deref().unwrap_or(dash),
        )?;
        if let (Some(lat), Some(lon)) = (self.latitude, self.longitude) {
            write!(f, " at {lat:.4},{lon:.4}")?;
        }
        write!(f, " updates={} last={}", self.update_count, self.last_updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn country_info_line_falls_back_to_dashes() {
        let info = CountryInfo {
            iso3: "AUT".into(),
            iso2: Some("AT".into()),
            name: "Austria".into(),
            region_id: Some("ECS".into()),
            region_name: None,
            income_level: None,
            capital_city: Some("Vienna".into()),
            longitude: Some(16.3798),
            latitude: Some(48.2201),
            data_source: None,
            update_count: 2,
            last_updated: "2024-01-01 00:00:00".into(),
        };
        assert_eq!(
            info.to_string(),
            "Austria (AUT) region=ECS income=- capital=Vienna at 48.2201,16.3798 updates=2 last=2024-01-01 00:00:00"
        );
    }
}
