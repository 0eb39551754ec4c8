use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::models::{
    CountryRecord, CountryRow, FactRow, IndicatorRecord, IndicatorRow, IndicatorTopicRow,
    RegionRow, SourceRow, TopicRow,
};

/// Output of transforming one page. `dropped` counts malformed or value-less records,
/// `filtered` counts well-formed records rejected by a membership predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed<R> {
    pub rows: Vec<R>,
    pub dropped: usize,
    pub filtered: usize,
}

impl<R> Default for Transformed<R> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            dropped: 0,
            filtered: 0,
        }
    }
}

/// Maps raw API records of one page to typed rows. Implementations are pure.
pub trait RecordTransform: Send + Sync {
    type Row: Send + 'static;

    fn transform(&self, page: &[Value]) -> Transformed<Self::Row>;
}

/// Trimmed, non-empty string. Numbers are rendered as text.
pub fn text(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `obj[key][sub]` as text, e.g. `region.value`.
pub fn nested_text(obj: &Value, key: &str, sub: &str) -> Option<String> {
    text(obj.get(key).and_then(|inner| inner.get(sub)))
}

/// Finite float from a JSON number or numeric string (thousands separators allowed).
pub fn coerce_f64(v: Option<&Value>) -> Option<f64> {
    let f = match v? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok()?,
        _ => return None,
    };
    f.is_finite().then_some(f)
}

/// Calendar year. Only plain integer periods qualify; `2019Q1` or `2019M01` do not.
pub fn coerce_year(v: Option<&Value>) -> Option<i32> {
    match v? {
        Value::Number(n) => n.as_i64().and_then(|y| i32::try_from(y).ok()),
        Value::String(s) => s.trim().parse::<i32>().ok(),
        _ => None,
    }
}

pub fn coerce_u32(v: Option<&Value>) -> Option<u32> {
    match v? {
        Value::Number(n) => n.as_u64().and_then(|x| u32::try_from(x).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    }
}

fn is_aggregate(rec: &Value) -> bool {
    let region_value = nested_text(rec, "region", "value");
    let region_id = nested_text(rec, "region", "id");
    region_value.as_deref() == Some("Aggregates") || region_id.as_deref() == Some("NA")
}

/// `/country` records. Aggregates are filtered; an optional code list (ISO3 or ISO2,
/// case-insensitive) restricts the result further.
#[derive(Debug, Clone, Default)]
pub struct CountryTransform {
    only: Option<HashSet<String>>,
}

impl CountryTransform {
    pub fn new(only: &[String]) -> Self {
        let only = (!only.is_empty())
            .then(|| only.iter().map(|c| c.trim().to_ascii_uppercase()).collect());
        Self { only }
    }

    fn wanted(&self, iso3: &str, iso2: Option<&str>) -> bool {
        match &self.only {
            None => true,
            Some(codes) => codes.contains(iso3) || iso2.is_some_and(|c| codes.contains(c)),
        }
    }
}

impl RecordTransform for CountryTransform {
    type Row = CountryRecord;

    fn transform(&self, page: &[Value]) -> Transformed<CountryRecord> {
        let mut out = Transformed::default();
        for rec in page {
            let (Some(iso3), Some(name)) = (text(rec.get("id")), text(rec.get("name"))) else {
                out.dropped += 1;
                continue;
            };
            let iso3 = iso3.to_ascii_uppercase();
            let iso2 = text(rec.get("iso2Code")).map(|c| c.to_ascii_uppercase());
            if iso3.len() != 3 || is_aggregate(rec) || !self.wanted(&iso3, iso2.as_deref()) {
                out.filtered += 1;
                continue;
            }

            let region = match (
                nested_text(rec, "region", "id"),
                nested_text(rec, "region", "value"),
            ) {
                (Some(region_id), Some(region_name)) => Some(RegionRow {
                    region_id,
                    region_name,
                }),
                _ => None,
            };

            out.rows.push(CountryRecord {
                country: CountryRow {
                    iso3,
                    iso2,
                    name,
                    region_id: region.as_ref().map(|r| r.region_id.clone()),
                    income_level: nested_text(rec, "incomeLevel", "value"),
                    capital_city: text(rec.get("capitalCity")),
                    longitude: coerce_f64(rec.get("longitude")),
                    latitude: coerce_f64(rec.get("latitude")),
                },
                region,
            });
        }
        out
    }
}

/// `/source` records.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceTransform;

impl RecordTransform for SourceTransform {
    type Row = SourceRow;

    fn transform(&self, page: &[Value]) -> Transformed<SourceRow> {
        let mut out = Transformed::default();
        for rec in page {
            match (text(rec.get("id")), text(rec.get("name"))) {
                (Some(source_id), Some(source_name)) => out.rows.push(SourceRow {
                    source_id,
                    source_name,
                    source_url: text(rec.get("url")),
                }),
                _ => out.dropped += 1,
            }
        }
        out
    }
}

/// `/topic` records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicTransform;

impl RecordTransform for TopicTransform {
    type Row = TopicRow;

    fn transform(&self, page: &[Value]) -> Transformed<TopicRow> {
        let mut out = Transformed::default();
        for rec in page {
            match (text(rec.get("id")), text(rec.get("value"))) {
                (Some(topic_id), Some(topic_name)) => out.rows.push(TopicRow {
                    topic_id,
                    topic_name,
                    topic_note: text(rec.get("sourceNote")),
                }),
                _ => out.dropped += 1,
            }
        }
        out
    }
}

/// `/indicator/{id}` metadata records with their topic links.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndicatorTransform;

impl RecordTransform for IndicatorTransform {
    type Row = IndicatorRecord;

    fn transform(&self, page: &[Value]) -> Transformed<IndicatorRecord> {
        let mut out = Transformed::default();
        for rec in page {
            let (Some(indicator_id), Some(indicator_name)) =
                (text(rec.get("id")), text(rec.get("name")))
            else {
                out.dropped += 1;
                continue;
            };
            let topics = rec
                .get("topics")
                .and_then(Value::as_array)
                .map(|topics| {
                    topics
                        .iter()
                        .filter_map(|t| text(t.get("id")))
                        .map(|topic_id| IndicatorTopicRow {
                            indicator_id: indicator_id.clone(),
                            topic_id,
                        })
                        .collect()
                })
                .unwrap_or_default();
            out.rows.push(IndicatorRecord {
                indicator: IndicatorRow {
                    source_id: nested_text(rec, "source", "id"),
                    description: text(rec.get("sourceNote")),
                    indicator_id,
                    indicator_name,
                },
                topics,
            });
        }
        out
    }
}

/// Indicator observations. Records without a usable code, year or value are dropped; when a
/// code set is given, records for other codes (typically aggregates) are filtered.
#[derive(Debug, Clone, Default)]
pub struct FactTransform {
    valid_codes: Option<Arc<HashSet<String>>>,
}

impl FactTransform {
    pub fn new(valid_codes: Option<Arc<HashSet<String>>>) -> Self {
        Self { valid_codes }
    }
}

impl RecordTransform for FactTransform {
    type Row = FactRow;

    fn transform(&self, page: &[Value]) -> Transformed<FactRow> {
        let mut out = Transformed::default();
        for rec in page {
            let indicator_id = nested_text(rec, "indicator", "id");
            let iso3 = text(rec.get("countryiso3code")).map(|c| c.to_ascii_uppercase());
            let year = coerce_year(rec.get("date"));
            let value = coerce_f64(rec.get("value"));
            let (Some(indicator_id), Some(iso3), Some(year), Some(value)) =
                (indicator_id, iso3, year, value)
            else {
                out.dropped += 1;
                continue;
            };
            if let Some(valid) = &self.valid_codes {
                if !valid.contains(&iso3) {
                    out.filtered += 1;
                    continue;
                }
            }
            out.rows.push(FactRow {
                indicator_id,
                iso3,
                year,
                value,
            });
        }
        out
    }
}
