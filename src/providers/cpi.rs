//! Corruption Perceptions Index scores from the Wikipedia list page.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{info, instrument};

use crate::error::ScoreSourceError;
use crate::http::client::FetchClient;
use crate::models::{IndicatorRow, ScoreRecord, SourceRow};

pub const DEFAULT_CPI_URL: &str =
    "https://en.wikipedia.org/wiki/List_of_countries_by_Corruption_Perceptions_Index";
pub const CPI_INDICATOR_ID: &str = "TI.CPI.SCORE";
pub const CPI_SOURCE_ID: &str = "TI";

const PLACEHOLDERS: &[&str] = &["", "—", "–", "-", "N/A", "n/a", "NA"];

/// Which table to read and what each positional cell means.
#[derive(Debug, Clone, PartialEq)]
pub struct CpiTableSpec {
    /// Substring that must occur in one of the table's header cells.
    pub marker: String,
    /// Index among the tables carrying the marker.
    pub table_ordinal: usize,
    pub country_column: usize,
    /// `(td index, year)`.
    pub year_columns: Vec<(usize, i32)>,
}

impl Default for CpiTableSpec {
    fn default() -> Self {
        Self {
            marker: "Nation".to_string(),
            table_ordinal: 0,
            country_column: 1,
            year_columns: vec![(2, 2024), (4, 2023), (6, 2022), (8, 2021), (10, 2020)],
        }
    }
}

pub fn cpi_source() -> SourceRow {
    SourceRow {
        source_id: CPI_SOURCE_ID.to_string(),
        source_name: "Transparency International".to_string(),
        source_url: Some(DEFAULT_CPI_URL.to_string()),
    }
}

pub fn cpi_indicator() -> IndicatorRow {
    IndicatorRow {
        indicator_id: CPI_INDICATOR_ID.to_string(),
        indicator_name: "Corruption Perceptions Index score (0-100)".to_string(),
        source_id: Some(CPI_SOURCE_ID.to_string()),
        description: Some("Scraped from the CPI country list; higher is cleaner.".to_string()),
    }
}

fn selector(css: &str) -> Result<Selector, ScoreSourceError> {
    Selector::parse(css).map_err(|e| ScoreSourceError::Pattern(format!("{css}: {e}")))
}

fn cell_text(el: ElementRef<'_>) -> String {
    el.text()
        .collect::<String>()
        .replace('\u{a0}', " ")
        .trim()
        .to_string()
}

struct Cleaner {
    footnote: Regex,
}

impl Cleaner {
    fn new() -> Result<Self, ScoreSourceError> {
        Ok(Self {
            footnote: Regex::new(r"\[[^\]]*\]")?,
        })
    }

    fn strip(&self, raw: &str) -> String {
        self.footnote
            .replace_all(raw, "")
            .trim()
            .trim_end_matches('*')
            .trim()
            .to_string()
    }

    fn score(&self, raw: &str) -> Option<f64> {
        let s = self.strip(raw);
        if PLACEHOLDERS.contains(&s.as_str()) {
            return None;
        }
        s.parse::<f64>().ok().filter(|v| v.is_finite())
    }
}

/// Rows of the selected table as score records. Header rows (no `td`) and rows without a
/// country cell are skipped; unreadable score cells become `None`.
pub fn parse_cpi_tables(html: &str, spec: &CpiTableSpec) -> Result<Vec<ScoreRecord>, ScoreSourceError> {
    let doc = Html::parse_document(html);
    let table_sel = selector("table")?;
    let th_sel = selector("th")?;
    let tr_sel = selector("tr")?;
    let td_sel = selector("td")?;
    let cleaner = Cleaner::new()?;

    let table = doc
        .select(&table_sel)
        .filter(|t| t.select(&th_sel).any(|th| cell_text(th).contains(&spec.marker)))
        .nth(spec.table_ordinal)
        .ok_or_else(|| ScoreSourceError::TableNotFound {
            marker: spec.marker.clone(),
            ordinal: spec.table_ordinal,
        })?;

    let mut out = Vec::new();
    for row in table.select(&tr_sel) {
        let cells: Vec<String> = row.select(&td_sel).map(cell_text).collect();
        let Some(country) = cells
            .get(spec.country_column)
            .map(|c| cleaner.strip(c))
            .filter(|c| !c.is_empty())
        else {
            continue;
        };
        for &(col, year) in &spec.year_columns {
            out.push(ScoreRecord {
                country: country.clone(),
                year,
                score: cells.get(col).and_then(|c| cleaner.score(c)),
            });
        }
    }
    Ok(out)
}

#[instrument(skip(client, spec))]
pub async fn fetch_cpi(
    client: &FetchClient,
    url: &str,
    spec: &CpiTableSpec,
) -> Result<Vec<ScoreRecord>, ScoreSourceError> {
    let resp = client.fetch_with_retry(url).await?;
    if !resp.is_success() {
        return Err(ScoreSourceError::Status {
            url: url.to_string(),
            status: resp.status,
        });
    }
    let records = parse_cpi_tables(&resp.text(), spec)?;
    info!(records = records.len(), "cpi table parsed");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
    <html><body>
      <table class="wikitable"><tr><th>Rank</th><th>Other</th></tr><tr><td>1</td><td>Nowhere</td></tr></table>
      <table class="wikitable sortable">
        <tr><th>#</th><th>Nation&nbsp;or Territory</th><th colspan="2">2024</th><th colspan="2">2023</th></tr>
        <tr><th></th><th></th><th>Score</th><th>&Delta;</th><th>Score</th><th>&Delta;</th></tr>
        <tr><td>1</td><td>Denmark</td><td>90</td><td>=</td><td>90</td><td>=</td></tr>
        <tr><td>2</td><td>Slovakia[a]</td><td>49</td><td>1</td><td>—</td><td></td></tr>
        <tr><td>3</td><td> </td><td>10</td><td></td><td>11</td><td></td></tr>
        <tr><td>4</td><td>Somaliland*</td><td>N/A</td></tr>
      </table>
    </body></html>"#;

    fn spec() -> CpiTableSpec {
        CpiTableSpec {
            year_columns: vec![(2, 2024), (4, 2023)],
            ..CpiTableSpec::default()
        }
    }

    #[test]
    fn reads_marker_table_positionally() {
        let records = parse_cpi_tables(PAGE, &spec()).unwrap();
        assert_eq!(records.len(), 6);
        assert_eq!(
            records[0],
            ScoreRecord { country: "Denmark".into(), year: 2024, score: Some(90.0) }
        );
        assert_eq!(records[2].country, "Slovakia");
        assert_eq!(records[3].score, None);
        assert_eq!(records[4].country, "Somaliland");
        assert_eq!(records[4].score, None);
        assert_eq!(records[5].score, None);
    }

    #[test]
    fn missing_marker_is_an_error() {
        let spec = CpiTableSpec {
            marker: "Territory of Nowhere".into(),
            ..CpiTableSpec::default()
        };
        assert!(matches!(
            parse_cpi_tables(PAGE, &spec),
            Err(ScoreSourceError::TableNotFound { .. })
        ));
    }
}
