//! World Happiness Report ladder scores from a CSV export of the report spreadsheet.

use std::io::Read;
use tracing::{info, instrument};

use crate::error::ScoreSourceError;
use crate::http::client::FetchClient;
use crate::models::{IndicatorRow, ScoreRecord, SourceRow};
use crate::normalization::records::{coerce_f64, coerce_year};

pub const HAPPINESS_INDICATOR_ID: &str = "WHR.LADDER";
pub const HAPPINESS_SOURCE_ID: &str = "WHR";

/// Header substrings that identify the value column, in priority order.
const VALUE_HEADERS: &[&str] = &["ladder", "life evaluation", "score", "happiness"];

pub fn happiness_source() -> SourceRow {
    SourceRow {
        source_id: HAPPINESS_SOURCE_ID.to_string(),
        source_name: "World Happiness Report".to_string(),
        source_url: Some("https://worldhappiness.report/data/".to_string()),
    }
}

pub fn happiness_indicator() -> IndicatorRow {
    IndicatorRow {
        indicator_id: HAPPINESS_INDICATOR_ID.to_string(),
        indicator_name: "Life evaluation (Cantril ladder, 0-10)".to_string(),
        source_id: Some(HAPPINESS_SOURCE_ID.to_string()),
        description: None,
    }
}

fn find_column(headers: &csv::StringRecord, needle: &str) -> Option<usize> {
    headers
        .iter()
        .position(|h| h.trim().to_lowercase().contains(needle))
}

/// Parse the export. Columns are matched case-insensitively by substring; rows without a
/// country or a plain integer year are skipped, unreadable scores become `None`.
pub fn parse_happiness_csv<R: Read>(reader: R) -> Result<Vec<ScoreRecord>, ScoreSourceError> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = rdr.headers()?.clone();
    let country_col =
        find_column(&headers, "country").ok_or(ScoreSourceError::MissingColumn("country"))?;
    let year_col = find_column(&headers, "year").ok_or(ScoreSourceError::MissingColumn("year"))?;
    let value_col = VALUE_HEADERS
        .iter()
        .find_map(|needle| find_column(&headers, needle))
        .ok_or(ScoreSourceError::MissingColumn("ladder score"))?;

    let mut out = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let country = record.get(country_col).unwrap_or_default().trim();
        let year = record
            .get(year_col)
            .and_then(|y| coerce_year(Some(&serde_json::Value::from(y))));
        let Some(year) = year.filter(|_| !country.is_empty()) else {
            continue;
        };
        let score = record
            .get(value_col)
            .and_then(|v| coerce_f64(Some(&serde_json::Value::from(v))));
        out.push(ScoreRecord {
            country: country.to_string(),
            year,
            score,
        });
    }
    Ok(out)
}

/// Load from an `http(s)://` URL through the fetch client or from a local path.
#[instrument(skip(client))]
pub async fn load_happiness(
    client: &FetchClient,
    location: &str,
) -> Result<Vec<ScoreRecord>, ScoreSourceError> {
    let records = if location.starts_with("http://") || location.starts_with("https://") {
        let resp = client.fetch_with_retry(location).await?;
        if !resp.is_success() {
            return Err(ScoreSourceError::Status {
                url: location.to_string(),
                status: resp.status,
            });
        }
        parse_happiness_csv(resp.body.as_ref())?
    } else {
        let bytes = tokio::fs::read(location)
            .await
            .map_err(|source| ScoreSourceError::Io {
                path: location.to_string(),
                source,
            })?;
        parse_happiness_csv(bytes.as_slice())?
    };
    info!(records = records.len(), "happiness export parsed");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_columns_by_substring() {
        let csv = "Year,Rank,Country name,Ladder score,upperwhisker\n\
                   2024,1,Finland,7.736,7.81\n\
                   2024,2,Denmark,,7.6\n\
                   2024,3,,7.3,7.4\n\
                   latest,4,Iceland,7.5,7.6\n";
        let records = parse_happiness_csv(csv.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            ScoreRecord { country: "Finland".into(), year: 2024, score: Some(7.736) }
        );
        assert_eq!(records[1].score, None);
    }

    #[test]
    fn life_evaluation_header_is_accepted() {
        let csv = "country,year,Life evaluation (3-year average)\nAustria,2023,6.905\n";
        let records = parse_happiness_csv(csv.as_bytes()).unwrap();
        assert_eq!(records[0].score, Some(6.905));
    }

    #[test]
    fn missing_value_column_is_reported() {
        let csv = "country,year,gdp\nAustria,2023,1\n";
        assert!(matches!(
            parse_happiness_csv(csv.as_bytes()),
            Err(ScoreSourceError::MissingColumn(_))
        ));
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let client = FetchClient::http("test", Default::default()).unwrap();
        let err = load_happiness(&client, "/nonexistent/whr.csv").await.unwrap_err();
        assert!(matches!(err, ScoreSourceError::Io { .. }));
    }
}
