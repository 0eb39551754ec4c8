//! World Bank v2 API resource catalogue.

use crate::http::paginate::PagedResource;
use crate::pipeline::WorkItem;

pub const DEFAULT_BASE_URL: &str = "https://api.worldbank.org/v2";

/// Indicators fetched when none are configured.
pub const DEFAULT_INDICATORS: &[&str] = &[
    "SP.POP.TOTL",
    "NY.GDP.MKTP.KD.ZG",
    "NY.GDP.PCAP.CD",
    "FP.CPI.TOTL.ZG",
    "SL.UEM.TOTL.ZS",
    "SP.DYN.LE00.IN",
];

/// Builds paged resources against one API root.
#[derive(Debug, Clone)]
pub struct WorldBankApi {
    base_url: String,
    per_page: u32,
    date_range: Option<String>,
    countries: Vec<String>,
}

impl WorldBankApi {
    pub fn new(base_url: impl Into<String>, per_page: u32) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            per_page,
            date_range: None,
            countries: Vec::new(),
        }
    }

    /// `YYYY` or `YYYY:YYYY`, applied to indicator value requests.
    pub fn with_date_range(mut self, date_range: Option<String>) -> Self {
        self.date_range = date_range;
        self
    }

    /// Restrict value requests to these country codes (ISO2 or ISO3). Empty means all.
    pub fn with_countries(mut self, countries: Vec<String>) -> Self {
        self.countries = countries;
        self
    }

    fn resource(&self, path: &str) -> PagedResource {
        PagedResource::new(format!("{}/{}", self.base_url, path), self.per_page)
    }

    fn country_selector(&self) -> String {
        if self.countries.is_empty() {
            "all".to_string()
        } else {
            self.countries.join(";")
        }
    }

    pub fn countries(&self) -> PagedResource {
        self.resource("country")
    }

    pub fn sources(&self) -> PagedResource {
        self.resource("source")
    }

    pub fn topics(&self) -> PagedResource {
        self.resource("topic")
    }

    pub fn indicator(&self, id: &str) -> PagedResource {
        self.resource(&format!("indicator/{id}"))
    }

    pub fn indicator_values(&self, id: &str) -> PagedResource {
        self.resource(&format!("country/{}/indicator/{id}", self.country_selector()))
            .with_date(self.date_range.clone())
    }

    /// One pipeline work item per indicator id.
    pub fn value_items(&self, indicators: &[String]) -> Vec<WorkItem> {
        indicators
            .iter()
            .map(|id| WorkItem {
                id: id.clone(),
                resource: self.indicator_values(id),
            })
            .collect()
    }
}

/// Accepts `YYYY` or `YYYY:YYYY` with the first year not after the second.
pub fn valid_date_range(raw: &str) -> bool {
    let year = |s: &str| s.len() == 4 && s.chars().all(|c| c.is_ascii_digit());
    match raw.split_once(':') {
        None => year(raw),
        Some((from, to)) => year(from) && year(to) && from <= to,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_resources_use_country_selector_and_dates() {
        let api = WorldBankApi::new("https://api.worldbank.org/v2/", 1000)
            .with_date_range(Some("2015:2020".into()))
            .with_countries(vec!["AT".into(), "BE".into()]);
        let r = api.indicator_values("SP.POP.TOTL");
        assert_eq!(
            r.url,
            "https://api.worldbank.org/v2/country/AT;BE/indicator/SP.POP.TOTL"
        );
        assert_eq!(r.date.as_deref(), Some("2015:2020"));
        assert_eq!(api.countries().date, None);
        assert_eq!(api.value_items(&["A".into(), "B".into()]).len(), 2);
    }

    #[test]
    fn date_ranges() {
        assert!(valid_date_range("2020"));
        assert!(valid_date_range("2015:2020"));
        assert!(!valid_date_range("2020:2015"));
        assert!(!valid_date_range("20:2015"));
        assert!(!valid_date_range("last5"));
    }
}
