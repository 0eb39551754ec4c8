use std::collections::{BTreeSet, HashMap};

use crate::models::{AliasRow, CountryRow, FactRow, ScoreRecord};
use crate::normalization::records::Transformed;

/// Names that third-party sources use for countries whose World Bank name differs.
/// Entries whose code is not a stored country are ignored when aliases are written.
pub const SUPPLEMENTARY_ALIASES: &[(&str, &str)] = &[
    ("Czech Republic", "CZE"),
    ("Czechia", "CZE"),
    ("Slovakia", "SVK"),
    ("Russia", "RUS"),
    ("Turkey", "TUR"),
    ("Türkiye", "TUR"),
    ("Turkiye", "TUR"),
    ("North Macedonia", "MKD"),
    ("Macedonia", "MKD"),
    ("Kyrgyzstan", "KGZ"),
    ("Moldova", "MDA"),
    ("Bosnia-Herzegovina", "BIH"),
    ("Bosnia and Herzegovina", "BIH"),
    ("Kosovo", "XKX"),
    ("United States", "USA"),
    ("United States of America", "USA"),
    ("South Korea", "KOR"),
    ("Korea, South", "KOR"),
    ("North Korea", "PRK"),
    ("Iran", "IRN"),
    ("Egypt", "EGY"),
    ("Venezuela", "VEN"),
    ("Syria", "SYR"),
    ("Yemen", "YEM"),
    ("Laos", "LAO"),
    ("Vietnam", "VNM"),
    ("Hong Kong", "HKG"),
    ("Taiwan", "TWN"),
    ("Taiwan Province of China", "TWN"),
    ("Palestine", "PSE"),
    ("State of Palestine", "PSE"),
    ("Ivory Coast", "CIV"),
    ("Côte d'Ivoire", "CIV"),
    ("Cote d'Ivoire", "CIV"),
    ("Congo", "COG"),
    ("Republic of the Congo", "COG"),
    ("Congo (Brazzaville)", "COG"),
    ("Democratic Republic of the Congo", "COD"),
    ("DR Congo", "COD"),
    ("Congo (Kinshasa)", "COD"),
    ("Gambia", "GMB"),
    ("The Gambia", "GMB"),
    ("Bahamas", "BHS"),
    ("Cape Verde", "CPV"),
    ("Eswatini", "SWZ"),
    ("Swaziland", "SWZ"),
    ("Brunei", "BRN"),
    ("Micronesia", "FSM"),
    ("Saint Lucia", "LCA"),
    ("St. Lucia", "LCA"),
    ("Saint Vincent and the Grenadines", "VCT"),
    ("Saint Kitts and Nevis", "KNA"),
    ("Timor-Leste", "TLS"),
    ("East Timor", "TLS"),
    ("Somaliland region", "SOM"),
];

/// Lower-case, trim, collapse inner whitespace, and fold typographic apostrophes.
pub fn normalize_name(name: &str) -> String {
    name.replace(['\u{2019}', '\u{2018}', '`'], "'")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Alias rows for the given countries: each official name plus every supplementary alias
/// whose code is in `known_codes`. Later duplicates of a normalized alias are discarded.
pub fn build_alias_rows(
    countries: &[CountryRow],
    supplementary: &[(String, String)],
    known_codes: impl Fn(&str) -> bool,
) -> Vec<AliasRow> {
    let mut seen = BTreeSet::new();
    let official = countries
        .iter()
        .map(|c| (normalize_name(&c.name), c.iso3.clone()));
    let extra = supplementary
        .iter()
        .filter(|(_, code)| known_codes(code.as_str()))
        .map(|(name, code)| (normalize_name(name), code.clone()));
    official
        .chain(extra)
        .filter(|(alias, _)| !alias.is_empty() && seen.insert(alias.clone()))
        .map(|(alias, iso3)| AliasRow { alias, iso3 })
        .collect()
}

/// Name to ISO3 lookup built from the `country_aliases` table.
#[derive(Debug, Clone, Default)]
pub struct AliasResolver {
    map: HashMap<String, String>,
}

impl AliasResolver {
    pub fn from_pairs<I, A, C>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, C)>,
        A: AsRef<str>,
        C: Into<String>,
    {
        let map = pairs
            .into_iter()
            .map(|(alias, iso3)| (normalize_name(alias.as_ref()), iso3.into()))
            .collect();
        Self { map }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Resolve a display name. Footnote markers such as `[a]` or `*` are ignored.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        let key = normalize_name(name);
        if let Some(code) = self.map.get(&key) {
            return Some(code);
        }
        let stripped = key
            .split('[')
            .next()
            .unwrap_or_default()
            .trim_end_matches(['*', ' ']);
        self.map.get(stripped).map(String::as_str)
    }
}

/// Scores resolved into fact rows for `indicator_id`.
#[derive(Debug, Default)]
pub struct ResolvedScores {
    pub facts: Transformed<FactRow>,
    /// Display names that matched no alias, sorted.
    pub unresolved: BTreeSet<String>,
}

/// Records with no score are dropped; names without an alias are filtered and reported.
pub fn resolve_scores(
    records: &[ScoreRecord],
    indicator_id: &str,
    resolver: &AliasResolver,
) -> ResolvedScores {
    let mut out = ResolvedScores::default();
    for rec in records {
        let Some(score) = rec.score.filter(|s| s.is_finite()) else {
            out.facts.dropped += 1;
            continue;
        };
        match resolver.resolve(&rec.country) {
            Some(iso3) => out.facts.rows.push(FactRow {
                indicator_id: indicator_id.to_string(),
                iso3: iso3.to_string(),
                year: rec.year,
                value: score,
            }),
            None => {
                out.facts.filtered += 1;
                out.unresolved.insert(rec.country.trim().to_string());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn country(iso3: &str, name: &str) -> CountryRow {
        CountryRow {
            iso3: iso3.into(),
            iso2: None,
            name: name.into(),
            region_id: None,
            income_level: None,
            capital_city: None,
            longitude: None,
            latitude: None,
        }
    }

    #[test]
    fn normalizes_case_whitespace_and_quotes() {
        assert_eq!(normalize_name("  Côte  d\u{2019}Ivoire "), "côte d'ivoire");
    }

    #[test]
    fn alias_rows_keep_only_known_supplementary_codes() {
        let countries = vec![
            country("CZE", "Czechia"),
            country("SVK", "Slovak Republic"),
        ];
        let supplementary: Vec<(String, String)> = SUPPLEMENTARY_ALIASES
            .iter()
            .map(|(a, c)| (a.to_string(), c.to_string()))
            .collect();
        let rows = build_alias_rows(&countries, &supplementary, |code| {
            code == "CZE" || code == "SVK"
        });
        let aliases: Vec<_> = rows.iter().map(|r| r.alias.as_str()).collect();
        assert!(aliases.contains(&"slovak republic"));
        assert!(aliases.contains(&"slovakia"));
        assert!(aliases.contains(&"czech republic"));
        assert!(!aliases.contains(&"russia"));
        assert_eq!(aliases.iter().filter(|a| **a == "czechia").count(), 1);
    }

    #[test]
    fn resolver_ignores_footnotes() {
        let r = AliasResolver::from_pairs([("Slovak Republic", "SVK"), ("Slovakia", "SVK")]);
        assert_eq!(r.resolve("SLOVAKIA"), Some("SVK"));
        assert_eq!(r.resolve("Slovakia[b]"), Some("SVK"));
        assert_eq!(r.resolve("Slovakia *"), Some("SVK"));
        assert_eq!(r.resolve("Atlantis"), None);
    }

    #[test]
    fn scores_resolve_with_unmatched_names_reported() {
        let r = AliasResolver::from_pairs([("Austria", "AUT")]);
        let records = vec![
            ScoreRecord { country: "Austria".into(), year: 2024, score: Some(67.0) },
            ScoreRecord { country: "Austria".into(), year: 2023, score: None },
            ScoreRecord { country: "Atlantis".into(), year: 2024, score: Some(12.0) },
        ];
        let out = resolve_scores(&records, "TI.CPI.SCORE", &r);
        assert_eq!(out.facts.rows.len(), 1);
        assert_eq!(out.facts.rows[0].iso3, "AUT");
        assert_eq!(out.facts.dropped, 1);
        assert_eq!(out.facts.filtered, 1);
        assert!(out.unresolved.contains("Atlantis"));
    }
}
