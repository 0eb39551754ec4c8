pub mod schema;
pub mod tables;
pub mod upsert;

pub use schema::ensure_schema;
pub use tables::{ConflictPolicy, Table};
pub use upsert::{
    fetch_countries, insert_aliases, insert_indicator_topics, insert_indicators, insert_regions,
    insert_sources, insert_topics, load_aliases, load_country_codes, upsert_countries, upsert_facts,
    FactWriter, TableRow,
};
