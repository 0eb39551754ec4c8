pub mod cpi;
pub mod happiness;
pub mod worldbank;

pub use cpi::{fetch_cpi, parse_cpi_tables, CpiTableSpec};
pub use happiness::{load_happiness, parse_happiness_csv};
pub use worldbank::WorldBankApi;
