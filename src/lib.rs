pub mod config;
pub mod database_ops;
pub mod error;
pub mod etl;
pub mod http;
pub mod models;
pub mod normalization;
pub mod pipeline;
pub mod providers;
pub mod tracing;

pub mod util {
    pub mod db;
    pub mod env;
}

pub use config::Settings;
pub use etl::{Etl, RunReport, Stage};
