//! Stage runner: wires the collector, pipeline and upsert layer into one ingestion run.
//!
//! Every stage reports into a [`RunReport`]; a failing stage is recorded and the next stage
//! still runs. Connection problems are handled before a runner exists.

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::config::Settings;
use crate::database_ops::upsert::{
    insert_aliases, insert_indicator_topics, insert_indicators, insert_regions, insert_sources,
    insert_topics, load_aliases, load_country_codes, upsert_countries, upsert_facts, FactWriter,
};
use crate::error::CollectError;
use crate::http::client::FetchClient;
use crate::http::paginate::{CollectReport, Collector, PagedResource};
use crate::models::{
    CountryRow, IndicatorRow, IndicatorTopicRow, RegionRow, ScoreRecord, SourceRow,
};
use crate::normalization::aliases::{build_alias_rows, resolve_scores, AliasResolver};
use crate::normalization::records::{
    CountryTransform, FactTransform, IndicatorTransform, RecordTransform, SourceTransform,
    TopicTransform,
};
use crate::pipeline::{ItemOutcome, Pipeline, PipelineReport, StopHandle};
use crate::providers::cpi::{cpi_indicator, cpi_source, fetch_cpi};
use crate::providers::happiness::{happiness_indicator, happiness_source, load_happiness};
use crate::providers::worldbank::WorldBankApi;
use crate::util::db::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, clap::ValueEnum)]
pub enum Stage {
    /// Regions, countries and country aliases.
    Countries,
    /// Sources and topics.
    Catalog,
    /// Metadata of the configured indicators.
    Indicators,
    /// Indicator values through the concurrent pipeline.
    Values,
    /// Scraped corruption perception scores.
    Cpi,
    /// Happiness report ladder scores.
    Happiness,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Countries,
        Stage::Catalog,
        Stage::Indicators,
        Stage::Values,
        Stage::Cpi,
        Stage::Happiness,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Countries => "countries",
            Stage::Catalog => "catalog",
            Stage::Indicators => "indicators",
            Stage::Values => "values",
            Stage::Cpi => "cpi",
            Stage::Happiness => "happiness",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Ok,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub status: StageStatus,
    pub written: u64,
    pub dropped: usize,
    pub filtered: usize,
}

impl StageReport {
    fn ok(written: u64) -> Self {
        Self {
            status: StageStatus::Ok,
            written,
            dropped: 0,
            filtered: 0,
        }
    }

    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Skipped(reason.into()),
            ..Self::ok(0)
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Failed(reason.into()),
            ..Self::ok(0)
        }
    }

    fn counting(mut self, collect: &CollectReport) -> Self {
        self.dropped += collect.dropped;
        self.filtered += collect.filtered;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub stages: BTreeMap<Stage, StageReport>,
    /// Resources skipped because of a non-success status or an unreadable body.
    pub skipped_sources: Vec<String>,
    /// Resources that stopped paginating early; earlier pages were kept.
    pub partial_sources: Vec<String>,
    pub failed_indicators: Vec<String>,
    pub unresolved_names: BTreeSet<String>,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        !self.failed_indicators.is_empty()
            || self
                .stages
                .values()
                .any(|s| matches!(s.status, StageStatus::Failed(_)))
    }

    pub fn log(&self) {
        for (stage, r) in &self.stages {
            match &r.status {
                StageStatus::Ok => info!(
                    stage = stage.name(),
                    written = r.written,
                    dropped = r.dropped,
                    filtered = r.filtered,
                    "stage done"
                ),
                StageStatus::Skipped(reason) => {
                    warn!(stage = stage.name(), reason = %reason, "stage skipped")
                }
                StageStatus::Failed(reason) => warn!(
                    stage = stage.name(),
                    written = r.written,
                    reason = %reason,
                    "stage failed"
                ),
            }
        }
        if !self.skipped_sources.is_empty() {
            warn!(sources = ?self.skipped_sources, "skipped sources");
        }
        if !self.partial_sources.is_empty() {
            warn!(sources = ?self.partial_sources, "partially collected sources");
        }
        if !self.failed_indicators.is_empty() {
            warn!(indicators = ?self.failed_indicators, "failed indicators");
        }
        if !self.unresolved_names.is_empty() {
            warn!(
                count = self.unresolved_names.len(),
                names = ?self.unresolved_names,
                "country names without alias"
            );
        }
    }
}

pub struct Etl {
    db: Db,
    collector: Arc<Collector>,
    api: WorldBankApi,
    settings: Settings,
    stop: StopHandle,
    valid_codes: Option<Arc<HashSet<String>>>,
}

impl Etl {
    pub fn new(db: Db, client: FetchClient, settings: Settings) -> Self {
        let api = WorldBankApi::new(&settings.sources.wb_base_url, settings.pipeline.per_page)
            .with_date_range(settings.sources.date_range.clone())
            .with_countries(settings.sources.countries.clone());
        Self {
            db,
            collector: Arc::new(Collector::new(client)),
            api,
            settings,
            stop: StopHandle::default(),
            valid_codes: None,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run `stages` (all when empty) in their canonical order.
    #[instrument(skip_all, fields(stages = stages.len()))]
    pub async fn run(&mut self, stages: &[Stage]) -> RunReport {
        let mut wanted: Vec<Stage> = if stages.is_empty() {
            Stage::ALL.to_vec()
        } else {
            stages.to_vec()
        };
        wanted.sort();
        wanted.dedup();

        let mut report = RunReport::default();
        for stage in wanted {
            if self.stop.is_stopped() {
                report
                    .stages
                    .insert(stage, StageReport::skipped("stop requested"));
                continue;
            }
            info!(stage = stage.name(), "stage start");
            let result = match stage {
                Stage::Countries => self.countries(&mut report).await,
                Stage::Catalog => self.catalog(&mut report).await,
                Stage::Indicators => self.indicators(&mut report).await,
                Stage::Values => self.values(&mut report).await,
                Stage::Cpi => self.cpi(&mut report).await,
                Stage::Happiness => self.happiness(&mut report).await,
            };
            let stage_report = result.unwrap_or_else(|e| StageReport::failed(format!("{e:#}")));
            report.stages.insert(stage, stage_report);
        }
        report
    }

    /// Batch-collect one resource. A skip is recorded and yields `None`.
    async fn collect_or_skip<T: RecordTransform>(
        &self,
        report: &mut RunReport,
        resource: &PagedResource,
        transform: &T,
    ) -> Result<Option<(Vec<T::Row>, CollectReport)>, CollectError> {
        match self.collector.collect(resource, transform).await {
            Ok((rows, collect)) => {
                if collect.stopped_early.is_some() {
                    report.partial_sources.push(resource.url.clone());
                }
                Ok(Some((rows, collect)))
            }
            Err(e) if e.is_skip() => {
                report.skipped_sources.push(resource.url.clone());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn countries(&mut self, report: &mut RunReport) -> Result<StageReport> {
        let resource = self.api.countries();
        let transform = CountryTransform::new(&self.settings.sources.countries);
        let Some((records, collect)) = self.collect_or_skip(report, &resource, &transform).await?
        else {
            return Ok(StageReport::skipped("country list unavailable"));
        };

        let regions: Vec<RegionRow> = records.iter().filter_map(|r| r.region.clone()).collect();
        let countries: Vec<CountryRow> = records.into_iter().map(|r| r.country).collect();

        let mut written = insert_regions(&self.db, &regions).await?;
        written += upsert_countries(&self.db, &countries).await?;

        let codes = load_country_codes(&self.db).await?;
        let aliases = build_alias_rows(
            &countries,
            &self.settings.sources.supplementary_aliases,
            |code| codes.contains(code),
        );
        written += insert_aliases(&self.db, &aliases).await?;
        self.valid_codes = Some(Arc::new(codes));

        Ok(StageReport::ok(written).counting(&collect))
    }

    async fn catalog(&mut self, report: &mut RunReport) -> Result<StageReport> {
        let mut stage = StageReport::ok(0);

        let sources = self.api.sources();
        if let Some((rows, collect)) = self
            .collect_or_skip(report, &sources, &SourceTransform)
            .await?
        {
            stage.written += insert_sources(&self.db, &rows).await?;
            stage = stage.counting(&collect);
        }

        let topics = self.api.topics();
        if let Some((rows, collect)) = self
            .collect_or_skip(report, &topics, &TopicTransform)
            .await?
        {
            stage.written += insert_topics(&self.db, &rows).await?;
            stage = stage.counting(&collect);
        }
        Ok(stage)
    }

    async fn indicators(&mut self, report: &mut RunReport) -> Result<StageReport> {
        let mut stage = StageReport::ok(0);
        let mut indicators: Vec<IndicatorRow> = Vec::new();
        let mut links: Vec<IndicatorTopicRow> = Vec::new();

        for id in self.settings.sources.indicators.clone() {
            let resource = self.api.indicator(&id);
            match self
                .collect_or_skip(report, &resource, &IndicatorTransform)
                .await
            {
                Ok(Some((records, collect))) => {
                    stage = stage.counting(&collect);
                    for rec in records {
                        links.extend(rec.topics);
                        indicators.push(rec.indicator);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(indicator = %id, error = %e, "indicator metadata unavailable");
                    report.skipped_sources.push(resource.url.clone());
                }
            }
        }

        stage.written += insert_indicators(&self.db, &indicators).await?;
        stage.written += insert_indicator_topics(&self.db, &links).await?;
        Ok(stage)
    }

    async fn values(&mut self, report: &mut RunReport) -> Result<StageReport> {
        let valid = match &self.valid_codes {
            Some(codes) => Some(codes.clone()),
            None => {
                let codes = load_country_codes(&self.db).await?;
                if codes.is_empty() {
                    warn!("no stored countries; observations are not filtered by country");
                    None
                } else {
                    Some(Arc::new(codes))
                }
            }
        };

        let pipeline = Pipeline::new(
            self.settings.pipeline.workers,
            self.settings.pipeline.queue_capacity,
        )
        .with_stop_handle(self.stop.clone());
        let items = self.api.value_items(&self.settings.sources.indicators);
        let mut writer = FactWriter::new(self.db.clone(), self.settings.pipeline.fact_batch_size);

        let outcome = pipeline
            .run(
                self.collector.clone(),
                Arc::new(FactTransform::new(valid)),
                items,
                &mut writer,
            )
            .await;
        let pipeline_report = match outcome {
            Ok(r) => r,
            Err(e) => {
                let r = e.into_report();
                report.failed_indicators.extend(r.failed_items());
                r
            }
        };
        Ok(self.summarize_pipeline(report, &pipeline_report))
    }

    fn summarize_pipeline(&self, report: &mut RunReport, p: &PipelineReport) -> StageReport {
        let mut stage = StageReport::ok(p.rows_written);
        for (id, item) in &p.items {
            match &item.outcome {
                Some(ItemOutcome::Completed(collect)) => {
                    stage = stage.counting(collect);
                    if collect.stopped_early.is_some() {
                        report.partial_sources.push(id.clone());
                    }
                }
                Some(ItemOutcome::Skipped { .. }) => report.skipped_sources.push(id.clone()),
                _ => {}
            }
        }
        let failed = p.failed_items();
        if !failed.is_empty() {
            stage.status = StageStatus::Failed(format!("{} indicator(s) failed", failed.len()));
        } else if p.cancelled {
            stage.status = StageStatus::Skipped("stop requested during fetch".to_string());
        }
        stage
    }

    async fn cpi(&mut self, report: &mut RunReport) -> Result<StageReport> {
        let url = self.settings.sources.cpi_url.clone();
        match fetch_cpi(self.collector.client(), &url, &self.settings.sources.cpi_table).await {
            Ok(records) => {
                let mut source = cpi_source();
                source.source_url = Some(url);
                self.write_scores(report, &records, source, cpi_indicator())
                    .await
            }
            Err(e) => {
                report.skipped_sources.push(url);
                Ok(StageReport::skipped(e.to_string()))
            }
        }
    }

    async fn happiness(&mut self, report: &mut RunReport) -> Result<StageReport> {
        let Some(location) = self.settings.sources.happiness_csv.clone() else {
            return Ok(StageReport::skipped("HAPPINESS_CSV not set"));
        };
        match load_happiness(self.collector.client(), &location).await {
            Ok(records) => {
                self.write_scores(report, &records, happiness_source(), happiness_indicator())
                    .await
            }
            Err(e) => {
                report.skipped_sources.push(location);
                Ok(StageReport::skipped(e.to_string()))
            }
        }
    }

    /// Resolve names through the stored aliases and upsert the scores as facts.
    async fn write_scores(
        &self,
        report: &mut RunReport,
        records: &[ScoreRecord],
        source: SourceRow,
        indicator: IndicatorRow,
    ) -> Result<StageReport> {
        let resolver = AliasResolver::from_pairs(load_aliases(&self.db).await?);
        if resolver.is_empty() {
            warn!("alias table is empty; run the countries stage first");
        }
        let resolved = resolve_scores(records, &indicator.indicator_id, &resolver);

        let mut written = insert_sources(&self.db, &[source]).await?;
        written += insert_indicators(&self.db, &[indicator]).await?;
        written += upsert_facts(
            &self.db,
            &resolved.facts.rows,
            self.settings.pipeline.fact_batch_size,
        )
        .await?;
        report.unresolved_names.extend(resolved.unresolved);

        Ok(StageReport {
            status: StageStatus::Ok,
            written,
            dropped: resolved.facts.dropped,
            filtered: resolved.facts.filtered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_report_accumulates_collect_counts() {
        let collect = CollectReport {
            dropped: 2,
            filtered: 3,
            ..Default::default()
        };
        let r = StageReport::ok(5).counting(&collect).counting(&collect);
        assert_eq!((r.written, r.dropped, r.filtered), (5, 4, 6));
    }

    #[test]
    fn failures_are_visible_in_run_report() {
        let mut report = RunReport::default();
        assert!(!report.has_failures());
        report.stages.insert(Stage::Cpi, StageReport::skipped("offline"));
        assert!(!report.has_failures());
        report.stages.insert(Stage::Values, StageReport::failed("db"));
        assert!(report.has_failures());
    }
}
