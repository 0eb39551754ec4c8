//! Paging through World Bank style `[meta, rows]` JSON envelopes.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::{CollectError, FetchError};
use crate::http::client::FetchClient;
use crate::normalization::records::{coerce_u32, RecordTransform};

/// A paginated endpoint. `page_url` adds `format=json`, `per_page`, `page`, the optional
/// `date` filter and any extra pairs to the base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedResource {
    pub url: String,
    pub per_page: u32,
    pub date: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl PagedResource {
    pub fn new(url: impl Into<String>, per_page: u32) -> Self {
        Self {
            url: url.into(),
            per_page: per_page.max(1),
            date: None,
            extra: Vec::new(),
        }
    }

    pub fn with_date(mut self, date: Option<String>) -> Self {
        self.date = date;
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    pub fn page_url(&self, page: u32) -> Result<String, FetchError> {
        let mut url = url::Url::parse(&self.url).map_err(|e| FetchError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("format", "json");
            q.append_pair("per_page", &self.per_page.to_string());
            q.append_pair("page", &page.to_string());
            if let Some(date) = &self.date {
                q.append_pair("date", date);
            }
            for (k, v) in &self.extra {
                q.append_pair(k, v);
            }
        }
        Ok(url.to_string())
    }
}

/// One decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub number: u32,
    pub pages: u32,
    pub total: Option<u32>,
    pub rows: Vec<Value>,
}

/// Decode `[meta, rows]`. A `[{"message": [...]}]` body is an API-level error; `rows` may be
/// `null` on an empty result. `page`/`pages` arrive as numbers or numeric strings.
pub fn parse_envelope(body: &[u8]) -> Result<Page, String> {
    let value: Value = serde_json::from_slice(body).map_err(|e| format!("invalid json: {e}"))?;
    let parts = value
        .as_array()
        .ok_or_else(|| "envelope is not a json array".to_string())?;
    let meta = parts
        .first()
        .and_then(Value::as_object)
        .ok_or_else(|| "envelope has no metadata object".to_string())?;

    if let Some(message) = meta.get("message") {
        return Err(format!("api error: {}", api_message(message)));
    }

    let rows = match parts.get(1) {
        Some(Value::Array(rows)) => rows.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => return Err(format!("unexpected data element: {other}")),
    };

    Ok(Page {
        number: coerce_u32(meta.get("page")).unwrap_or(1),
        pages: coerce_u32(meta.get("pages")).unwrap_or(1),
        total: coerce_u32(meta.get("total")),
        rows,
    })
}

fn api_message(message: &Value) -> String {
    match message {
        Value::Array(items) => items
            .iter()
            .map(|m| {
                m.get("value")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| m.to_string())
            })
            .collect::<Vec<_>>()
            .join("; "),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFlow {
    Continue,
    Stop,
}

/// Receives transformed rows one page at a time.
#[async_trait]
pub trait ChunkSink<R: Send + 'static>: Send {
    async fn accept(&mut self, chunk: Vec<R>) -> SinkFlow;
}

#[async_trait]
impl<R: Send + 'static> ChunkSink<R> for Vec<R> {
    async fn accept(&mut self, chunk: Vec<R>) -> SinkFlow {
        self.extend(chunk);
        SinkFlow::Continue
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFailure {
    pub page: u32,
    pub status: Option<u16>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectReport {
    pub pages_fetched: u32,
    pub pages_total: u32,
    pub rows: usize,
    pub dropped: usize,
    pub filtered: usize,
    /// Set when a page after the first failed; rows from earlier pages were still delivered.
    pub stopped_early: Option<PageFailure>,
    /// The sink asked to stop before all pages were read.
    pub cancelled: bool,
}

enum PageError {
    Network(FetchError),
    Status(u16, String),
    Decode(String),
}

impl PageError {
    fn status(&self) -> Option<u16> {
        match self {
            PageError::Status(code, _) => Some(*code),
            _ => None,
        }
    }

    fn reason(&self) -> String {
        match self {
            PageError::Network(e) => e.to_string(),
            PageError::Status(code, body) => format!("http {code}: {body}"),
            PageError::Decode(reason) => reason.clone(),
        }
    }
}

/// Walks a [`PagedResource`] page by page, transforming each page as it arrives.
#[derive(Clone)]
pub struct Collector {
    client: FetchClient,
}

impl Collector {
    pub fn new(client: FetchClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &FetchClient {
        &self.client
    }

    /// Batch mode: every row in page order.
    pub async fn collect<T: RecordTransform>(
        &self,
        resource: &PagedResource,
        transform: &T,
    ) -> Result<(Vec<T::Row>, CollectReport), CollectError> {
        let mut rows = Vec::new();
        let report = self.collect_into(resource, transform, &mut rows).await?;
        Ok((rows, report))
    }

    /// Streaming mode: each non-empty transformed page goes to `sink` before the next page is
    /// requested.
    ///
    /// Page 1 decides the resource's fate: a network error propagates, any other failure
    /// yields [`CollectError::Skipped`]. A failure on a later page ends the walk with what was
    /// already delivered and is recorded in [`CollectReport::stopped_early`].
    #[instrument(skip(self, transform, sink), fields(url = %resource.url))]
    pub async fn collect_into<T, S>(
        &self,
        resource: &PagedResource,
        transform: &T,
        sink: &mut S,
    ) -> Result<CollectReport, CollectError>
    where
        T: RecordTransform,
        S: ChunkSink<T::Row> + ?Sized,
    {
        let mut report = CollectReport::default();

        let first = match self.fetch_page(resource, 1).await {
            Ok(page) => page,
            Err(PageError::Network(e)) => return Err(CollectError::Network(e)),
            Err(e) => {
                warn!(status = ?e.status(), reason = %e.reason(), "first page unusable; skipping resource");
                return Err(CollectError::Skipped {
                    url: resource.url.clone(),
                    status: e.status(),
                    reason: e.reason(),
                });
            }
        };
        report.pages_total = first.pages;
        report.pages_fetched = 1;
        if first.rows.is_empty() {
            debug!("resource returned no rows");
            return Ok(report);
        }
        if Self::emit(transform, &first, sink, &mut report).await == SinkFlow::Stop {
            report.cancelled = true;
            return Ok(report);
        }

        for number in 2..=first.pages {
            match self.fetch_page(resource, number).await {
                Ok(page) if page.rows.is_empty() => break,
                Ok(page) => {
                    report.pages_fetched += 1;
                    if Self::emit(transform, &page, sink, &mut report).await == SinkFlow::Stop {
                        report.cancelled = true;
                        break;
                    }
                }
                Err(e) => {
                    warn!(page = number, status = ?e.status(), reason = %e.reason(), "page failed; keeping rows collected so far");
                    report.stopped_early = Some(PageFailure {
                        page: number,
                        status: e.status(),
                        reason: e.reason(),
                    });
                    break;
                }
            }
        }

        info!(
            pages = report.pages_fetched,
            of = report.pages_total,
            rows = report.rows,
            dropped = report.dropped,
            filtered = report.filtered,
            "collected"
        );
        Ok(report)
    }

    async fn emit<T, S>(
        transform: &T,
        page: &Page,
        sink: &mut S,
        report: &mut CollectReport,
    ) -> SinkFlow
    where
        T: RecordTransform,
        S: ChunkSink<T::Row> + ?Sized,
    {
        let out = transform.transform(&page.rows);
        report.dropped += out.dropped;
        report.filtered += out.filtered;
        if out.rows.is_empty() {
            return SinkFlow::Continue;
        }
        report.rows += out.rows.len();
        sink.accept(out.rows).await
    }

    async fn fetch_page(&self, resource: &PagedResource, number: u32) -> Result<Page, PageError> {
        let url = resource.page_url(number).map_err(PageError::Network)?;
        let resp = self
            .client
            .fetch_with_retry(&url)
            .await
            .map_err(PageError::Network)?;
        if !resp.is_success() {
            let body: String = resp.text().chars().take(200).collect();
            return Err(PageError::Status(resp.status, body));
        }
        parse_envelope(&resp.body).map_err(PageError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn page_url_appends_query() {
        let r = PagedResource::new("https://api.worldbank.org/v2/country/all/indicator/SP.POP.TOTL", 500)
            .with_date(Some("2015:2020".into()))
            .with_query("source", "2");
        let url = r.page_url(3).unwrap();
        assert!(url.contains("format=json"));
        assert!(url.contains("per_page=500"));
        assert!(url.contains("page=3"));
        assert!(url.contains("date=2015%3A2020"));
        assert!(url.ends_with("source=2"));
    }

    #[test]
    fn page_url_rejects_garbage() {
        let r = PagedResource::new("not a url", 10);
        assert!(matches!(r.page_url(1), Err(FetchError::InvalidUrl { .. })));
    }

    #[test]
    fn envelope_accepts_string_counters_and_null_data() {
        let body = json!([{"page": "1", "pages": "4", "per_page": "50", "total": "170"}, null]);
        let page = parse_envelope(body.to_string().as_bytes()).unwrap();
        assert_eq!(page.pages, 4);
        assert_eq!(page.total, Some(170));
        assert!(page.rows.is_empty());
    }

    #[test]
    fn envelope_surfaces_api_message() {
        let body = json!([{"message": [{"id": "120", "key": "Invalid value", "value": "The provided parameter value is not valid"}]}]);
        let err = parse_envelope(body.to_string().as_bytes()).unwrap_err();
        assert!(err.contains("not valid"));
    }

    #[test]
    fn envelope_rejects_objects() {
        assert!(parse_envelope(br#"{"page":1}"#).is_err());
        assert!(parse_envelope(b"<html>").is_err());
    }
}
