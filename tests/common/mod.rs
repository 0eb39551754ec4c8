#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use worldbank_etl::error::FetchError;
use worldbank_etl::http::client::{FetchClient, FetchResponse, RetryPolicy, Transport};

pub const BASE: &str = "http://wb.test/v2";

pub enum Reply {
    Respond(FetchResponse),
    NetworkDown,
}

/// In-process transport answering by `(path, page)`. Unknown routes answer 404.
#[derive(Default)]
pub struct Routes {
    replies: Mutex<HashMap<(String, u32), VecDeque<Reply>>>,
    calls: Mutex<Vec<String>>,
}

fn route_key(raw: &str) -> (String, u32) {
    let url = url::Url::parse(raw).expect("test urls are absolute");
    let page = url
        .query_pairs()
        .find(|(k, _)| k == "page")
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(1);
    let mut base = url.clone();
    base.set_query(None);
    (base.to_string(), page)
}

impl Routes {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, url: &str, page: u32, reply: Reply) -> &Self {
        self.replies
            .lock()
            .unwrap()
            .entry((url.to_string(), page))
            .or_default()
            .push_back(reply);
        self
    }

    pub fn page(&self, url: &str, page: u32, pages: u32, rows: Value) -> &Self {
        self.on(url, page, Reply::Respond(envelope(page, pages, rows)))
    }

    pub fn status(&self, url: &str, page: u32, status: u16) -> &Self {
        self.on(url, page, Reply::Respond(FetchResponse::new(status, "upstream trouble")))
    }

    pub fn body(&self, url: &str, body: &str) -> &Self {
        self.on(url, 1, Reply::Respond(FetchResponse::new(200, body.to_string())))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> Vec<u32> {
        self.calls()
            .iter()
            .map(|c| route_key(c))
            .filter(|(u, _)| u == url)
            .map(|(_, p)| p)
            .collect()
    }
}

#[async_trait]
impl Transport for Routes {
    async fn get(&self, url: &str, _timeout: Duration) -> Result<FetchResponse, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        let key = route_key(url);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|q| if q.len() > 1 { q.pop_front() } else { q.front().map(clone_reply) });
        match reply {
            Some(Reply::Respond(resp)) => Ok(resp),
            Some(Reply::NetworkDown) => Err(FetchError::network(url, "connection refused")),
            None => Ok(FetchResponse::new(404, "no such route")),
        }
    }
}

fn clone_reply(r: &Reply) -> Reply {
    match r {
        Reply::Respond(resp) => Reply::Respond(resp.clone()),
        Reply::NetworkDown => Reply::NetworkDown,
    }
}

pub fn envelope(page: u32, pages: u32, rows: Value) -> FetchResponse {
    let body = json!([
        {"page": page, "pages": pages, "per_page": 50, "total": pages * 50},
        rows
    ]);
    FetchResponse::new(200, body.to_string())
}

pub fn client(routes: &Arc<Routes>) -> FetchClient {
    let policy = RetryPolicy {
        max_attempts: 3,
        base_backoff: Duration::from_millis(1),
        timeout: Duration::from_secs(1),
        max_delay: Duration::from_millis(50),
    };
    FetchClient::new(routes.clone(), policy)
}

pub fn observation(indicator: &str, iso3: &str, year: &str, value: Value) -> Value {
    json!({
        "indicator": {"id": indicator, "value": "Some indicator"},
        "country": {"id": &iso3[..2], "value": iso3},
        "countryiso3code": iso3,
        "date": year,
        "value": value,
        "unit": "",
        "obs_status": "",
        "decimal": 0
    })
}

pub fn country(iso3: &str, iso2: &str, name: &str, region: (&str, &str)) -> Value {
    json!({
        "id": iso3,
        "iso2Code": iso2,
        "name": name,
        "region": {"id": region.0, "iso2code": "Z7", "value": region.1},
        "adminregion": {"id": "", "iso2code": "", "value": ""},
        "incomeLevel": {"id": "HIC", "iso2code": "XD", "value": "High income"},
        "lendingType": {"id": "LNX", "iso2code": "XX", "value": "Not classified"},
        "capitalCity": "Capital",
        "longitude": "16.3798",
        "latitude": "48.2201"
    })
}

pub fn aggregate(iso3: &str, name: &str) -> Value {
    json!({
        "id": iso3,
        "iso2Code": "1A",
        "name": name,
        "region": {"id": "NA", "iso2code": "NA", "value": "Aggregates"},
        "incomeLevel": {"id": "NA", "iso2code": "NA", "value": "Aggregates"},
        "capitalCity": "",
        "longitude": "",
        "latitude": ""
    })
}
