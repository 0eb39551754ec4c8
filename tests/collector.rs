mod common;

use common::{client, observation, Reply, Routes, BASE};
use serde_json::json;
use worldbank_etl::error::CollectError;
use worldbank_etl::http::client::FetchResponse;
use worldbank_etl::http::paginate::{Collector, PagedResource};
use worldbank_etl::normalization::records::FactTransform;

fn series_url() -> String {
    format!("{BASE}/country/all/indicator/SP.POP.TOTL")
}

fn resource() -> PagedResource {
    PagedResource::new(series_url(), 50)
}

#[tokio::test]
async fn walks_every_advertised_page_in_order() {
    let routes = Routes::new();
    for page in 1..=3 {
        let year = (2000 + page).to_string();
        routes.page(
            &series_url(),
            page,
            3,
            json!([observation("SP.POP.TOTL", "AUT", &year, json!(8.0))]),
        );
    }
    let collector = Collector::new(client(&routes));

    let (rows, report) = collector
        .collect(&resource(), &FactTransform::new(None))
        .await
        .unwrap();

    assert_eq!(routes.calls_to(&series_url()), vec![1, 2, 3]);
    assert_eq!(rows.iter().map(|r| r.year).collect::<Vec<_>>(), vec![2001, 2002, 2003]);
    assert_eq!(report.pages_fetched, 3);
    assert_eq!(report.pages_total, 3);
    assert!(report.stopped_early.is_none());
}

#[tokio::test]
async fn later_page_failure_keeps_earlier_rows() {
    let routes = Routes::new();
    routes
        .page(
            &series_url(),
            1,
            3,
            json!([
                observation("SP.POP.TOTL", "AUT", "2020", json!(1.0)),
                observation("SP.POP.TOTL", "BEL", "2020", json!(null)),
            ]),
        )
        .status(&series_url(), 2, 502);
    let collector = Collector::new(client(&routes));

    let (rows, report) = collector
        .collect(&resource(), &FactTransform::new(None))
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(report.dropped, 1);
    let failure = report.stopped_early.expect("page 2 failure is recorded");
    assert_eq!(failure.page, 2);
    assert_eq!(failure.status, Some(502));
    // page 3 is never requested
    assert_eq!(routes.calls_to(&series_url()), vec![1, 2]);
}

#[tokio::test]
async fn first_page_server_error_skips_the_resource() {
    let routes = Routes::new();
    routes.status(&series_url(), 1, 500);
    let collector = Collector::new(client(&routes));

    let err = collector
        .collect(&resource(), &FactTransform::new(None))
        .await
        .unwrap_err();

    assert!(err.is_skip());
    assert!(matches!(err, CollectError::Skipped { status: Some(500), .. }));
    assert_eq!(routes.calls().len(), 1, "5xx is not retried");
}

#[tokio::test]
async fn first_page_network_error_is_not_a_skip() {
    let routes = Routes::new();
    routes.on(&series_url(), 1, Reply::NetworkDown);
    let collector = Collector::new(client(&routes));

    let err = collector
        .collect(&resource(), &FactTransform::new(None))
        .await
        .unwrap_err();
    assert!(matches!(err, CollectError::Network(_)));
}

#[tokio::test]
async fn api_message_envelope_is_skipped() {
    let routes = Routes::new();
    routes.body(
        &series_url(),
        r#"[{"message":[{"id":"175","key":"Invalid format","value":"The indicator was not found."}]}]"#,
    );
    let collector = Collector::new(client(&routes));

    let err = collector
        .collect(&resource(), &FactTransform::new(None))
        .await
        .unwrap_err();
    assert!(matches!(err, CollectError::Skipped { status: None, .. }));
}

#[tokio::test]
async fn rate_limit_is_retried_inside_a_page() {
    let routes = Routes::new();
    routes
        .status(&series_url(), 1, 429)
        .page(
            &series_url(),
            1,
            1,
            json!([observation("SP.POP.TOTL", "AUT", "2020", json!(9.1))]),
        );
    let collector = Collector::new(client(&routes));

    let (rows, _) = collector
        .collect(&resource(), &FactTransform::new(None))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(routes.calls_to(&series_url()), vec![1, 1]);
}

#[tokio::test]
async fn multibyte_error_body_is_cut_on_a_char_boundary() {
    let routes = Routes::new();
    let body = format!("{}ü tail", "a".repeat(199));
    routes
        .page(
            &series_url(),
            1,
            2,
            json!([observation("SP.POP.TOTL", "AUT", "2020", json!(1.0))]),
        )
        .on(
            &series_url(),
            2,
            Reply::Respond(FetchResponse::new(503, body)),
        );
    let collector = Collector::new(client(&routes));

    let (rows, report) = collector
        .collect(&resource(), &FactTransform::new(None))
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    let failure = report.stopped_early.expect("page 2 failure is recorded");
    assert_eq!(failure.status, Some(503));
    assert!(failure.reason.ends_with('ü'));
}
