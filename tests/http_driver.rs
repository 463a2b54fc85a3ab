use std::{sync::Arc, time::Duration};

use mockito::Matcher;
use tokio::net::TcpListener;
use volley::{
    IterationError, MetricsAggregator, Recorder, Stat,
    aggregator::MetricSelector,
    driver::{HttpDriver, HttpOptions, http},
    metric::names,
};

fn driver() -> (Arc<MetricsAggregator>, HttpDriver) {
    let aggregator = Arc::new(MetricsAggregator::new());
    let recorder = Recorder::new(Arc::clone(&aggregator)).with_tags([("scenario", "orders")]);
    let client = http::client(false).unwrap();
    (aggregator, HttpDriver::new(client, recorder))
}

fn select(s: &str) -> MetricSelector {
    s.parse().unwrap()
}

#[tokio::test]
async fn records_successful_requests() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/spot/orders")
        .match_query(Matcher::Any)
        .match_header("content-type", "application/json")
        .match_header("x-user-id", "1")
        .with_status(201)
        .with_body(r#"{"id":1}"#)
        .expect(3)
        .create_async()
        .await;

    let (aggregator, http) = driver();
    let options = HttpOptions::builder()
        .headers(vec![
            ("Content-Type".into(), "application/json".into()),
            ("X-User-ID".into(), "1".into()),
        ])
        .timeout(Duration::from_secs(5))
        .name("place_order")
        .build();
    for i in 0..3 {
        let url = format!("{}/spot/orders?user={i}", server.url());
        let resp = http
            .post(&url, r#"{"side":"sell","market":"BTC_USDT"}"#, &options)
            .await
            .unwrap();
        assert_eq!(resp.status, 201);
        assert!(resp.is_success());
        assert_eq!(resp.body, br#"{"id":1}"#);
        assert_eq!(resp.body_len(), 8);
    }
    mock.assert_async().await;

    let snap = aggregator.finalize().unwrap();
    assert_eq!(snap.counter(names::HTTP_REQS), 3.0);
    // the name tag groups URLs that differ in their query
    let grouped = select("http_reqs{name:place_order,method:POST,status:201,scenario:orders}");
    assert_eq!(snap.stat(&grouped, &Stat::Count), Some(3.0));
    let failed = MetricSelector::metric(names::HTTP_REQ_FAILED);
    assert_eq!(snap.stat(&failed, &Stat::Rate), Some(0.0));
    let duration = MetricSelector::metric(names::HTTP_REQ_DURATION);
    assert!(snap.stat(&duration, &Stat::Max).unwrap() > 0.0);
}

#[tokio::test]
async fn server_errors_are_responses_recorded_as_failed() {
    let mut server = mockito::Server::new_async().await;
    let ok = server.mock("GET", "/ok").with_status(200).create_async().await;
    let broken = server
        .mock("GET", "/broken")
        .with_status(500)
        .with_body("boom")
        .create_async()
        .await;

    let (aggregator, http) = driver();
    let options = HttpOptions::default();
    let resp = http
        .get(&format!("{}/broken", server.url()), &options)
        .await
        .unwrap();
    assert_eq!(resp.status, 500);
    assert!(!resp.is_success());
    assert_eq!(resp.body, b"boom");
    http.get(&format!("{}/ok", server.url()), &options)
        .await
        .unwrap();
    broken.assert_async().await;
    ok.assert_async().await;

    let snap = aggregator.finalize().unwrap();
    let failed = MetricSelector::metric(names::HTTP_REQ_FAILED);
    assert_eq!(snap.stat(&failed, &Stat::Rate), Some(0.5));
    let failed_500 = select("http_req_failed{status:500}");
    assert_eq!(snap.stat(&failed_500, &Stat::Rate), Some(1.0));
}

#[tokio::test]
async fn timeouts_are_recorded_at_the_timeout() {
    // accepts connections and never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let (aggregator, http) = driver();
    let options = HttpOptions::builder()
        .timeout(Duration::from_millis(200))
        .build();
    let err = http
        .get(&format!("http://{addr}/slow"), &options)
        .await
        .unwrap_err();
    assert!(
        matches!(err, IterationError::Timeout { after } if after == Duration::from_millis(200)),
        "{err:?}"
    );
    server.abort();

    let snap = aggregator.finalize().unwrap();
    let timeouts = select("http_reqs{error:timeout}");
    assert_eq!(snap.stat(&timeouts, &Stat::Count), Some(1.0));
    let duration = MetricSelector::metric(names::HTTP_REQ_DURATION);
    assert_eq!(snap.stat(&duration, &Stat::Max), Some(200.0));
    let failed = MetricSelector::metric(names::HTTP_REQ_FAILED);
    assert_eq!(snap.stat(&failed, &Stat::Rate), Some(1.0));
}

#[tokio::test]
async fn refused_connections_are_connection_errors() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let (aggregator, http) = driver();
    let err = http
        .get(&format!("http://{addr}/"), &HttpOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, IterationError::Connection(_)), "{err:?}");

    let snap = aggregator.finalize().unwrap();
    let refused = select("http_reqs{error:connection}");
    assert_eq!(snap.stat(&refused, &Stat::Count), Some(1.0));
    assert_eq!(
        snap.stat(&MetricSelector::metric(names::HTTP_REQ_FAILED), &Stat::Rate),
        Some(1.0)
    );
}
