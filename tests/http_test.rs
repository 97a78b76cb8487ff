use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;

use sensorhub_ingest::{
    broker::ConnectionState,
    parser::{Parser, TemperatureBounds},
    pipeline::{Ingestor, Outcome, PipelineStats},
    queue::Delivery,
    routes::{self, AppState},
    scheduler::{IntervalScheduler, Intervals, SamplingMode},
    store::Store,
};

// ---

#[derive(Debug, Deserialize)]
struct ReadingBody {
    hub_id: String,
    sensor_id: String,
    temperature: f64,
    observed_at: DateTime<Utc>,
}

struct TestServer {
    base: String,
    ingestor: Arc<Ingestor>,
    link: watch::Sender<ConnectionState>,
}

async fn start() -> Result<TestServer> {
    // ---
    let ingestor = Arc::new(
        Ingestor::open(
            Store::open_in_memory().await?,
            Parser::new("topic/sensor", TemperatureBounds::default()),
            IntervalScheduler::new(Intervals::default(), SamplingMode::Testing),
            Arc::new(PipelineStats::default()),
        )
        .await?,
    );
    let (link, status) = watch::channel(ConnectionState::Subscribed);
    let app = routes::router(AppState {
        ingestor: ingestor.clone(),
        link: status,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr: SocketAddr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Ok(TestServer {
        base: format!("http://{addr}"),
        ingestor,
        link,
    })
}

fn message(sensor: &str, second: u32, temp: f64) -> Delivery {
    // ---
    let body = json!({
        "temp": temp,
        "humidity": 50.0,
        "moisture": 30.0,
        "date": {"year": 2025, "month": 3, "day": 26, "hour": 18, "minute": 45, "second": second}
    });
    Delivery::new(format!("topic/sensor/H-0/{sensor}"), body.to_string())
}

#[tokio::test]
async fn health_reports_broker_link() -> Result<()> {
    // ---
    let server = start().await?;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(format!("{}/health", server.base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["broker"], "connected");
    assert_eq!(body["link_state"], "subscribed");
    assert_eq!(body["sampling_mode"], "testing");
    assert_eq!(body["interval_secs"], 10);

    server.link.send(ConnectionState::Degraded)?;
    let response = client.get(format!("{}/health", server.base)).send().await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await?;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["broker"], "not connected");
    Ok(())
}

#[tokio::test]
async fn readings_and_identities_are_queryable() -> Result<()> {
    // ---
    let server = start().await?;
    let client = reqwest::Client::new();

    for second in [0, 20, 40] {
        assert_eq!(
            server.ingestor.ingest(&message("S-0", second, 20.0 + second as f64)).await,
            Outcome::Stored
        );
    }
    server.ingestor.ingest(&message("S-1", 0, 18.0)).await;

    let readings: Vec<ReadingBody> = client
        .get(format!("{}/readings", server.base))
        .query(&[
            ("hub_id", "H-0"),
            ("sensor_id", "S-0"),
            ("from", "2025-03-26T18:45:10Z"),
            ("to", "2025-03-26T18:45:40Z"),
        ])
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(readings.len(), 2);
    assert!(readings.iter().all(|r| r.hub_id == "H-0" && r.sensor_id == "S-0"));
    assert_eq!(readings[0].temperature, 40.0);
    assert!(readings[0].observed_at < readings[1].observed_at);

    let all: Vec<ReadingBody> = client
        .get(format!("{}/readings", server.base))
        .query(&[("hub_id", "H-0"), ("sensor_id", "S-0")])
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(all.len(), 3);

    let hubs: Value = client
        .get(format!("{}/hubs", server.base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(hubs, json!([{"hub_id": "H-0"}]));

    let sensors: Vec<Value> = client
        .get(format!("{}/sensors", server.base))
        .send()
        .await?
        .json()
        .await?;
    let names: Vec<_> = sensors.iter().map(|s| s["sensor_id"].clone()).collect();
    assert_eq!(names, vec![json!("S-0"), json!("S-1")]);
    Ok(())
}

#[tokio::test]
async fn inverted_range_is_a_bad_request() -> Result<()> {
    // ---
    let server = start().await?;

    let response = reqwest::Client::new()
        .get(format!("{}/readings", server.base))
        .query(&[
            ("hub_id", "H-0"),
            ("sensor_id", "S-0"),
            ("from", "2025-03-27T00:00:00Z"),
            ("to", "2025-03-26T00:00:00Z"),
        ])
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn admin_mode_switch_and_reset() -> Result<()> {
    // ---
    let server = start().await?;
    let client = reqwest::Client::new();
    server.ingestor.ingest(&message("S-0", 0, 21.0)).await;

    let body: Value = client
        .put(format!("{}/admin/mode", server.base))
        .json(&json!({"mode": "normal"}))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["previous"], "testing");
    assert_eq!(body["mode"], "normal");
    assert_eq!(body["interval_secs"], 1800);
    assert_eq!(server.ingestor.scheduler().mode(), SamplingMode::Normal);

    let response = client
        .put(format!("{}/admin/mode", server.base))
        .json(&json!({"mode": "hourly"}))
        .send()
        .await?;
    assert!(response.status().is_client_error());

    let response = client
        .post(format!("{}/admin/reset", server.base))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let sensors: Vec<Value> = client
        .get(format!("{}/sensors", server.base))
        .send()
        .await?
        .json()
        .await?;
    assert!(sensors.is_empty());
    assert_eq!(server.ingestor.store().count_readings().await?, 0);
    Ok(())
}
